//! Crate-wide error type for `ocifreight-core`.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ocifreight-core operation.
pub type OcifreightCoreResult<T> = Result<T, OcifreightCoreError>;

/// The error taxonomy for the image engine, mirroring the `kind` distinctions the
/// copy engine and backends need to branch on (manifest-list platform miss vs.
/// not-found vs. digest-mismatch, etc.) rather than a flat bag of variants.
#[derive(pretty_error_debug::Debug, Error)]
pub enum OcifreightCoreError {
    /// A reference string could not be parsed by any registered transport.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A manifest or index blob failed to decode: invalid JSON, an unknown schema
    /// version, or a missing mandatory field.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// A fully-read blob's computed digest did not match the digest it was
    /// declared under.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// The digest the caller declared for the stream.
        expected: String,
        /// The digest actually computed while reading the stream.
        actual: String,
    },

    /// A fully-read blob's byte count did not match its declared size.
    #[error("size mismatch: expected {expected} bytes, counted {actual}")]
    SizeMismatch {
        /// The size the caller declared for the stream.
        expected: i64,
        /// The number of bytes actually counted while reading the stream.
        actual: i64,
    },

    /// The requested manifest or blob does not exist at the source.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not implemented by this backend (e.g. delete on an
    /// OCI-archive destination).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Two images would occupy the same deterministic layered-store id with
    /// different content.
    #[error("duplicate image id: {0}")]
    DuplicateId(String),

    /// A manifest list has no entry matching the requested platform.
    #[error("no manifest matches platform {requested}; available: {available:?}")]
    PlatformMiss {
        /// The platform that was requested (`os/arch[/variant]`).
        requested: String,
        /// The platforms actually present in the index, for diagnostics.
        available: Vec<String>,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O, auth, or protocol failure surfaced by a transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error performing filesystem I/O.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error (de)serializing JSON.
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error from the persistent (sqlite-backed) blob-info cache or layered
    /// store metadata.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error running sqlx migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error from the oci-client registry transport.
    #[error("registry client error: {0}")]
    Registry(#[from] oci_client::errors::OciDistributionError),

    /// An error building or reading an `oci-spec` type.
    #[error("oci-spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An error from the shared ocifreight-utils crate.
    #[error("utils error: {0}")]
    Utils(#[from] ocifreight_utils::OcifreightUtilsError),

    /// A caller supplied an argument that is invalid on its face (not a parse
    /// failure — e.g. combining a token with a username/password for auth).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Custom error, for failures that don't deserve their own variant.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OcifreightCoreError {
    /// Wraps an arbitrary error that doesn't warrant its own variant.
    pub fn custom(error: impl Into<anyhow::Error>) -> OcifreightCoreError {
        OcifreightCoreError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
