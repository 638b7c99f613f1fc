//! A persistent mapping from a blob digest to its uncompressed-equivalent
//! digest, its compressor identity, and the known `(transport, scope)`
//! locations it has been seen at. Two implementations share the
//! [`BlobInfoCache`] trait: [`memory::MemoryBlobInfoCache`] (process-lifetime)
//! and [`sqlite::SqliteBlobInfoCache`] (persistent, survives process restarts).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use oci_spec::image::Digest;
use ocifreight_utils::config::{BlobInfoCacheBackend, ResolvedConfig};

use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The "replacement attempts" ceiling: the maximum number of candidates any
/// single `candidate_locations`/`candidate_locations2` call returns, across
/// all digests it considers.
pub const REPLACEMENT_ATTEMPTS: usize = 5;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An opaque location reference as recorded by [`BlobInfoCache::record_known_location`].
/// The cache treats this as an uninterpreted string; only the backend that
/// recorded it knows how to turn it back into something fetchable.
pub type Location = String;

/// One candidate returned by [`BlobInfoCache::candidate_locations`]: a
/// location plus the digest it was recorded under (which may differ from the
/// digest originally queried for, when substitution kicked in).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The digest this location was recorded against.
    pub digest: Digest,
    /// The opaque location reference.
    pub location: Location,
}

/// One candidate returned by [`BlobInfoCache::candidate_locations2`]: as
/// [`Candidate`], but additionally carrying the compressor identity the
/// digest is known to use. Candidates whose compressor is unknown are never
/// produced by `candidate_locations2`: a digest with no known compressor is
/// simply omitted from the results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate2 {
    /// The digest this location was recorded against.
    pub digest: Digest,
    /// The opaque location reference.
    pub location: Location,
    /// The compressor this digest's blob is known to be encoded with.
    pub compressor: String,
}

//--------------------------------------------------------------------------------------------------
// Trait
//--------------------------------------------------------------------------------------------------

/// The persistent mapping behind blob reuse decisions.
#[async_trait]
pub trait BlobInfoCache: Send + Sync {
    /// Returns a known uncompressed equivalent for `digest`, or `digest`
    /// itself if it was recorded as already uncompressed (directly, or by
    /// being the *target* of another digest's uncompressed pair). Returns
    /// `None` if nothing is known.
    async fn uncompressed_digest(&self, digest: &Digest) -> OcifreightCoreResult<Option<Digest>>;

    /// Records that `compressed` is a compressed form whose uncompressed
    /// content hashes to `uncompressed` (`compressed == uncompressed` is the
    /// legal way to mark a digest as itself uncompressed). Idempotent; a
    /// later conflicting write for the same `compressed` logs a warning and
    /// overwrites.
    async fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> OcifreightCoreResult<()>;

    /// Records the compressor name for `digest`. Idempotent; a conflicting
    /// write logs a warning and downgrades the stored name to `unknown`.
    async fn record_digest_compressor_name(
        &self,
        digest: &Digest,
        name: &str,
    ) -> OcifreightCoreResult<()>;

    /// Returns the compressor name recorded for `digest`, if any.
    async fn compressor_name(&self, digest: &Digest) -> OcifreightCoreResult<Option<String>>;

    /// Prepends `location` to the known-locations list for `(transport,
    /// scope, digest)`, most-recent first; duplicates of an already-present
    /// location are dropped rather than re-prepended.
    async fn record_known_location(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        location: Location,
    ) -> OcifreightCoreResult<()>;

    /// Legacy candidate listing, kept for destinations that cannot express a
    /// compression constraint. Without
    /// substitution, returns only the exact digest's locations, newest-first.
    /// With substitution, walks: the digest's own locations, then other
    /// digests known to share its uncompressed equivalent, then the
    /// uncompressed digest's own locations — capped at
    /// [`REPLACEMENT_ATTEMPTS`] total.
    async fn candidate_locations(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        can_substitute: bool,
    ) -> OcifreightCoreResult<Vec<Candidate>>;

    /// As [`Self::candidate_locations`], but every candidate also carries its
    /// compressor name, and candidates whose compressor is unknown are
    /// dropped. This is the production path the copy engine prefers.
    async fn candidate_locations2(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        can_substitute: bool,
    ) -> OcifreightCoreResult<Vec<Candidate2>>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens the blob-info cache named by `config.blob_info_cache_backend()`: an
/// in-memory cache for [`BlobInfoCacheBackend::Memory`], or a sqlite pool
/// opened (and migrated) at `config.store_root()` for
/// [`BlobInfoCacheBackend::Sqlite`].
pub async fn open_blob_info_cache(config: &ResolvedConfig) -> OcifreightCoreResult<Box<dyn BlobInfoCache>> {
    match config.blob_info_cache_backend() {
        BlobInfoCacheBackend::Memory => Ok(Box::new(memory::MemoryBlobInfoCache::default())),
        BlobInfoCacheBackend::Sqlite => {
            let db_path = config.store_root().join(ocifreight_utils::OCI_DB_FILENAME);
            let pool = crate::store::db::get_or_create_pool(db_path).await?;
            Ok(Box::new(sqlite::SqliteBlobInfoCache::new(pool)))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
