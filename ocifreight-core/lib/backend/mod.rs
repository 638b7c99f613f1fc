//! The Source/Destination contracts every concrete backend implements, and
//! the reuse-matching rule the copy engine and blob-info cache share.

pub mod layered_store;
pub mod oci_archive;
pub mod oci_layout;
pub mod registry;

use async_trait::async_trait;
use oci_spec::image::MediaType;

use crate::blobinfocache::BlobInfoCache;
use crate::digest::{BlobInfo, CompressionAlgorithm, CompressionOperation};
use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A byte range requested from [`Source::get_blob_at`]: half-open `[start,
/// end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

/// Options narrowing a [`Destination::try_reusing_blob`] match.
#[derive(Debug, Clone, Default)]
pub struct TryReusingBlobOptions {
    /// Whether the cache may be consulted for an uncompressed-equivalent
    /// substitute rather than only the exact digest.
    pub can_substitute: bool,
    /// Manifest formats the destination is willing to write; a candidate's
    /// compression must be valid under at least one.
    pub possible_manifest_formats: Vec<MediaType>,
    /// If set, a candidate must use exactly this compression.
    pub required_compression: Option<CompressionAlgorithm>,
    /// The compression the source blob is already known to use, if any.
    pub original_compression: Option<CompressionAlgorithm>,
    /// Whether this layer is a declared-empty placeholder layer.
    pub empty_layer: bool,
    /// The zero-based index of this layer within the manifest being copied.
    pub layer_index: Option<usize>,
    /// An opaque scope identifying the source this blob is being reused from,
    /// used to partition blob-info cache location lookups.
    pub src_scope: Option<String>,
}

/// Options accompanying a [`Destination::put_blob`] call.
#[derive(Debug, Clone, Default)]
pub struct PutBlobOptions {
    /// Whether this blob is the image's configuration blob rather than a
    /// layer.
    pub is_config: bool,
    /// Whether this is a declared-empty placeholder layer.
    pub empty_layer: bool,
    /// The zero-based index of this layer within the manifest being copied
    /// (`None` for the config blob).
    pub layer_index: Option<usize>,
}

/// Result of a successful [`Destination::try_reusing_blob`] match: the
/// [`BlobInfo`] the caller should record in the destination manifest in place
/// of the originally requested blob.
#[derive(Debug, Clone)]
pub struct ReusedBlob {
    /// The digest/size/media-type to record for this layer going forward.
    pub info: BlobInfo,
}

/// A source backend: one opened, read-only view of an image or index.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetches the manifest bytes and declared media type for the primary
    /// image, or for a specific instance inside a list when `instance_digest`
    /// is given.
    async fn get_manifest(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<(Vec<u8>, MediaType)>;

    /// Opens a streaming reader for a blob, returning the stream alongside
    /// its size as declared by the source (`-1` if unknown).
    async fn get_blob(
        &self,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(Box<dyn tokio::io::AsyncRead + Send + Unpin>, i64)>;

    /// Fetches detached signatures for the primary image or a specific
    /// instance.
    async fn get_signatures(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<Vec<Vec<u8>>>;

    /// When the source wants the copier to substitute digests for layers
    /// (e.g. reporting uncompressed layer identities from a layered store),
    /// returns the substitute infos; `None` means "use the manifest's own
    /// layer infos unmodified".
    async fn layer_infos_for_copy(
        &self,
        instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<Option<Vec<BlobInfo>>>;

    /// Whether concurrent [`Source::get_blob`] calls on this instance are
    /// safe to run in parallel.
    fn has_thread_safe_get_blob(&self) -> bool;

    /// Releases any scoped resources (temp directories, archive readers).
    async fn close(&self) -> OcifreightCoreResult<()> {
        Ok(())
    }
}

/// A destination backend: one opened, write-oriented view of an image target.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Manifest MIME types this destination accepts, in preference order.
    fn supported_manifest_mime_types(&self) -> Vec<MediaType>;

    /// Whether this destination can store detached signatures at all.
    fn supports_signatures(&self) -> bool;

    /// The compression transformation layers should undergo before being
    /// written here.
    fn desired_layer_compression(&self) -> CompressionOperation;

    /// Whether this destination can reference foreign (URL-only) layers
    /// without fetching their bytes.
    fn accepts_foreign_layer_urls(&self) -> bool;

    /// Whether the destination requires the copied image's declared
    /// platform to match the runtime's own.
    fn must_match_runtime_os(&self) -> bool;

    /// Whether this destination ignores an image's embedded Docker
    /// reference rather than requiring it to match the target name.
    fn ignores_embedded_docker_reference(&self) -> bool;

    /// Whether concurrent [`Destination::put_blob`] calls on this instance
    /// are safe to run in parallel.
    fn has_thread_safe_put_blob(&self) -> bool;

    /// Whether [`Source::get_blob_at`]-style partial reads can be written
    /// here incrementally.
    fn supports_put_blob_partial(&self) -> bool;

    /// Streams `reader` into the destination, verifying the declared digest
    /// (if any) and size (if any) as it goes. On any error the partially
    /// written blob is deleted and never observable under its digest.
    async fn put_blob(
        &self,
        reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        info: &BlobInfo,
        options: &PutBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<BlobInfo>;

    /// Attempts to satisfy `info` from an already-stored blob without
    /// re-uploading bytes. Returns `None` on no match (not an error).
    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<Option<ReusedBlob>>;

    /// Stores manifest bytes verbatim, optionally scoped to a specific list
    /// instance.
    async fn put_manifest(&self, bytes: &[u8], instance_digest: Option<&str>) -> OcifreightCoreResult<()>;

    /// Stores detached signatures for a manifest instance. Must be called
    /// after [`Destination::put_manifest`] for the same instance.
    async fn put_signatures_with_format(
        &self,
        signatures: &[Vec<u8>],
        instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<()>;

    /// Finalizes the destination, given the raw bytes of the top-level
    /// manifest/index that was written.
    async fn commit(&self, unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()>;

    /// Releases any scoped resources (temp directories, layer staging area).
    async fn close(&self) -> OcifreightCoreResult<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: reuse matching
//--------------------------------------------------------------------------------------------------

/// Whether a cached candidate's compressor satisfies `options`'s constraints.
/// `zstd:chunked` never matches a `required_compression` constraint,
/// regardless of the candidate: chunk annotations are not retained in the
/// cache, so a caller needing chunked output must always recompress rather
/// than reuse.
pub fn candidate_matches(candidate_compressor: &str, options: &TryReusingBlobOptions) -> bool {
    if let Some(required) = options.required_compression {
        if required.is_chunked() {
            return false;
        }
        if candidate_compressor != required.name() {
            return false;
        }
    }

    if !options.possible_manifest_formats.is_empty() {
        let algorithm: CompressionAlgorithm =
            candidate_compressor.parse().unwrap_or(CompressionAlgorithm::Unknown);
        if !options
            .possible_manifest_formats
            .iter()
            .any(|format| compression_valid_under_format(algorithm, format))
        {
            return false;
        }
    }

    true
}

fn compression_valid_under_format(algorithm: CompressionAlgorithm, format: &MediaType) -> bool {
    match algorithm {
        CompressionAlgorithm::Zstd | CompressionAlgorithm::ZstdChunked => {
            matches!(format, MediaType::ImageManifest | MediaType::ImageIndex)
        }
        _ => true,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
