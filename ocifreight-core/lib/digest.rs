//! Digest and media-type primitives.
//!
//! Digests themselves are represented with [`oci_spec::image::Digest`] /
//! [`oci_spec::image::DigestAlgorithm`], which already enforce the
//! `algo:lowercase-hex` grammar and the fixed hex length per algorithm (64 for
//! sha256, 128 for sha512). This module adds the pieces `oci-spec` doesn't:
//! [`BlobInfo`], compression-algorithm/operation enums, and media-type
//! sniffing from raw bytes.

use std::str::FromStr;

use oci_spec::image::{Digest, MediaType};
use serde::{Deserialize, Serialize};

use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What the copier intends to do with a layer's compression during a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionOperation {
    /// Keep whatever compression the source blob already has.
    Preserve,
    /// Compress an uncompressed (or differently-compressed) source blob.
    Compress,
    /// Decompress the source blob before writing it to the destination.
    Decompress,
}

/// The compression algorithm (if any) a blob is encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// The blob is stored uncompressed.
    None,
    /// Gzip-compressed.
    Gzip,
    /// Plain zstd.
    Zstd,
    /// zstd with chunk-boundary annotations (`zstd:chunked`), used for
    /// partial/streaming retrieval. Never substitutable against a plain
    /// `required-compression` request — see [`CompressionAlgorithm::is_chunked`].
    ZstdChunked,
    /// A compressor whose identity could not be determined, or whose
    /// identity conflicted across concurrent cache writes (conflicting writes
    /// log a warning and downgrade to unknown).
    Unknown,
}

impl CompressionAlgorithm {
    /// Whether this algorithm is the non-substitutable `zstd:chunked` variant.
    pub fn is_chunked(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZstdChunked)
    }

    /// The canonical name used in the blob-info cache's compressor map.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "uncompressed",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::ZstdChunked => "zstd:chunked",
            CompressionAlgorithm::Unknown => "unknown",
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = OcifreightCoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uncompressed" => CompressionAlgorithm::None,
            "gzip" => CompressionAlgorithm::Gzip,
            "zstd" => CompressionAlgorithm::Zstd,
            "zstd:chunked" => CompressionAlgorithm::ZstdChunked,
            _ => CompressionAlgorithm::Unknown,
        })
    }
}

/// A (digest, size, media-type) triple identifying a blob, with optional
/// compression decorations used by a copy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// The blob's content digest.
    pub digest: Digest,
    /// Declared size in bytes, or `-1` if unknown.
    pub size: i64,
    /// The blob's declared media type.
    pub media_type: MediaType,
    /// What the copier should do about this blob's compression, if anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_operation: Option<CompressionOperation>,
    /// The compression algorithm this blob is (or should be) encoded with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_algorithm: Option<CompressionAlgorithm>,
}

impl BlobInfo {
    /// Builds a `BlobInfo` with no compression decorations.
    pub fn new(digest: Digest, size: i64, media_type: MediaType) -> Self {
        Self {
            digest,
            size,
            media_type,
            compression_operation: None,
            compression_algorithm: None,
        }
    }

    /// Whether the declared size is known (spec: `-1` means "unknown").
    pub fn size_is_known(&self) -> bool {
        self.size >= 0
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a digest literal of the form `sha256:<64 hex>` or `sha512:<128 hex>`.
pub fn parse_digest(s: &str) -> OcifreightCoreResult<Digest> {
    Digest::from_str(s).map_err(|e| OcifreightCoreError::InvalidReference(e.to_string()))
}

/// Sniffs the compression algorithm of a blob from its leading bytes.
///
/// Magic numbers: gzip (`1f 8b`), zstd (`28 b5 2f fd`). Anything else is
/// reported as [`CompressionAlgorithm::None`] (assumed uncompressed) since the
/// chunked zstd footer cannot be distinguished from plain zstd by magic bytes
/// alone — distinguishing them requires inspecting the skippable frame the
/// chunked format appends, which callers with a manifest annotation should
/// prefer over sniffing.
pub fn detect_compression(leading_bytes: &[u8]) -> CompressionAlgorithm {
    if leading_bytes.starts_with(&[0x1f, 0x8b]) {
        CompressionAlgorithm::Gzip
    } else if leading_bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        CompressionAlgorithm::Zstd
    } else {
        CompressionAlgorithm::None
    }
}

/// Guesses a manifest/config media type from its raw JSON bytes, used when a
/// transport (e.g. an OCI archive entry) doesn't carry an explicit media type.
pub fn guess_media_type(bytes: &[u8]) -> OcifreightCoreResult<MediaType> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Ok(MediaType::from(mt));
    }

    // Schema-1 manifests have no `mediaType` field; detect by the presence of
    // `fsLayers`/`history`/`signatures`.
    if value.get("fsLayers").is_some() && value.get("history").is_some() {
        return Ok(MediaType::Other(
            "application/vnd.docker.distribution.manifest.v1+json".to_string(),
        ));
    }

    if value.get("manifests").is_some() {
        return Ok(MediaType::ImageIndex);
    }

    if value.get("config").is_some() && value.get("layers").is_some() {
        return Ok(MediaType::ImageManifest);
    }

    Err(OcifreightCoreError::MalformedManifest(
        "could not guess media type from content".to_string(),
    ))
}

/// Whether a media type identifies an image manifest (any schema).
pub fn is_manifest_media_type(mt: &MediaType) -> bool {
    matches!(mt, MediaType::ImageManifest)
        || matches!(mt, MediaType::Other(s) if s == "application/vnd.docker.distribution.manifest.v2+json"
            || s == "application/vnd.docker.distribution.manifest.v1+json"
            || s == "application/vnd.docker.distribution.manifest.v1+prettyjws")
}

/// Whether a media type identifies a multi-platform index/manifest-list.
pub fn is_index_media_type(mt: &MediaType) -> bool {
    matches!(mt, MediaType::ImageIndex)
        || matches!(mt, MediaType::Other(s) if s == "application/vnd.docker.distribution.manifest.list.v2+json")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_digest_accepts_sha256() {
        let d = parse_digest(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert_eq!(d.algorithm().to_string(), "sha256");
    }

    #[test]
    fn parse_digest_rejects_bad_hex_length() {
        assert!(parse_digest("sha256:abcd").is_err());
    }

    #[test]
    fn detect_compression_recognizes_gzip_and_zstd() {
        assert_eq!(
            detect_compression(&[0x1f, 0x8b, 0x08, 0x00]),
            CompressionAlgorithm::Gzip
        );
        assert_eq!(
            detect_compression(&[0x28, 0xb5, 0x2f, 0xfd]),
            CompressionAlgorithm::Zstd
        );
        assert_eq!(detect_compression(&[0x00, 0x01, 0x02]), CompressionAlgorithm::None);
    }

    #[test]
    fn compression_algorithm_chunked_is_never_substitutable() {
        assert!(CompressionAlgorithm::ZstdChunked.is_chunked());
        assert!(!CompressionAlgorithm::Zstd.is_chunked());
    }

    #[test]
    fn guess_media_type_schema2_manifest() {
        let bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{},"layers":[]}"#;
        let mt = guess_media_type(bytes).unwrap();
        assert!(is_manifest_media_type(&mt));
    }

    #[test]
    fn guess_media_type_schema1_has_no_mediatype_field() {
        let bytes = br#"{"fsLayers":[],"history":[]}"#;
        let mt = guess_media_type(bytes).unwrap();
        assert!(is_manifest_media_type(&mt));
    }
}
