//! Docker schema-1 (signed) manifest handling.
//!
//! Schema-1 manifests carry a detached JWS-style envelope: a `signatures` array
//! whose `protected` header names a byte range of the manifest JSON (plus a
//! literal tail) that is what actually gets hashed for the manifest's digest.
//! This lets registries re-sign a manifest (appending another entry to
//! `signatures`) without changing its canonical digest, as long as the
//! unsigned prefix is untouched.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One entry of a schema-1 `fsLayers` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    /// The layer's content digest.
    pub blob_sum: String,
}

/// One entry of a schema-1 `history` array: an opaque, docker-v1-compatible
/// JSON blob describing the image at that point in the layer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    /// The raw (string-encoded) v1-compatibility JSON for this layer.
    pub v1_compatibility: String,
}

/// A full schema-1 signed manifest, parallel `fsLayers`/`history` arrays plus
/// a `signatures` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema1Manifest {
    /// Repository name, e.g. `library/alpine`.
    pub name: String,
    /// Tag within the repository.
    pub tag: String,
    /// Always 1 for schema-1.
    pub schema_version: u32,
    #[serde(rename = "architecture")]
    /// Target architecture.
    pub architecture: String,
    #[serde(rename = "fsLayers")]
    /// Layer digests, ordered from the topmost layer down to the base.
    pub fs_layers: Vec<FsLayer>,
    /// Parallel v1-compatibility history entries.
    pub history: Vec<HistoryEntry>,
    /// The detached JWS signature envelope.
    pub signatures: Vec<Signature>,
}

/// One signature in a schema-1 manifest's envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Base64url-encoded JSON protected header (`{"formatLength":N,"formatTail":"..."}`).
    pub protected: String,
    /// Opaque signing-key header.
    pub header: serde_json::Value,
    /// Base64url-encoded signature bytes.
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses raw manifest bytes as a schema-1 signed manifest.
pub fn parse(bytes: &[u8]) -> OcifreightCoreResult<Schema1Manifest> {
    serde_json::from_slice(bytes).map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))
}

/// Strips the JWS signature envelope from a schema-1 manifest's raw bytes,
/// returning exactly the bytes that get hashed to produce its canonical
/// digest: the first `protected.formatLength` bytes of the manifest,
/// followed by the base64url-decoded `formatTail` of its first signature.
///
/// Per the Docker v2s1 rule, every signature in the envelope must agree on
/// the same unsigned prefix; we take the first and verify the manifest is at
/// least that long.
pub fn strip_signature(bytes: &[u8]) -> OcifreightCoreResult<Vec<u8>> {
    let manifest: Schema1Manifest = parse(bytes)?;
    let first = manifest.signatures.first().ok_or_else(|| {
        OcifreightCoreError::MalformedManifest("schema-1 manifest has no signatures".to_string())
    })?;

    let protected_json = URL_SAFE_NO_PAD
        .decode(&first.protected)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
    let protected: ProtectedHeader = serde_json::from_slice(&protected_json)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

    if protected.format_length > bytes.len() {
        return Err(OcifreightCoreError::MalformedManifest(
            "protected header's formatLength exceeds manifest size".to_string(),
        ));
    }

    let tail = URL_SAFE_NO_PAD
        .decode(&protected.format_tail)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

    let mut unsigned = Vec::with_capacity(protected.format_length + tail.len());
    unsigned.extend_from_slice(&bytes[..protected.format_length]);
    unsigned.extend_from_slice(&tail);
    Ok(unsigned)
}

/// Computes the canonical digest of a schema-1 signed manifest: sha256 of the
/// unsigned prefix produced by [`strip_signature`].
pub fn digest(bytes: &[u8]) -> OcifreightCoreResult<Digest> {
    let unsigned = strip_signature(bytes)?;
    let hash = Sha256::digest(&unsigned);
    Digest::from_str_named("sha256", &hex::encode(hash))
}

// oci-spec's `Digest` only parses `algo:hex` strings; this small helper lets
// schema1::digest build one from already-separated parts without a round
// trip through string formatting + parsing twice.
trait DigestExt {
    fn from_str_named(algorithm: &str, hex: &str) -> OcifreightCoreResult<Digest>;
}

impl DigestExt for Digest {
    fn from_str_named(algorithm: &str, hex: &str) -> OcifreightCoreResult<Digest> {
        use std::str::FromStr;
        Digest::from_str(&format!("{algorithm}:{hex}"))
            .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))
    }
}

/// Applies the schema-1 fix-up rule to the parallel `fsLayers`/`history`
/// arrays: every entry's id must be 64-hex;
/// each entry's parent must equal the next entry's id; no id may repeat
/// non-consecutively; consecutive duplicates are collapsed (both arrays
/// dropped together).
pub fn fixup(manifest: &Schema1Manifest) -> OcifreightCoreResult<(Vec<FsLayer>, Vec<HistoryEntry>)> {
    if manifest.fs_layers.len() != manifest.history.len() {
        return Err(OcifreightCoreError::MalformedManifest(
            "fsLayers and history length mismatch".to_string(),
        ));
    }

    #[derive(Deserialize)]
    struct V1Compat {
        id: String,
        #[serde(default)]
        parent: Option<String>,
    }

    let mut compats = Vec::with_capacity(manifest.history.len());
    for entry in &manifest.history {
        let compat: V1Compat = serde_json::from_str(&entry.v1_compatibility)
            .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
        if compat.id.len() != 64 || !compat.id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(OcifreightCoreError::MalformedManifest(format!(
                "v1Compatibility id {} is not 64 hex characters",
                compat.id
            )));
        }
        compats.push(compat);
    }

    for i in 0..compats.len().saturating_sub(1) {
        if let Some(parent) = &compats[i].parent {
            if parent != &compats[i + 1].id {
                return Err(OcifreightCoreError::MalformedManifest(format!(
                    "entry {i}'s parent does not match the next entry's id"
                )));
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut fixed_layers = Vec::new();
    let mut fixed_history = Vec::new();
    let mut prev_id: Option<&str> = None;

    for (i, compat) in compats.iter().enumerate() {
        if prev_id == Some(compat.id.as_str()) {
            // Consecutive duplicate: drop both arrays' entries together.
            continue;
        }
        if seen.contains(compat.id.as_str()) {
            return Err(OcifreightCoreError::MalformedManifest(format!(
                "id {} repeats non-consecutively",
                compat.id
            )));
        }
        seen.insert(compat.id.as_str());
        fixed_layers.push(manifest.fs_layers[i].clone());
        fixed_history.push(manifest.history[i].clone());
        prev_id = Some(compat.id.as_str());
    }

    Ok((fixed_layers, fixed_history))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Vec<u8> {
        // Construct a manifest whose unsigned prefix is exactly `prefix`, by
        // pointing the protected header's formatLength/formatTail at it.
        let prefix = br#"{"name":"library/alpine","tag":"latest","architecture":"amd64","fsLayers":[{"blobSum":"sha256:aaaa"}],"history":[{"v1Compatibility":"{\"id\":\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"}"}],"schemaVersion":1,"signatures":["#;
        let tail = br#"]}"#;
        let format_tail = URL_SAFE_NO_PAD.encode(tail);

        let protected = serde_json::json!({
            "formatLength": prefix.len(),
            "formatTail": format_tail,
        });
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());

        let manifest = serde_json::json!({
            "name": "library/alpine",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": [{"blobSum": "sha256:aaaa"}],
            "history": [{"v1Compatibility": "{\"id\":\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"}"}],
            "schemaVersion": 1,
            "signatures": [{
                "protected": protected_b64,
                "header": {"jwk": {}, "alg": "ES256"},
                "signature": "sig",
            }],
        });

        serde_json::to_vec(&manifest).unwrap()
    }

    #[test]
    fn parse_roundtrips_known_fields() {
        let bytes = sample_manifest();
        let manifest = parse(&bytes).unwrap();
        assert_eq!(manifest.name, "library/alpine");
        assert_eq!(manifest.fs_layers.len(), 1);
    }

    #[test]
    fn digest_is_stable_across_reserialization_with_same_prefix() {
        let bytes = sample_manifest();
        let d1 = digest(&bytes).unwrap();
        let d2 = digest(&bytes).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn fixup_rejects_non_hex_id() {
        let bad = serde_json::json!({
            "name": "x", "tag": "t", "architecture": "amd64", "schemaVersion": 1,
            "fsLayers": [{"blobSum": "sha256:aaaa"}],
            "history": [{"v1Compatibility": "{\"id\":\"not-hex\"}"}],
            "signatures": [],
        });
        let manifest: Schema1Manifest = serde_json::from_value(bad).unwrap();
        assert!(fixup(&manifest).is_err());
    }
}
