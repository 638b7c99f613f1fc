//! The unifying manifest model: [`ManifestKind`] tags raw bytes as one of the
//! recognized schema variants, and the free functions here implement parsing,
//! digesting, layer enumeration, and layer substitution over all of them.

use std::str::FromStr;

use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageManifest, MediaType};
use sha2::{Digest as _, Sha256};

use super::schema1::{self, Schema1Manifest};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A decoded manifest or index, tagged by which schema it parsed as.
#[derive(Debug, Clone)]
pub enum ManifestKind {
    /// A legacy Docker schema-1 signed manifest.
    Schema1(Schema1Manifest),
    /// A Docker schema-2 or OCI v1 image manifest (config + ordered layers).
    /// These two share an identical JSON shape; the distinguishing bit is the
    /// `mediaType` carried alongside the bytes.
    Manifest(ImageManifest),
    /// A Docker manifest list or OCI image index (a list of per-platform
    /// manifest descriptors).
    Index(ImageIndex),
}

/// One entry produced by [`layer_infos`]: a layer descriptor plus an
/// empty-layer flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// The layer's content digest.
    pub digest: Digest,
    /// Declared size in bytes, or `-1` if unknown (schema-1 has no size).
    pub size: i64,
    /// The layer's declared media type.
    pub media_type: MediaType,
    /// Whether this is a `throwaway`/empty-layer entry that carries no
    /// filesystem content (schema-1's placeholder layers, or the OCI
    /// well-known empty-layer digest).
    pub empty_layer: bool,
    /// Foreign-layer source URLs, if any.
    pub urls: Vec<String>,
}

/// The canonical digest of the OCI/Docker empty gzip layer, reused by every
/// schema-1 image that needs a placeholder "no content changed here" layer.
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// Options accepted by [`updated_image`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Replacement layer descriptors, positionally matching the manifest's
    /// existing layers. The layer *count* may not change.
    pub layer_infos: Option<Vec<LayerInfo>>,
    /// Overrides the manifest's own declared media type (e.g. when the copy
    /// destination requested a specific `possible_manifest_formats` entry).
    pub manifest_media_type: Option<MediaType>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decodes raw manifest/index bytes, using `media_type_hint` when present and
/// falling back to content sniffing ([`crate::digest::guess_media_type`])
/// otherwise.
pub fn parse(bytes: &[u8], media_type_hint: Option<&MediaType>) -> OcifreightCoreResult<ManifestKind> {
    let media_type = match media_type_hint {
        Some(mt) => mt.clone(),
        None => crate::digest::guess_media_type(bytes)?,
    };

    if is_schema1(&media_type) {
        return Ok(ManifestKind::Schema1(schema1::parse(bytes)?));
    }

    if crate::digest::is_index_media_type(&media_type) {
        let index: ImageIndex = serde_json::from_slice(bytes)
            .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
        return Ok(ManifestKind::Index(index));
    }

    if crate::digest::is_manifest_media_type(&media_type) {
        let manifest: ImageManifest = serde_json::from_slice(bytes)
            .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
        return Ok(ManifestKind::Manifest(manifest));
    }

    Err(OcifreightCoreError::MalformedManifest(format!(
        "unrecognized manifest media type {media_type}"
    )))
}

fn is_schema1(mt: &MediaType) -> bool {
    matches!(mt, MediaType::Other(s) if s == "application/vnd.docker.distribution.manifest.v1+json"
        || s == "application/vnd.docker.distribution.manifest.v1+prettyjws")
}

/// Computes the canonical digest of manifest bytes. For schema-1 this strips
/// the JWS envelope first; for every other schema the digest is simply
/// sha256 of the bytes as given, since schema-2/OCI v1/index JSON has no
/// detachable envelope.
pub fn digest(bytes: &[u8], kind: &ManifestKind) -> OcifreightCoreResult<Digest> {
    match kind {
        ManifestKind::Schema1(_) => schema1::digest(bytes),
        ManifestKind::Manifest(_) | ManifestKind::Index(_) => {
            let hash = Sha256::digest(bytes);
            Digest::from_str(&format!("sha256:{}", hex::encode(hash)))
                .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))
        }
    }
}

/// Enumerates a manifest's layers in order, including the empty-layer flag.
pub fn layer_infos(kind: &ManifestKind) -> OcifreightCoreResult<Vec<LayerInfo>> {
    match kind {
        ManifestKind::Schema1(m) => {
            let (fs_layers, history) = schema1::fixup(m)?;
            let mut out = Vec::with_capacity(fs_layers.len());
            for (layer, hist) in fs_layers.iter().zip(history.iter()) {
                let digest = Digest::from_str(&layer.blob_sum)
                    .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
                let empty_layer = digest.to_string() == EMPTY_LAYER_DIGEST
                    || is_throwaway_v1_compat(&hist.v1_compatibility);
                out.push(LayerInfo {
                    digest,
                    size: -1,
                    media_type: MediaType::Other(
                        "application/vnd.docker.container.image.rootfs.diff+x-gtar".to_string(),
                    ),
                    empty_layer,
                    urls: Vec::new(),
                });
            }
            Ok(out)
        }
        ManifestKind::Manifest(m) => Ok(m
            .layers()
            .iter()
            .map(|d| descriptor_to_layer_info(d))
            .collect()),
        ManifestKind::Index(_) => Err(OcifreightCoreError::Unsupported(
            "an index has no layers; resolve a platform-specific child manifest first".to_string(),
        )),
    }
}

fn descriptor_to_layer_info(d: &Descriptor) -> LayerInfo {
    let empty_layer = d.digest().to_string() == EMPTY_LAYER_DIGEST;
    LayerInfo {
        digest: d.digest().clone(),
        size: *d.size(),
        media_type: d.media_type().clone(),
        empty_layer,
        urls: d.urls().clone().unwrap_or_default(),
    }
}

/// A schema-1 `v1Compatibility` entry is a "throwaway" layer when its decoded
/// JSON carries `"throwaway": true`.
fn is_throwaway_v1_compat(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("throwaway").and_then(|t| t.as_bool()))
        .unwrap_or(false)
}

/// Produces an updated manifest blob reflecting replaced layer infos and/or a
/// replaced media type. The number of layers may not change; violating that
/// is a programming error in the caller (a copy engine only ever substitutes
/// digests/sizes/compression, never adds or removes layers), so this returns
/// an error instead of silently truncating.
pub fn updated_image(
    kind: &ManifestKind,
    bytes: &[u8],
    options: &UpdateOptions,
) -> OcifreightCoreResult<Vec<u8>> {
    match kind {
        ManifestKind::Manifest(m) => {
            let mut updated = m.clone();
            if let Some(layer_infos) = &options.layer_infos {
                let existing = updated.layers();
                if existing.len() != layer_infos.len() {
                    return Err(OcifreightCoreError::MalformedManifest(format!(
                        "updated layer count {} does not match existing layer count {}",
                        layer_infos.len(),
                        existing.len()
                    )));
                }
                let mut new_layers = existing.clone();
                for (descriptor, info) in new_layers.iter_mut().zip(layer_infos.iter()) {
                    descriptor.set_digest(info.digest.clone());
                    descriptor.set_size(info.size);
                    descriptor.set_media_type(info.media_type.clone());
                }
                updated.set_layers(new_layers);
            }
            if let Some(mt) = &options.manifest_media_type {
                updated.set_media_type(Some(mt.clone()));
            }
            serde_json::to_vec(&updated).map_err(OcifreightCoreError::Json)
        }
        ManifestKind::Schema1(_) => {
            // A copy engine always upgrades away from schema-1 rather than
            // writing it back out, so the only legitimate "update" here is a
            // no-op passthrough of the original bytes when no substitution
            // was requested.
            if options.layer_infos.is_some() {
                return Err(OcifreightCoreError::Unsupported(
                    "updating a schema-1 manifest's layers is not supported".to_string(),
                ));
            }
            Ok(bytes.to_vec())
        }
        ManifestKind::Index(_) => Err(OcifreightCoreError::Unsupported(
            "an index has no layers to update; select a child manifest first".to_string(),
        )),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
