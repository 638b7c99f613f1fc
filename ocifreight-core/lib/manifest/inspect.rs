//! `Inspect(config-getter)`: derives high-level image metadata (created
//! time, os/arch, labels, layer digests) from a manifest plus its config
//! blob, without the caller having to know which schema produced either.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use oci_spec::image::Digest;
use serde::Deserialize;

use super::{layer_infos, ManifestKind};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// High-level metadata about an image, independent of which manifest schema
/// produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInspectInfo {
    /// The image's declared creation time, if its config blob carries one.
    pub created: Option<DateTime<Utc>>,
    /// Target operating system, e.g. `linux`.
    pub os: Option<String>,
    /// Target architecture, e.g. `amd64`.
    pub architecture: Option<String>,
    /// Labels declared in the config's `config.Labels` map.
    pub labels: HashMap<String, String>,
    /// Every layer digest, in manifest order, as canonical digest strings.
    pub layer_digests: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigBlob {
    created: Option<DateTime<Utc>>,
    os: Option<String>,
    architecture: Option<String>,
    #[serde(default)]
    config: Option<ConfigBlobConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigBlobConfig {
    #[serde(default, alias = "Labels")]
    labels: Option<HashMap<String, String>>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds an [`ImageInspectInfo`] for `kind`. `get_config` is handed the
/// config descriptor's digest and must resolve it to the config blob's raw
/// bytes (a thin wrapper around a [`crate::backend::Source::get_blob`] call
/// in practice); it is never invoked for an index (which has no config of
/// its own) or for a schema-1 manifest (whose config lives embedded in its
/// history rather than as a separate blob — callers needing that level of
/// detail should inspect `v1Compatibility` entries directly).
pub async fn inspect<F, Fut>(kind: &ManifestKind, get_config: F) -> OcifreightCoreResult<ImageInspectInfo>
where
    F: FnOnce(&Digest) -> Fut,
    Fut: Future<Output = OcifreightCoreResult<Vec<u8>>>,
{
    let ManifestKind::Manifest(manifest) = kind else {
        // An index has no layers of its own (select a platform-specific
        // child first); a schema-1 manifest's layers are still enumerable
        // even though its config isn't a separate blob.
        let layer_digests = layer_infos(kind)
            .map(|layers| layers.into_iter().map(|l| l.digest.to_string()).collect())
            .unwrap_or_default();
        return Ok(ImageInspectInfo {
            layer_digests,
            ..Default::default()
        });
    };

    let layer_digests = layer_infos(kind)?.into_iter().map(|l| l.digest.to_string()).collect();

    let config_bytes = get_config(manifest.config().digest()).await?;
    let config: ConfigBlob = serde_json::from_slice(&config_bytes)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

    Ok(ImageInspectInfo {
        created: config.created,
        os: config.os,
        architecture: config.architecture,
        labels: config.config.and_then(|c| c.labels).unwrap_or_default(),
        layer_digests,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
