//! The copy engine: drives one image from a [`crate::backend::Source`]
//! to a [`crate::backend::Destination`] — selecting a platform-specific child
//! out of a multi-platform index, copying (or reusing) every layer with
//! bounded parallelism, uploading the config blob, rewriting the manifest to
//! reflect whatever layer substitutions happened, and carrying signatures
//! forward.
//!
//! Layer transfer reuses the same tee-via-`tokio::io::duplex` idiom
//! [`crate::backend::layered_store::LayeredStoreDestination`] uses to hash
//! raw and decompressed bytes simultaneously: a background task drains one
//! side of a duplex pipe while the calling task drains the other, so a
//! single-pass read can feed two independent consumers (a hasher and a
//! recompressor) without buffering the whole blob in memory.

use std::str::FromStr;

use futures::stream::{self, StreamExt};
use oci_spec::image::{Digest, MediaType};
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::backend::{Destination, PutBlobOptions, Source, TryReusingBlobOptions};
use crate::blobinfocache::BlobInfoCache;
use crate::digest::{BlobInfo, CompressionAlgorithm, CompressionOperation};
use crate::manifest::{self, current_platform, LayerInfo, ManifestKind, PlatformQuery, UpdateOptions};
use crate::signature::{self, SignatureAction};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options steering one [`copy_image`] call: platform selection for a
/// multi-platform source, layer-copy parallelism, the scope a destination
/// should consult the blob-info cache under for source-side reuse, and what
/// happens to signatures read from the source.
pub struct CopyOptions<'a> {
    /// Platform to resolve a source index to. Defaults to the host's own
    /// platform when the source turns out to be an index and this is left
    /// unset.
    pub target_platform: Option<PlatformQuery>,
    /// Upper bound on concurrently in-flight layer transfers. The effective
    /// worker count is `min(this, layer count)`, and collapses to 1 whenever
    /// either endpoint isn't thread-safe for its respective blob operation.
    pub max_parallel_layers: usize,
    /// The source's own cache scope, threaded through as
    /// [`TryReusingBlobOptions::src_scope`] so a destination can look up
    /// locations recorded against the source rather than only its own scope.
    pub source_scope: Option<String>,
    /// What to do with the signatures read from the source.
    pub signature_action: SignatureAction<'a>,
    /// Cooperative cancellation, checked at every suspension point a layer
    /// transfer passes through.
    pub cancellation: Option<CancellationToken>,
}

impl<'a> Default for CopyOptions<'a> {
    fn default() -> Self {
        Self {
            target_platform: None,
            max_parallel_layers: 6,
            source_scope: None,
            signature_action: SignatureAction::PassThrough,
            cancellation: None,
        }
    }
}

struct Materialized {
    tempfile: NamedTempFile,
    digest: Digest,
    size: i64,
}

impl Materialized {
    async fn reopen(&self) -> OcifreightCoreResult<tokio::fs::File> {
        let std_file = self.tempfile.reopen()?;
        Ok(tokio::fs::File::from_std(std_file))
    }
}

struct Transformed {
    tempfile: NamedTempFile,
    diff_id: Digest,
    final_digest: Digest,
    final_size: i64,
}

//--------------------------------------------------------------------------------------------------
// Functions: orchestration
//--------------------------------------------------------------------------------------------------

/// Copies one image from `source` to `destination`: resolves a
/// platform-specific child out of a multi-platform index, copies (or reuses)
/// every layer with up to `options.max_parallel_layers` transfers in flight,
/// uploads the config blob, writes the (possibly recompressed) manifest,
/// carries signatures forward per `options.signature_action`, and commits the
/// destination. Returns the digest the destination now serves the image
/// under.
///
/// An index is always resolved to a single platform-specific child before
/// anything is copied; this engine does not pass a whole index through to a
/// destination that could otherwise store one; see `DESIGN.md`.
#[tracing::instrument(skip_all)]
pub async fn copy_image(
    source: &dyn Source,
    destination: &dyn Destination,
    cache: &dyn BlobInfoCache,
    options: &CopyOptions<'_>,
) -> OcifreightCoreResult<Digest> {
    check_cancelled(&options.cancellation)?;

    let (top_bytes, top_media_type) = source.get_manifest(None).await?;
    let top_kind = manifest::parse(&top_bytes, Some(&top_media_type))?;

    let (manifest_bytes, manifest_kind, source_instance_digest) = match top_kind {
        ManifestKind::Index(ref index) => {
            let query = options.target_platform.clone().unwrap_or_else(current_platform);
            let selected = manifest::select_platform(index, &query)?;
            let child_digest = selected.digest().to_string();

            let (child_bytes, child_media_type) = source.get_manifest(Some(child_digest.as_str())).await?;
            let child_kind = manifest::parse(&child_bytes, Some(&child_media_type))?;
            let computed = manifest::digest(&child_bytes, &child_kind)?;
            if computed.to_string() != child_digest {
                return Err(OcifreightCoreError::MalformedManifest(format!(
                    "child manifest digest mismatch: index declared {child_digest}, computed {computed}"
                )));
            }
            (child_bytes, child_kind, Some(child_digest))
        }
        other => (top_bytes, other, None),
    };

    if matches!(manifest_kind, ManifestKind::Index(_)) {
        return Err(OcifreightCoreError::Unsupported(
            "an index entry pointing to another index is not supported".to_string(),
        ));
    }

    let is_schema1 = matches!(manifest_kind, ManifestKind::Schema1(_));
    let effective_op = if is_schema1 {
        // Schema-1's digest covers a JWS envelope keyed to the exact
        // fsLayers list; substituting a layer's compression would produce a
        // manifest this engine cannot re-sign, so schema-1 layers are always
        // carried through byte-for-byte.
        CompressionOperation::Preserve
    } else {
        destination.desired_layer_compression()
    };

    let layer_infos = manifest::layer_infos(&manifest_kind)?;
    let substituted = source.layer_infos_for_copy(source_instance_digest.as_deref()).await?;
    if let Some(ref subs) = substituted {
        if subs.len() != layer_infos.len() {
            return Err(OcifreightCoreError::MalformedManifest(format!(
                "source reported {} substitute layer infos for {} manifest layers",
                subs.len(),
                layer_infos.len()
            )));
        }
    }

    let possible_formats = destination.supported_manifest_mime_types();
    let new_layer_infos = copy_layers(
        source,
        destination,
        cache,
        &layer_infos,
        substituted.as_deref(),
        effective_op,
        &possible_formats,
        options,
    )
    .await?;

    if let ManifestKind::Manifest(ref m) = manifest_kind {
        copy_config(source, destination, cache, m, &possible_formats, options).await?;
    }

    let current_media_type = media_type_of(&manifest_kind);
    let update_options = if is_schema1 {
        UpdateOptions {
            layer_infos: None,
            manifest_media_type: None,
        }
    } else {
        UpdateOptions {
            layer_infos: Some(new_layer_infos),
            manifest_media_type: pick_manifest_media_type(&current_media_type, destination),
        }
    };
    let manifest_media_type_override = update_options.manifest_media_type.clone();
    let updated_bytes = manifest::updated_image(&manifest_kind, &manifest_bytes, &update_options)?;
    let final_media_type = manifest_media_type_override.unwrap_or(current_media_type);
    let final_kind = manifest::parse(&updated_bytes, Some(&final_media_type))?;
    let final_digest = manifest::digest(&updated_bytes, &final_kind)?;

    check_cancelled(&options.cancellation)?;
    destination.put_manifest(&updated_bytes, None).await?;

    let source_signatures = source.get_signatures(source_instance_digest.as_deref()).await?;
    let destination_signatures = signature::apply_action(&source_signatures, &options.signature_action, &final_digest)?;
    if destination.supports_signatures() && !destination_signatures.is_empty() {
        destination.put_signatures_with_format(&destination_signatures, None).await?;
    }

    destination.commit(&updated_bytes).await?;

    Ok(final_digest)
}

#[allow(clippy::too_many_arguments)]
async fn copy_layers(
    source: &dyn Source,
    destination: &dyn Destination,
    cache: &dyn BlobInfoCache,
    layer_infos: &[LayerInfo],
    substituted: Option<&[BlobInfo]>,
    effective_op: CompressionOperation,
    possible_formats: &[MediaType],
    options: &CopyOptions<'_>,
) -> OcifreightCoreResult<Vec<LayerInfo>> {
    if layer_infos.is_empty() {
        return Ok(Vec::new());
    }

    let parallel_capable = source.has_thread_safe_get_blob() && destination.has_thread_safe_put_blob();
    let worker_count = if parallel_capable {
        options.max_parallel_layers.max(1).min(layer_infos.len())
    } else {
        1
    };

    let results: Vec<OcifreightCoreResult<(usize, BlobInfo)>> = stream::iter(layer_infos.iter().enumerate().map(|(index, original)| {
        let fetch_info = substituted
            .map(|subs| subs[index].clone())
            .unwrap_or_else(|| blob_info_from_layer(original));
        let source_scope = options.source_scope.clone();
        let cancellation = options.cancellation.clone();
        async move {
            let info = copy_layer(
                source,
                destination,
                cache,
                original,
                &fetch_info,
                index,
                effective_op,
                possible_formats,
                source_scope.as_deref(),
                &cancellation,
            )
            .await?;
            Ok::<_, OcifreightCoreError>((index, info))
        }
    }))
    .buffer_unordered(worker_count)
    .collect()
    .await;

    let mut ordered: Vec<Option<LayerInfo>> = vec![None; layer_infos.len()];
    for result in results {
        let (index, info) = result?;
        ordered[index] = Some(LayerInfo {
            digest: info.digest,
            size: info.size,
            media_type: info.media_type,
            empty_layer: layer_infos[index].empty_layer,
            urls: layer_infos[index].urls.clone(),
        });
    }

    Ok(ordered
        .into_iter()
        .map(|entry| entry.expect("every layer index produced exactly one result"))
        .collect())
}

/// Copies (or reuses) one layer, returning the [`BlobInfo`] the caller should
/// substitute into the destination's manifest in its place.
#[allow(clippy::too_many_arguments)]
async fn copy_layer(
    source: &dyn Source,
    destination: &dyn Destination,
    cache: &dyn BlobInfoCache,
    original: &LayerInfo,
    fetch_info: &BlobInfo,
    index: usize,
    effective_op: CompressionOperation,
    possible_formats: &[MediaType],
    source_scope: Option<&str>,
    cancellation: &Option<CancellationToken>,
) -> OcifreightCoreResult<BlobInfo> {
    check_cancelled(cancellation)?;

    let try_options = TryReusingBlobOptions {
        can_substitute: true,
        possible_manifest_formats: possible_formats.to_vec(),
        required_compression: required_compression_for(effective_op),
        original_compression: fetch_info.compression_algorithm,
        empty_layer: original.empty_layer,
        layer_index: Some(index),
        src_scope: source_scope.map(|s| s.to_string()),
    };

    if let Some(reused) = destination.try_reusing_blob(fetch_info, &try_options, cache).await? {
        tracing::debug!(layer = index, digest = %reused.info.digest, "reused existing blob, no bytes transferred");
        return Ok(reused.info);
    }

    let (reader, declared_size) = source.get_blob(fetch_info).await?;
    let source_algorithm = fetch_info
        .compression_algorithm
        .unwrap_or_else(|| algorithm_from_media_type(&original.media_type));

    let put_options = PutBlobOptions {
        is_config: false,
        empty_layer: original.empty_layer,
        layer_index: Some(index),
    };

    let recorded = match plan_transform(effective_op, source_algorithm) {
        None => {
            let mut info = fetch_info.clone();
            if !info.size_is_known() {
                info.size = declared_size;
            }
            destination.put_blob(reader, &info, &put_options, cache).await?
        }
        Some(target_algorithm) => {
            let transformed = transform_and_materialize(reader, source_algorithm, target_algorithm, cancellation).await?;

            if let Err(e) = cache
                .record_digest_uncompressed_pair(&transformed.final_digest, &transformed.diff_id)
                .await
            {
                tracing::debug!(error = %e, "blob-info cache write failed; continuing uncached");
            }
            if let Err(e) = cache
                .record_digest_compressor_name(&transformed.final_digest, target_algorithm.name())
                .await
            {
                tracing::debug!(error = %e, "blob-info cache write failed; continuing uncached");
            }

            let info = BlobInfo {
                digest: transformed.final_digest,
                size: transformed.final_size,
                media_type: retype_media_type(&original.media_type, target_algorithm),
                compression_operation: Some(effective_op),
                compression_algorithm: Some(target_algorithm),
            };
            let file = transformed.tempfile.reopen()?;
            destination
                .put_blob(Box::new(tokio::fs::File::from_std(file)), &info, &put_options, cache)
                .await?
        }
    };

    Ok(recorded)
}

async fn copy_config(
    source: &dyn Source,
    destination: &dyn Destination,
    cache: &dyn BlobInfoCache,
    manifest: &oci_spec::image::ImageManifest,
    possible_formats: &[MediaType],
    options: &CopyOptions<'_>,
) -> OcifreightCoreResult<()> {
    check_cancelled(&options.cancellation)?;

    let config_descriptor = manifest.config();
    let fetch_info = BlobInfo::new(
        config_descriptor.digest().clone(),
        *config_descriptor.size(),
        config_descriptor.media_type().clone(),
    );

    let try_options = TryReusingBlobOptions {
        can_substitute: false,
        possible_manifest_formats: possible_formats.to_vec(),
        required_compression: None,
        original_compression: None,
        empty_layer: false,
        layer_index: None,
        src_scope: options.source_scope.clone(),
    };
    if destination.try_reusing_blob(&fetch_info, &try_options, cache).await?.is_some() {
        return Ok(());
    }

    let (reader, declared_size) = source.get_blob(&fetch_info).await?;
    let mut info = fetch_info.clone();
    if !info.size_is_known() {
        info.size = declared_size;
    }
    destination
        .put_blob(
            reader,
            &info,
            &PutBlobOptions {
                is_config: true,
                empty_layer: false,
                layer_index: None,
            },
            cache,
        )
        .await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: compression transform
//--------------------------------------------------------------------------------------------------

/// Drains `reader` through a decompressor, then a recompressor targeting
/// `target_algorithm`, materializing the final bytes to a temp file while
/// computing both the uncompressed "diffID" and the final blob's own digest
/// in one pass. Mirrors
/// [`crate::backend::layered_store::LayeredStoreDestination`]'s staging tee:
/// a background task drains one half of a duplex pipe while the calling task
/// drains the other.
async fn transform_and_materialize(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    source_algorithm: CompressionAlgorithm,
    target_algorithm: CompressionAlgorithm,
    cancellation: &Option<CancellationToken>,
) -> OcifreightCoreResult<Transformed> {
    let (pipe_tx, pipe_rx) = tokio::io::duplex(64 * 1024);
    let pump_task: tokio::task::JoinHandle<std::io::Result<()>> = tokio::spawn(pump_into(reader, pipe_tx));

    let mut decompressed = crate::compression::decompress(pipe_rx, source_algorithm);

    let tempfile = tokio::task::spawn_blocking(NamedTempFile::new)
        .await
        .map_err(|e| OcifreightCoreError::custom(e.to_string()))??;
    let mut out_file = tokio::fs::File::from_std(tempfile.reopen()?);

    let (enc_tx, enc_rx) = tokio::io::duplex(64 * 1024);
    let encode_task: tokio::task::JoinHandle<std::io::Result<(Digest, i64)>> = tokio::spawn(async move {
        let mut encoded = crate::compression::recompress(enc_rx, target_algorithm)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = encoded.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as i64;
            out_file.write_all(&buf[..n]).await?;
        }
        out_file.flush().await?;
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode(hasher.finalize())))
            .expect("sha256 digest literal is always well-formed");
        Ok((digest, size))
    });

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let loop_result: OcifreightCoreResult<()> = async {
        loop {
            check_cancelled(cancellation)?;
            let n = decompressed.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if enc_tx.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        Ok(())
    }
    .await;
    drop(enc_tx);

    pump_task
        .await
        .map_err(|e| OcifreightCoreError::custom(e.to_string()))?
        .map_err(OcifreightCoreError::Io)?;
    loop_result?;

    let (final_digest, final_size) = encode_task
        .await
        .map_err(|e| OcifreightCoreError::custom(e.to_string()))?
        .map_err(OcifreightCoreError::Io)?;

    let diff_id = Digest::from_str(&format!("sha256:{}", hex::encode(hasher.finalize())))
        .expect("sha256 digest literal is always well-formed");

    Ok(Transformed {
        tempfile,
        diff_id,
        final_digest,
        final_size,
    })
}

async fn pump_into(mut reader: Box<dyn AsyncRead + Send + Unpin>, mut tx: tokio::io::DuplexStream) -> std::io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if tx.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: helpers
//--------------------------------------------------------------------------------------------------

fn check_cancelled(cancellation: &Option<CancellationToken>) -> OcifreightCoreResult<()> {
    if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(OcifreightCoreError::Cancelled);
    }
    Ok(())
}

/// The compression a `required_compression` constraint should carry for a
/// reuse attempt under `op`. `Preserve` places no constraint: any existing
/// compression is acceptable.
fn required_compression_for(op: CompressionOperation) -> Option<CompressionAlgorithm> {
    match op {
        CompressionOperation::Preserve => None,
        CompressionOperation::Decompress => Some(CompressionAlgorithm::None),
        CompressionOperation::Compress => Some(CompressionAlgorithm::Gzip),
    }
}

/// The recompression target for a layer already known to be `source_algorithm`-
/// compressed, or `None` if `source_algorithm` already satisfies `op`.
fn plan_transform(op: CompressionOperation, source_algorithm: CompressionAlgorithm) -> Option<CompressionAlgorithm> {
    match op {
        CompressionOperation::Preserve => None,
        CompressionOperation::Decompress => (!matches!(source_algorithm, CompressionAlgorithm::None)).then_some(CompressionAlgorithm::None),
        CompressionOperation::Compress => (!matches!(source_algorithm, CompressionAlgorithm::Gzip)).then_some(CompressionAlgorithm::Gzip),
    }
}

fn algorithm_from_media_type(mt: &MediaType) -> CompressionAlgorithm {
    let s = mt.to_string();
    if s.ends_with("+gzip") {
        CompressionAlgorithm::Gzip
    } else if s.ends_with("+zstd") {
        CompressionAlgorithm::Zstd
    } else {
        CompressionAlgorithm::None
    }
}

/// Rewrites a layer media type's compression suffix to match `target`,
/// string-wise rather than through exact enum variants: `oci_spec`'s
/// `MediaType` only exposes a handful of named layer variants, so every
/// other (vendor-extended, Docker-schema) layer type has to round-trip
/// through its string form anyway.
fn retype_media_type(original: &MediaType, target: CompressionAlgorithm) -> MediaType {
    let s = original.to_string();
    let base = s.trim_end_matches("+gzip").trim_end_matches("+zstd");
    let rebuilt = match target {
        CompressionAlgorithm::Gzip => format!("{base}+gzip"),
        CompressionAlgorithm::Zstd | CompressionAlgorithm::ZstdChunked => format!("{base}+zstd"),
        CompressionAlgorithm::None | CompressionAlgorithm::Unknown => base.to_string(),
    };
    MediaType::from(rebuilt.as_str())
}

fn blob_info_from_layer(layer: &LayerInfo) -> BlobInfo {
    BlobInfo::new(layer.digest.clone(), layer.size, layer.media_type.clone())
}

fn media_type_of(kind: &ManifestKind) -> MediaType {
    match kind {
        ManifestKind::Manifest(m) => m.media_type().clone().unwrap_or(MediaType::ImageManifest),
        ManifestKind::Schema1(_) => MediaType::Other("application/vnd.docker.distribution.manifest.v1+json".to_string()),
        ManifestKind::Index(i) => i.media_type().clone().unwrap_or(MediaType::ImageIndex),
    }
}

fn pick_manifest_media_type(current: &MediaType, destination: &dyn Destination) -> Option<MediaType> {
    let current = current.to_string();
    let supported = destination.supported_manifest_mime_types();
    if supported.iter().any(|mt| mt.to_string() == current) {
        return None;
    }
    supported.into_iter().find(|mt| matches!(mt, MediaType::ImageManifest))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::backend::oci_layout::{OciLayoutDestination, OciLayoutSource};
    use crate::blobinfocache::memory::MemoryBlobInfoCache;
    use crate::transport::Selector;

    #[test]
    fn plan_transform_is_noop_when_already_matching() {
        assert_eq!(plan_transform(CompressionOperation::Preserve, CompressionAlgorithm::Gzip), None);
        assert_eq!(plan_transform(CompressionOperation::Compress, CompressionAlgorithm::Gzip), None);
        assert_eq!(plan_transform(CompressionOperation::Decompress, CompressionAlgorithm::None), None);
    }

    #[test]
    fn plan_transform_targets_the_requested_algorithm() {
        assert_eq!(
            plan_transform(CompressionOperation::Compress, CompressionAlgorithm::None),
            Some(CompressionAlgorithm::Gzip)
        );
        assert_eq!(
            plan_transform(CompressionOperation::Decompress, CompressionAlgorithm::Gzip),
            Some(CompressionAlgorithm::None)
        );
    }

    #[test]
    fn retype_media_type_swaps_compression_suffix() {
        let original = MediaType::ImageLayerGzip;
        let retyped = retype_media_type(&original, CompressionAlgorithm::None);
        assert!(!retyped.to_string().ends_with("+gzip"));

        let original = MediaType::ImageLayer;
        let retyped = retype_media_type(&original, CompressionAlgorithm::Gzip);
        assert!(retyped.to_string().ends_with("+gzip"));
    }

    #[test]
    fn current_platform_matches_host_triple() {
        let query = current_platform();
        assert_eq!(query.os, std::env::consts::OS);
    }

    async fn seed_oci_layout(dir: &TempDir) -> String {
        let path = dir.path().to_string_lossy().to_string();
        let destination = OciLayoutDestination::new(path.clone(), Selector::Name("src".to_string()))
            .await
            .unwrap();

        let layer_bytes = b"hello layer".to_vec();
        let layer_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&layer_bytes))
        ))
        .unwrap();
        let layer_info = BlobInfo::new(layer_digest.clone(), layer_bytes.len() as i64, MediaType::ImageLayer);
        destination
            .put_blob(
                Box::new(std::io::Cursor::new(layer_bytes.clone())),
                &layer_info,
                &PutBlobOptions {
                    is_config: false,
                    empty_layer: false,
                    layer_index: Some(0),
                },
                &MemoryBlobInfoCache::default(),
            )
            .await
            .unwrap();

        let config_bytes = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#.to_vec();
        let config_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&config_bytes))
        ))
        .unwrap();
        let config_info = BlobInfo::new(config_digest.clone(), config_bytes.len() as i64, MediaType::ImageConfig);
        destination
            .put_blob(
                Box::new(std::io::Cursor::new(config_bytes.clone())),
                &config_info,
                &PutBlobOptions {
                    is_config: true,
                    empty_layer: false,
                    layer_index: None,
                },
                &MemoryBlobInfoCache::default(),
            )
            .await
            .unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest.to_string(),
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": layer_digest.to_string(),
                "size": layer_bytes.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        destination.put_manifest(&manifest_bytes, None).await.unwrap();
        destination.commit(&manifest_bytes).await.unwrap();

        path
    }

    #[test_log::test(tokio::test)]
    async fn copy_image_round_trips_oci_layout_to_oci_layout() {
        let src_dir = TempDir::new().unwrap();
        let path = seed_oci_layout(&src_dir).await;
        let source = OciLayoutSource::new(path, Selector::Name("src".to_string()));

        let dst_dir = TempDir::new().unwrap();
        let destination = OciLayoutDestination::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        )
        .await
        .unwrap();

        let cache = MemoryBlobInfoCache::default();
        let options = CopyOptions::default();
        let digest = copy_image(&source, &destination, &cache, &options).await.unwrap();

        let roundtrip_source = OciLayoutSource::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        );
        let (bytes, _) = roundtrip_source.get_manifest(None).await.unwrap();
        let kind = manifest::parse(&bytes, None).unwrap();
        let computed = manifest::digest(&bytes, &kind).unwrap();
        assert_eq!(computed, digest);

        let layers = manifest::layer_infos(&kind).unwrap();
        assert_eq!(layers.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn copy_image_recompresses_layers_when_destination_requests_it() {
        let src_dir = TempDir::new().unwrap();
        let path = seed_oci_layout(&src_dir).await;
        let source = OciLayoutSource::new(path, Selector::Name("src".to_string()));

        struct ForcedDecompress(OciLayoutDestination);

        #[async_trait::async_trait]
        impl Destination for ForcedDecompress {
            fn supported_manifest_mime_types(&self) -> Vec<MediaType> {
                self.0.supported_manifest_mime_types()
            }
            fn supports_signatures(&self) -> bool {
                self.0.supports_signatures()
            }
            fn desired_layer_compression(&self) -> CompressionOperation {
                CompressionOperation::Compress
            }
            fn accepts_foreign_layer_urls(&self) -> bool {
                self.0.accepts_foreign_layer_urls()
            }
            fn must_match_runtime_os(&self) -> bool {
                self.0.must_match_runtime_os()
            }
            fn ignores_embedded_docker_reference(&self) -> bool {
                self.0.ignores_embedded_docker_reference()
            }
            fn has_thread_safe_put_blob(&self) -> bool {
                self.0.has_thread_safe_put_blob()
            }
            fn supports_put_blob_partial(&self) -> bool {
                self.0.supports_put_blob_partial()
            }
            async fn put_blob(
                &self,
                reader: Box<dyn AsyncRead + Send + Unpin>,
                info: &BlobInfo,
                options: &PutBlobOptions,
                cache: &dyn BlobInfoCache,
            ) -> OcifreightCoreResult<BlobInfo> {
                self.0.put_blob(reader, info, options, cache).await
            }
            async fn try_reusing_blob(
                &self,
                info: &BlobInfo,
                options: &TryReusingBlobOptions,
                cache: &dyn BlobInfoCache,
            ) -> OcifreightCoreResult<Option<crate::backend::ReusedBlob>> {
                self.0.try_reusing_blob(info, options, cache).await
            }
            async fn put_manifest(&self, bytes: &[u8], instance_digest: Option<&str>) -> OcifreightCoreResult<()> {
                self.0.put_manifest(bytes, instance_digest).await
            }
            async fn put_signatures_with_format(
                &self,
                signatures: &[Vec<u8>],
                instance_digest: Option<&str>,
            ) -> OcifreightCoreResult<()> {
                self.0.put_signatures_with_format(signatures, instance_digest).await
            }
            async fn commit(&self, unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()> {
                self.0.commit(unparsed_toplevel).await
            }
        }

        let dst_dir = TempDir::new().unwrap();
        let inner = OciLayoutDestination::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        )
        .await
        .unwrap();
        let destination = ForcedDecompress(inner);

        let cache = MemoryBlobInfoCache::default();
        let options = CopyOptions::default();
        copy_image(&source, &destination, &cache, &options).await.unwrap();

        let roundtrip_source = OciLayoutSource::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        );
        let (bytes, _) = roundtrip_source.get_manifest(None).await.unwrap();
        let kind = manifest::parse(&bytes, None).unwrap();
        let layers = manifest::layer_infos(&kind).unwrap();
        assert!(layers[0].media_type.to_string().ends_with("+gzip"));

        let (mut reader, _) = roundtrip_source.get_blob(&blob_info_from_layer(&layers[0])).await.unwrap();
        let mut first_bytes = [0u8; 2];
        reader.read_exact(&mut first_bytes).await.unwrap();
        assert_eq!(first_bytes, [0x1f, 0x8b]);
    }

    #[test_log::test(tokio::test)]
    async fn copy_image_rejects_nested_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        let destination = OciLayoutDestination::new(path.clone(), Selector::Name("nested".to_string()))
            .await
            .unwrap();

        let leaf_index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [],
        });
        let leaf_bytes = serde_json::to_vec(&leaf_index).unwrap();
        let leaf_digest = Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(&leaf_bytes)))).unwrap();

        let top_index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "digest": leaf_digest.to_string(),
                "size": leaf_bytes.len(),
                "platform": {"os": std::env::consts::OS, "architecture": "amd64"},
            }],
        });
        let top_bytes = serde_json::to_vec(&top_index).unwrap();
        destination.put_manifest(&top_bytes, None).await.unwrap();
        destination.put_manifest(&leaf_bytes, Some(&leaf_digest.to_string())).await.unwrap();
        destination.commit(&top_bytes).await.unwrap();

        let source = OciLayoutSource::new(path, Selector::Name("nested".to_string()));
        let dst_dir = TempDir::new().unwrap();
        let target = OciLayoutDestination::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        )
        .await
        .unwrap();

        let cache = MemoryBlobInfoCache::default();
        let mut options = CopyOptions::default();
        options.target_platform = Some(PlatformQuery::new(std::env::consts::OS, "amd64"));
        let err = copy_image(&source, &target, &cache, &options).await.unwrap_err();
        assert!(matches!(err, OcifreightCoreError::Unsupported(_)));
    }

    #[test_log::test(tokio::test)]
    async fn copy_image_honors_cancellation() {
        let src_dir = TempDir::new().unwrap();
        let path = seed_oci_layout(&src_dir).await;
        let source = OciLayoutSource::new(path, Selector::Name("src".to_string()));

        let dst_dir = TempDir::new().unwrap();
        let destination = OciLayoutDestination::new(
            dst_dir.path().to_string_lossy().to_string(),
            Selector::Name("dst".to_string()),
        )
        .await
        .unwrap();

        let cache = MemoryBlobInfoCache::default();
        let token = CancellationToken::new();
        token.cancel();
        let options = CopyOptions {
            cancellation: Some(token),
            ..CopyOptions::default()
        };
        let err = copy_image(&source, &destination, &cache, &options).await.unwrap_err();
        assert!(matches!(err, OcifreightCoreError::Cancelled));
    }
}
