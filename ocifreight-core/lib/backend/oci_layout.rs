//! The `oci:` backend: a local, content-addressed OCI layout directory
//! (`oci-layout`, `index.json`, `blobs/<algo>/<hex>`).
//!
//! Blobs are written to a uniquely-named temporary file under `blobs/<algo>/`
//! with exclusive-create + `0600` permissions, then atomically renamed into
//! place once the declared digest/size are verified — partial writes are
//! never observable under the final name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType,
};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::{Destination, PutBlobOptions, ReusedBlob, Source, TryReusingBlobOptions};
use crate::blobinfocache::BlobInfoCache;
use crate::digest::BlobInfo;
use crate::manifest::IMAGE_REF_NAME_ANNOTATION;
use crate::transport::Selector;
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The `oci-layout` marker file's well-known contents, asserting version `1.0.0`.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A read-only view of one image (or index instance) inside an `oci:` layout
/// directory.
pub struct OciLayoutSource {
    dir: PathBuf,
    selector: Selector,
}

/// A write-oriented view of an `oci:` layout directory. Shared-blob
/// directories (blobs excluded from this instance's own GC sweep) are not
/// modeled here: this core treats every layout directory as self-contained.
pub struct OciLayoutDestination {
    dir: PathBuf,
    selector: Selector,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayoutSource {
    /// Opens `dir` as a source, selecting the entry named by `selector`.
    pub fn new(dir: impl Into<PathBuf>, selector: Selector) -> Self {
        Self {
            dir: dir.into(),
            selector,
        }
    }

    fn scope(&self) -> String {
        self.dir.to_string_lossy().to_string()
    }
}

impl OciLayoutDestination {
    /// Opens (creating if necessary) `dir` as a destination, writing at the
    /// entry named by `selector`.
    pub async fn new(dir: impl Into<PathBuf>, selector: Selector) -> OcifreightCoreResult<Self> {
        let dir = dir.into();
        ensure_layout(&dir).await?;
        Ok(Self { dir, selector })
    }

    fn scope(&self) -> String {
        self.dir.to_string_lossy().to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: layout plumbing
//--------------------------------------------------------------------------------------------------

/// Creates `dir` (and `blobs/`) if missing, and writes the `oci-layout`
/// marker file if it isn't already present.
async fn ensure_layout(dir: &Path) -> OcifreightCoreResult<()> {
    tokio::fs::create_dir_all(dir.join(BLOBS_DIR).join("sha256")).await?;
    let marker = dir.join(OCI_LAYOUT_FILE);
    if tokio::fs::metadata(&marker).await.is_err() {
        let contents = format!(r#"{{"imageLayoutVersion":"{OCI_LAYOUT_VERSION}"}}"#);
        tokio::fs::write(&marker, contents).await?;
    }
    Ok(())
}

fn blob_path(dir: &Path, digest: &Digest) -> PathBuf {
    dir.join(BLOBS_DIR)
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

async fn read_index(dir: &Path) -> OcifreightCoreResult<ImageIndex> {
    let path = dir.join(INDEX_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| OcifreightCoreError::NotFound(format!("{} has no index.json", dir.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))
}

/// Writes `index.json` via write-then-rename so readers never observe a
/// half-written index.
async fn write_index_atomic(dir: &Path, index: &ImageIndex) -> OcifreightCoreResult<()> {
    let bytes = serde_json::to_vec_pretty(index).map_err(OcifreightCoreError::Json)?;
    let tmp = dir.join(format!("{INDEX_FILE}.tmp-{}", std::process::id()));
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
    Ok(())
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(IMAGE_REF_NAME_ANNOTATION))
        .map(|s| s.as_str())
}

/// Resolves `selector` against `index`'s entries: `Name` looks up the
/// `org.opencontainers.image.ref.name` annotation, `Index` picks the
/// zero-based `N`th entry, and `Default` requires the index to carry exactly
/// one entry (an empty or ambiguous selector on a multi-image layout is a
/// caller error the reference parser already rejects, but a default selector
/// against a multi-image index is only discoverable here).
fn resolve_selector<'a>(index: &'a ImageIndex, selector: &Selector) -> OcifreightCoreResult<&'a Descriptor> {
    match selector {
        Selector::Name(name) => index
            .manifests()
            .iter()
            .find(|d| ref_name(d) == Some(name.as_str()))
            .ok_or_else(|| OcifreightCoreError::NotFound(format!("no image named {name:?} in index"))),
        Selector::Index(i) => index.manifests().get(*i as usize).ok_or_else(|| {
            OcifreightCoreError::NotFound(format!("index {i} out of range ({} entries)", index.manifests().len()))
        }),
        Selector::Default => match index.manifests().as_slice() {
            [only] => Ok(only),
            [] => Err(OcifreightCoreError::NotFound("index.json has no entries".to_string())),
            _ => Err(OcifreightCoreError::InvalidReference(
                "index.json has multiple entries; a name or @index selector is required".to_string(),
            )),
        },
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations: Source
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Source for OciLayoutSource {
    async fn get_manifest(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<(Vec<u8>, MediaType)> {
        let digest = match instance_digest {
            Some(d) => crate::digest::parse_digest(d)?,
            None => {
                let index = read_index(&self.dir).await?;
                resolve_selector(&index, &self.selector)?.digest().clone()
            }
        };
        let path = blob_path(&self.dir, &digest);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| OcifreightCoreError::NotFound(format!("blob {digest} missing")))?;
        let media_type = crate::digest::guess_media_type(&bytes)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(Box<dyn AsyncRead + Send + Unpin>, i64)> {
        let path = blob_path(&self.dir, &info.digest);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| OcifreightCoreError::NotFound(format!("blob {} missing", info.digest)))?;
        let size = file.metadata().await?.len() as i64;
        Ok((Box::new(file), size))
    }

    async fn get_signatures(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<Vec<Vec<u8>>> {
        let manifest_digest = match instance_digest {
            Some(d) => crate::digest::parse_digest(d)?,
            None => {
                let index = read_index(&self.dir).await?;
                resolve_selector(&index, &self.selector)?.digest().clone()
            }
        };
        read_sigstore_signatures(&self.dir, &manifest_digest).await
    }

    async fn layer_infos_for_copy(
        &self,
        _instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<Option<Vec<BlobInfo>>> {
        // A plain on-disk layout has nothing to substitute: the manifest's
        // own layer infos are already what a copier should read.
        Ok(None)
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations: Destination
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Destination for OciLayoutDestination {
    fn supported_manifest_mime_types(&self) -> Vec<MediaType> {
        vec![MediaType::ImageManifest, MediaType::ImageIndex]
    }

    fn supports_signatures(&self) -> bool {
        true
    }

    fn desired_layer_compression(&self) -> crate::digest::CompressionOperation {
        crate::digest::CompressionOperation::Preserve
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        true
    }

    fn must_match_runtime_os(&self) -> bool {
        false
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        true
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        true
    }

    fn supports_put_blob_partial(&self) -> bool {
        false
    }

    async fn put_blob(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        info: &BlobInfo,
        _options: &PutBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<BlobInfo> {
        let algo_dir = self.dir.join(BLOBS_DIR).join(
            info.digest.algorithm().to_string(),
        );
        tokio::fs::create_dir_all(&algo_dir).await?;

        let tmp_path = algo_dir.join(format!(".tmp-{}", uuid_like()));
        let mut open_options = tokio::fs::OpenOptions::new();
        open_options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_options.mode(0o600);
        }
        let mut file = open_options.open(&tmp_path).await?;

        let mut hasher = Sha256::new();
        let mut counted: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        let result = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                counted += n as i64;
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            Ok::<(), OcifreightCoreError>(())
        }
        .await;

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let computed = Digest::from_str(&format!("sha256:{}", hex::encode(hasher.finalize())))
            .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

        if info.digest.to_string() != computed.to_string() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(OcifreightCoreError::DigestMismatch {
                expected: info.digest.to_string(),
                actual: computed.to_string(),
            });
        }
        if info.size_is_known() && info.size != counted {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(OcifreightCoreError::SizeMismatch {
                expected: info.size,
                actual: counted,
            });
        }

        let final_path = blob_path(&self.dir, &computed);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let recorded = BlobInfo::new(computed.clone(), counted, info.media_type.clone());
        let _ = cache
            .record_known_location("oci", &self.scope(), &computed, self.scope())
            .await;
        Ok(recorded)
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions,
        _cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<Option<ReusedBlob>> {
        let path = blob_path(&self.dir, &info.digest);
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(None);
        }
        if options.required_compression.map(|c| c.is_chunked()).unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(ReusedBlob {
            info: info.clone(),
        }))
    }

    async fn put_manifest(&self, bytes: &[u8], instance_digest: Option<&str>) -> OcifreightCoreResult<()> {
        let digest = write_manifest_blob(&self.dir, bytes).await?;

        if instance_digest.is_some() {
            // Writing a specific child instance of an already-indexed
            // multi-image container: the blob write above is all that's
            // needed, the index entry pointing at it was written separately.
            return Ok(());
        }

        let media_type = crate::digest::guess_media_type(bytes)?;
        let mut descriptor = DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest)
            .size(bytes.len() as i64)
            .build()
            .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?;

        let mut index = match read_index(&self.dir).await {
            Ok(index) => index,
            Err(_) => ImageIndexBuilder::default()
                .schema_version(2u32)
                .manifests(Vec::new())
                .build()
                .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?,
        };

        let mut manifests = index.manifests().clone();
        match &self.selector {
            Selector::Name(name) => {
                let mut annotations = HashMap::new();
                annotations.insert(IMAGE_REF_NAME_ANNOTATION.to_string(), name.clone());
                descriptor.set_annotations(Some(annotations));
                manifests.retain(|d| ref_name(d) != Some(name.as_str()));
                manifests.push(descriptor);
            }
            Selector::Index(i) => {
                if let Some(slot) = manifests.get_mut(*i as usize) {
                    *slot = descriptor;
                } else {
                    manifests.push(descriptor);
                }
            }
            Selector::Default => {
                manifests = vec![descriptor];
            }
        }
        index.set_manifests(manifests);
        write_index_atomic(&self.dir, &index).await
    }

    async fn put_signatures_with_format(
        &self,
        signatures: &[Vec<u8>],
        instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        let manifest_digest = match instance_digest {
            Some(d) => crate::digest::parse_digest(d)?,
            None => {
                let index = read_index(&self.dir).await?;
                resolve_selector(&index, &self.selector)?.digest().clone()
            }
        };
        write_sigstore_signatures(&self.dir, &manifest_digest, signatures).await
    }

    async fn commit(&self, _unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()> {
        // Every write above is already durable (write-then-rename); there is
        // nothing additional to finalize for a plain on-disk layout.
        Ok(())
    }
}

async fn write_manifest_blob(dir: &Path, bytes: &[u8]) -> OcifreightCoreResult<Digest> {
    let hash = Sha256::digest(bytes);
    let digest = Digest::from_str(&format!("sha256:{}", hex::encode(hash)))
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;
    let path = blob_path(dir, &digest);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(&path).await.is_err() {
        let tmp = path.with_extension(format!("tmp-{}", uuid_like()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
    }
    Ok(digest)
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{:?}", nanos, std::thread::current().id())
}

//--------------------------------------------------------------------------------------------------
// Functions: sigstore-convention signature storage
//--------------------------------------------------------------------------------------------------

/// Cosign's convention for attaching a detached signature to an OCI layout:
/// a second manifest, tagged `sha256-<hex>.sig` via the usual ref-name
/// annotation, whose layers carry the opaque signature bytes.
fn sigstore_tag(manifest_digest: &Digest) -> String {
    format!("sha256-{}.sig", manifest_digest.digest())
}

async fn read_sigstore_signatures(dir: &Path, manifest_digest: &Digest) -> OcifreightCoreResult<Vec<Vec<u8>>> {
    let Ok(index) = read_index(dir).await else {
        return Ok(Vec::new());
    };
    let tag = sigstore_tag(manifest_digest);
    let Some(sig_manifest_descriptor) = index.manifests().iter().find(|d| ref_name(d) == Some(tag.as_str())) else {
        return Ok(Vec::new());
    };

    let sig_manifest_bytes = tokio::fs::read(blob_path(dir, sig_manifest_descriptor.digest())).await?;
    let sig_manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&sig_manifest_bytes)
        .map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))?;

    let mut out = Vec::with_capacity(sig_manifest.layers().len());
    for layer in sig_manifest.layers() {
        out.push(tokio::fs::read(blob_path(dir, layer.digest())).await?);
    }
    Ok(out)
}

async fn write_sigstore_signatures(
    dir: &Path,
    manifest_digest: &Digest,
    signatures: &[Vec<u8>],
) -> OcifreightCoreResult<()> {
    let mut layers = Vec::with_capacity(signatures.len());
    for sig in signatures {
        let digest = write_manifest_blob(dir, sig).await?;
        layers.push(
            DescriptorBuilder::default()
                .media_type(MediaType::Other("application/vnd.dev.cosign.simplesigning.v1+json".to_string()))
                .digest(digest)
                .size(sig.len() as i64)
                .annotations(HashMap::from([(
                    "dev.cosignproject.cosign/signature".to_string(),
                    String::new(),
                )]))
                .build()
                .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?,
        );
    }

    let config_bytes = b"{}";
    let config_digest = write_manifest_blob(dir, config_bytes).await?;
    let config = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest)
        .size(config_bytes.len() as i64)
        .build()
        .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?;

    let sig_manifest = oci_spec::image::ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .build()
        .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?;

    let sig_manifest_bytes = serde_json::to_vec(&sig_manifest).map_err(OcifreightCoreError::Json)?;
    let sig_digest = write_manifest_blob(dir, &sig_manifest_bytes).await?;

    let tag = sigstore_tag(manifest_digest);
    let mut annotations = HashMap::new();
    annotations.insert(IMAGE_REF_NAME_ANNOTATION.to_string(), tag.clone());
    let descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(sig_digest)
        .size(sig_manifest_bytes.len() as i64)
        .annotations(annotations)
        .build()
        .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?;

    let mut index = read_index(dir).await.unwrap_or(
        ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(Vec::new())
            .build()
            .map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))?,
    );
    let mut manifests = index.manifests().clone();
    manifests.retain(|d| ref_name(d) != Some(tag.as_str()));
    manifests.push(descriptor);
    index.set_manifests(manifests);
    write_index_atomic(dir, &index).await
}

//--------------------------------------------------------------------------------------------------
// Functions: delete & garbage collection
//--------------------------------------------------------------------------------------------------

/// Deletes the index entry selected by `selector`, then removes every blob
/// in `dir` no longer reachable from any remaining index entry's descriptor
/// graph (manifest/index → config/layers, transitively through nested
/// indexes). An `empty-name` (default) selector only succeeds when exactly
/// one image remains, since there would otherwise be no way to tell which
/// one the caller meant.
pub async fn delete_image(dir: &Path, selector: &Selector) -> OcifreightCoreResult<()> {
    let mut index = read_index(dir).await?;

    if matches!(selector, Selector::Default) && index.manifests().len() != 1 {
        return Err(OcifreightCoreError::InvalidReference(
            "a default (empty-name) delete is only valid when exactly one image remains".to_string(),
        ));
    }

    let target = resolve_selector(&index, selector)?.digest().clone();
    let mut manifests = index.manifests().clone();
    manifests.retain(|d| d.digest() != &target);
    index.set_manifests(manifests);
    write_index_atomic(dir, &index).await?;

    gc_unreferenced_blobs(dir, &index).await
}

/// Walks every remaining index entry's descriptor graph and removes blobs
/// under `dir/blobs` that are no longer referenced from any of them.
async fn gc_unreferenced_blobs(dir: &Path, index: &ImageIndex) -> OcifreightCoreResult<()> {
    let mut live = std::collections::HashSet::new();
    for entry in index.manifests() {
        live.insert(entry.digest().clone());
        mark_reachable(dir, entry.digest(), &mut live).await?;
    }

    for algo_dir_entry in read_algo_dirs(dir).await? {
        let mut entries = tokio::fs::read_dir(&algo_dir_entry).await?;
        while let Some(entry) = entries.next_entry().await? {
            let hex = entry.file_name().to_string_lossy().to_string();
            if hex.starts_with('.') {
                continue;
            }
            let algo = algo_dir_entry
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let Ok(digest) = Digest::from_str(&format!("{algo}:{hex}")) else {
                continue;
            };
            if !live.contains(&digest) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
    }
    Ok(())
}

async fn read_algo_dirs(dir: &Path) -> OcifreightCoreResult<Vec<PathBuf>> {
    let blobs_dir = dir.join(BLOBS_DIR);
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(&blobs_dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(out),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn mark_reachable<'a>(
    dir: &'a Path,
    digest: &'a Digest,
    live: &'a mut std::collections::HashSet<Digest>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = OcifreightCoreResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let Ok(bytes) = tokio::fs::read(blob_path(dir, digest)).await else {
            return Ok(());
        };
        let Ok(kind) = crate::manifest::parse(&bytes, None) else {
            return Ok(());
        };
        match kind {
            crate::manifest::ManifestKind::Manifest(m) => {
                live.insert(m.config().digest().clone());
                for layer in m.layers() {
                    live.insert(layer.digest().clone());
                }
            }
            crate::manifest::ManifestKind::Index(idx) => {
                for entry in idx.manifests() {
                    if live.insert(entry.digest().clone()) {
                        mark_reachable(dir, entry.digest(), live).await?;
                    }
                }
            }
            crate::manifest::ManifestKind::Schema1(_) => {}
        }
        Ok(())
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PutBlobOptions;
    use crate::blobinfocache::memory::MemoryBlobInfoCache;

    fn config_and_layer_bytes() -> (Vec<u8>, Vec<u8>) {
        (br#"{"created":"2006-01-02T15:04:05Z"}"#.to_vec(), vec![7u8; 12_345])
    }

    async fn write_one_layer_image(dir: &Path, selector: Selector) -> OcifreightCoreResult<Digest> {
        let destination = OciLayoutDestination::new(dir, selector).await?;
        let cache = MemoryBlobInfoCache::default();
        let (config_bytes, layer_bytes) = config_and_layer_bytes();

        let config_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&config_bytes))
        ))
        .unwrap();
        let config_info = BlobInfo::new(config_digest.clone(), config_bytes.len() as i64, MediaType::ImageConfig);
        destination
            .put_blob(
                Box::new(config_bytes.as_slice()),
                &config_info,
                &PutBlobOptions {
                    is_config: true,
                    ..Default::default()
                },
                &cache,
            )
            .await?;

        let layer_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&layer_bytes))
        ))
        .unwrap();
        let layer_info = BlobInfo::new(layer_digest.clone(), layer_bytes.len() as i64, MediaType::ImageLayerGzip);
        destination
            .put_blob(
                Box::new(layer_bytes.as_slice()),
                &layer_info,
                &PutBlobOptions {
                    layer_index: Some(0),
                    ..Default::default()
                },
                &cache,
            )
            .await?;

        let manifest = oci_spec::image::ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .digest(config_digest)
                    .size(config_bytes.len() as i64)
                    .build()
                    .unwrap(),
            )
            .layers(vec![
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageLayerGzip)
                    .digest(layer_digest)
                    .size(layer_bytes.len() as i64)
                    .build()
                    .unwrap(),
            ])
            .build()
            .unwrap();

        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        destination.put_manifest(&manifest_bytes, None).await?;
        destination.commit(&manifest_bytes).await?;

        let hash = Sha256::digest(&manifest_bytes);
        Ok(Digest::from_str(&format!("sha256:{}", hex::encode(hash))).unwrap())
    }

    #[tokio::test]
    async fn put_blob_rejects_digest_mismatch_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = OciLayoutDestination::new(dir.path(), Selector::Name("img".to_string()))
            .await
            .unwrap();
        let cache = MemoryBlobInfoCache::default();

        let declared = Digest::from_str(&format!("sha256:{}", "a".repeat(64))).unwrap();
        let info = BlobInfo::new(declared.clone(), 4096, MediaType::ImageLayerGzip);
        let data = vec![0xAAu8; 4096];

        let err = destination
            .put_blob(Box::new(data.as_slice()), &info, &PutBlobOptions::default(), &cache)
            .await
            .unwrap_err();
        assert!(matches!(err, OcifreightCoreError::DigestMismatch { .. }));

        let path = blob_path(dir.path(), &declared);
        assert!(tokio::fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn round_trip_write_then_read_back_manifest_and_layer() {
        let dir = tempfile::tempdir().unwrap();
        let digest = write_one_layer_image(dir.path(), Selector::Name("img".to_string()))
            .await
            .unwrap();

        let source = OciLayoutSource::new(dir.path(), Selector::Name("img".to_string()));
        let (bytes, media_type) = source.get_manifest(None).await.unwrap();
        assert_eq!(media_type, MediaType::ImageManifest);

        let computed = Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))).unwrap();
        assert_eq!(computed, digest);
    }

    #[tokio::test]
    async fn delete_image_gcs_unreferenced_blobs_but_keeps_shared_ones() {
        let dir = tempfile::tempdir().unwrap();
        write_one_layer_image(dir.path(), Selector::Name("first".to_string())).await.unwrap();
        write_one_layer_image(dir.path(), Selector::Name("second".to_string())).await.unwrap();

        // Both images share identical config/layer bytes, so their blobs
        // coincide; deleting one must not remove blobs the other still uses.
        delete_image(dir.path(), &Selector::Name("first".to_string())).await.unwrap();

        let index = read_index(dir.path()).await.unwrap();
        assert_eq!(index.manifests().len(), 1);

        let source = OciLayoutSource::new(dir.path(), Selector::Name("second".to_string()));
        let (bytes, _) = source.get_manifest(None).await.unwrap();
        let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&bytes).unwrap();
        for layer in manifest.layers() {
            assert!(tokio::fs::metadata(blob_path(dir.path(), layer.digest())).await.is_ok());
        }
    }
}
