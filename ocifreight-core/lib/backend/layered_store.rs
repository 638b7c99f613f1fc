//! The layered local store backend (`containers-storage:`): a [`Destination`]
//! (and [`Source`]) over [`crate::store::Store`] that derives content-addressed
//! layer ids, coordinates concurrent layer commits in manifest order, and
//! records committed images with their big-data (manifest, config, signatures).
//!
//! This is the hardest backend in the crate: `PutBlob`/`TryReusingBlob` calls
//! for different layers of the same image can run concurrently, but a layer's
//! derived id depends on its *parent's* already-committed id, so layer `i`'s
//! commit step must block on layer `i-1`'s regardless of which order their
//! bytes happened to finish streaming in.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oci_spec::image::{Digest, MediaType};
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use super::{Destination, PutBlobOptions, ReusedBlob, Source, TryReusingBlobOptions};
use crate::blobinfocache::BlobInfoCache;
use crate::digest::{BlobInfo, CompressionAlgorithm, CompressionOperation};
use crate::store::{layer::derive_layer_id, ImageRecord, LayerRecord, Store};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One layer-index's commit signal: pending until `PutBlob`/`TryReusingBlob`
/// for that index has committed (or permanently failed), at which point every
/// waiter blocked on the *next* index's commit step is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Success,
    Failure,
}

/// Single-slot, multi-waiter commit signals keyed by layer index. A `watch`
/// channel already has exactly this shape: the latest value is retained for
/// any receiver subscribing after the fact, so a waiter that arrives after
/// the signal fired still observes it immediately.
#[derive(Default)]
struct LayerSignals {
    senders: AsyncMutex<HashMap<usize, Arc<watch::Sender<SignalState>>>>,
}

impl LayerSignals {
    async fn sender(&self, index: usize) -> Arc<watch::Sender<SignalState>> {
        let mut senders = self.senders.lock().await;
        senders
            .entry(index)
            .or_insert_with(|| Arc::new(watch::channel(SignalState::Pending).0))
            .clone()
    }

    async fn signal(&self, index: usize, success: bool) {
        let sender = self.sender(index).await;
        let _ = sender.send(if success { SignalState::Success } else { SignalState::Failure });
    }

    /// Blocks until layer index `index` has signalled. Waiting on index
    /// `usize::MAX` (the sentinel for "no predecessor") returns immediately.
    async fn wait(&self, index: usize) -> OcifreightCoreResult<()> {
        if index == usize::MAX {
            return Ok(());
        }
        let sender = self.sender(index).await;
        let mut receiver = sender.subscribe();
        loop {
            match *receiver.borrow_and_update() {
                SignalState::Success => return Ok(()),
                SignalState::Failure => {
                    return Err(OcifreightCoreError::custom(format!(
                        "layer index {index} failed to commit; dependent layer cannot proceed"
                    )))
                }
                SignalState::Pending => {}
            }
            receiver
                .changed()
                .await
                .map_err(|_| OcifreightCoreError::custom("layer commit signal sender dropped"))?;
        }
    }
}

/// How long `put_blob` waits to acquire a digest's lock before assuming
/// another in-flight copy already owns it and falling back to an unbounded
/// wait plus a `TryReusingBlob` retry.
const DIGEST_LOCK_GRANT_TIMEOUT: Duration = Duration::from_millis(200);

/// An in-process, keyed async-mutex table guarding concurrent writers of the
/// same blob digest. The store is a single-process library with no sibling
/// process to contend with, so this never needs to be a cross-process file
/// lock (see the project's concurrency decision notes).
#[derive(Default)]
struct DigestLocks {
    table: AsyncMutex<HashMap<Digest, Arc<AsyncMutex<()>>>>,
}

impl DigestLocks {
    async fn get(&self, digest: &Digest) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().await;
        table.entry(digest.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn try_acquire(&self, digest: &Digest) -> Option<OwnedMutexGuard<()>> {
        let lock = self.get(digest).await;
        tokio::time::timeout(DIGEST_LOCK_GRANT_TIMEOUT, lock.lock_owned()).await.ok()
    }

    async fn acquire(&self, digest: &Digest) -> OwnedMutexGuard<()> {
        let lock = self.get(digest).await;
        lock.lock_owned().await
    }
}

/// Staged state recorded for one blob written (or reused) through this
/// destination, kept around until `commit` so a later layer/config lookup
/// doesn't have to re-derive it.
#[derive(Clone)]
struct StagedBlob {
    /// Local scratch path holding the raw bytes as received (the diff
    /// content for a layer, or the config JSON for the config blob).
    path: PathBuf,
    size: i64,
    /// The digest of the *uncompressed* content (the diffID), if this blob
    /// is a layer. `None` for the config blob.
    diff_id: Option<Digest>,
}

/// A [`Destination`] (and [`Source`]) over the layered local store.
pub struct LayeredStoreDestination {
    store: Arc<Store>,
    name: Option<String>,
    scratch: TempDir,
    staged: AsyncMutex<HashMap<Digest, StagedBlob>>,
    /// Layer index -> committed layer id, published once that index's
    /// `PutBlob`/`TryReusingBlob` call has durably committed.
    committed: AsyncMutex<HashMap<usize, String>>,
    signals: LayerSignals,
    locks: DigestLocks,
    pending_signatures: AsyncMutex<Vec<Vec<u8>>>,
}

impl LayeredStoreDestination {
    /// Opens a destination writing into `store`, committing the final image
    /// under `name` if given.
    pub fn new(store: Arc<Store>, name: Option<String>) -> OcifreightCoreResult<Self> {
        let scratch = TempDir::new()?;
        Ok(Self {
            store,
            name,
            scratch,
            staged: AsyncMutex::new(HashMap::new()),
            committed: AsyncMutex::new(HashMap::new()),
            signals: LayerSignals::default(),
            locks: DigestLocks::default(),
            pending_signatures: AsyncMutex::new(Vec::new()),
        })
    }

    fn scratch_path(&self, digest: &Digest) -> PathBuf {
        self.scratch.path().join(digest.to_string().replace(':', "_"))
    }

    /// The committed parent id for layer `index`, or `None` for a base layer
    /// (`index == 0`). Blocks until `index - 1` has signalled.
    async fn parent_for(&self, index: usize) -> OcifreightCoreResult<Option<String>> {
        if index == 0 {
            return Ok(None);
        }
        self.signals.wait(index - 1).await?;
        let committed = self.committed.lock().await;
        Ok(committed.get(&(index - 1)).cloned())
    }

    async fn publish(&self, index: usize, layer_id: String) {
        self.committed.lock().await.insert(index, layer_id);
        self.signals.signal(index, true).await;
    }

    async fn fail(&self, index: usize) {
        self.signals.signal(index, false).await;
    }

    /// Streams `reader` to a scratch file while simultaneously hashing the
    /// raw bytes (for digest/size verification) and the decompressed bytes
    /// (for the diffID), then verifies the declared digest/size.
    async fn stage(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(PathBuf, i64, Digest)> {
        let path = self.scratch_path(&info.digest);
        let mut file = tokio::fs::File::create(&path).await?;

        let (mut pipe_tx, pipe_rx) = tokio::io::duplex(64 * 1024);
        let algorithm = info.compression_algorithm.unwrap_or(CompressionAlgorithm::None);
        let diff_task: tokio::task::JoinHandle<std::io::Result<Digest>> = tokio::spawn(async move {
            let mut decompressed = crate::compression::decompress(pipe_rx, algorithm);
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = decompressed.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let hash = hasher.finalize();
            Ok(Digest::from_str(&format!("sha256:{}", hex::encode(hash)))
                .expect("sha256 digest literal is always well-formed"))
        });

        let mut hasher = Sha256::new();
        let mut counted: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        let result: OcifreightCoreResult<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                counted += n as i64;
                file.write_all(&buf[..n]).await?;
                if pipe_tx.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
        .await;
        drop(pipe_tx);

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&path).await;
            diff_task.abort();
            return Err(e);
        }

        let diff_id = diff_task
            .await
            .map_err(|e| OcifreightCoreError::custom(e.to_string()))?
            .map_err(OcifreightCoreError::Io)?;

        let actual = Digest::from_str(&format!("sha256:{}", hex::encode(hasher.finalize())))
            .map_err(|e| OcifreightCoreError::custom(e.to_string()))?;

        if actual != info.digest {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(OcifreightCoreError::DigestMismatch {
                expected: info.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        if info.size_is_known() && counted != info.size {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(OcifreightCoreError::SizeMismatch {
                expected: info.size,
                actual: counted,
            });
        }

        Ok((path, counted, diff_id))
    }

    /// Commits a staged layer blob at `index` against its (already-waited-on)
    /// parent, publishing the resulting layer id and signalling success.
    async fn commit_layer(
        &self,
        index: usize,
        diff_path: &std::path::Path,
        diff_id: &Digest,
        compressed_digest: &Digest,
        compressed_size: i64,
        uncompressed_size: i64,
    ) -> OcifreightCoreResult<String> {
        let parent = self.parent_for(index).await;
        let parent = match parent {
            Ok(p) => p,
            Err(e) => {
                self.fail(index).await;
                return Err(e);
            }
        };

        let layer_id = derive_layer_id(parent.as_deref(), diff_id);
        let record = LayerRecord {
            layer_id: layer_id.clone(),
            parent_id: parent,
            uncompressed_digest: diff_id.clone(),
            uncompressed_size,
            compressed_digest: Some(compressed_digest.clone()),
            compressed_size: Some(compressed_size),
        };

        match self.store.put_layer(record, diff_path).await {
            Ok(committed) => {
                self.publish(index, committed.layer_id.clone()).await;
                Ok(committed.layer_id)
            }
            Err(e) => {
                self.fail(index).await;
                Err(e)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Destination
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Destination for LayeredStoreDestination {
    fn supported_manifest_mime_types(&self) -> Vec<MediaType> {
        vec![MediaType::ImageManifest, MediaType::ImageIndex]
    }

    fn supports_signatures(&self) -> bool {
        true
    }

    fn desired_layer_compression(&self) -> CompressionOperation {
        CompressionOperation::Decompress
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
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
        reader: Box<dyn AsyncRead + Send + Unpin>,
        info: &BlobInfo,
        options: &super::PutBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<BlobInfo> {
        loop {
            match self.locks.try_acquire(&info.digest).await {
                Some(_guard) => {
                    let (path, size, diff_id) = self.stage(reader, info).await?;

                    cache.record_digest_uncompressed_pair(&info.digest, &diff_id).await?;
                    if let Some(algorithm) = info.compression_algorithm {
                        cache
                            .record_digest_compressor_name(&info.digest, algorithm.name())
                            .await?;
                    }

                    self.staged.lock().await.insert(
                        info.digest.clone(),
                        StagedBlob {
                            path: path.clone(),
                            size,
                            diff_id: if options.is_config { None } else { Some(diff_id.clone()) },
                        },
                    );

                    if let Some(index) = options.layer_index {
                        self.commit_layer(index, &path, &diff_id, &info.digest, size, size).await?;
                    }

                    return Ok(BlobInfo {
                        digest: info.digest.clone(),
                        size,
                        media_type: info.media_type.clone(),
                        compression_operation: info.compression_operation,
                        compression_algorithm: info.compression_algorithm,
                    });
                }
                None => {
                    // Another writer holds this digest's lock; assume it's
                    // mid-copy elsewhere, wait unbounded, then retry via
                    // TryReusingBlob since their commit may have landed.
                    drop(self.locks.acquire(&info.digest).await);
                    if let Some(reused) = self
                        .try_reusing_blob(info, &TryReusingBlobOptions::default(), cache)
                        .await?
                    {
                        return Ok(reused.info);
                    }
                    // Lock is free and no reusable blob appeared; loop back
                    // to acquire it ourselves and perform the write.
                }
            }
        }
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<Option<ReusedBlob>> {
        // Config blobs (no layer_index) have no parent-chain dependency:
        // reuse is a flat lookup by digest.
        let Some(index) = options.layer_index else {
            let staged = self.staged.lock().await;
            if let Some(blob) = staged.get(&info.digest) {
                return Ok(Some(ReusedBlob {
                    info: BlobInfo::new(info.digest.clone(), blob.size, info.media_type.clone()),
                }));
            }
            return Ok(None);
        };

        if options.empty_layer {
            // Empty placeholder layers carry no real content; nothing to
            // dedupe against the store, so the copier keeps its declared
            // empty-layer descriptor as-is.
            return Ok(None);
        }

        // Resolve the diffID this blob corresponds to, either because it's
        // already staged in this destination, or via the blob-info cache.
        let diff_id = {
            let staged = self.staged.lock().await;
            match staged.get(&info.digest).and_then(|b| b.diff_id.clone()) {
                Some(d) => Some(d),
                None => cache.uncompressed_digest(&info.digest).await?,
            }
        };

        let Some(diff_id) = diff_id else {
            return Ok(None);
        };

        let parent = self.parent_for(index).await?;
        let candidate_id = derive_layer_id(parent.as_deref(), &diff_id);

        if let Some(existing) = self.store.find_layer(&candidate_id).await? {
            self.publish(index, existing.layer_id.clone()).await;
            return Ok(Some(ReusedBlob {
                info: BlobInfo::new(
                    existing.compressed_digest.clone().unwrap_or(info.digest.clone()),
                    existing.compressed_size.unwrap_or(existing.uncompressed_size),
                    info.media_type.clone(),
                ),
            }));
        }

        if !options.can_substitute {
            self.fail(index).await;
            return Ok(None);
        }

        // The diffID's content exists in the store under a different parent
        // chain (different ancestry, same filesystem diff): adopt it under
        // our chain's id without re-fetching the diff bytes from the source.
        let Some(elsewhere) = self.store.find_layer_by_uncompressed_digest(&diff_id).await? else {
            self.fail(index).await;
            return Ok(None);
        };

        let record = LayerRecord {
            layer_id: candidate_id,
            parent_id: parent,
            uncompressed_digest: diff_id,
            uncompressed_size: elsewhere.uncompressed_size,
            compressed_digest: elsewhere.compressed_digest.clone(),
            compressed_size: elsewhere.compressed_size,
        };
        let diff_path = self.store.layer_diff_path(&elsewhere.layer_id);
        match self.store.put_layer(record, &diff_path).await {
            Ok(committed) => {
                self.publish(index, committed.layer_id.clone()).await;
                Ok(Some(ReusedBlob {
                    info: BlobInfo::new(
                        committed.compressed_digest.clone().unwrap_or(info.digest.clone()),
                        committed.compressed_size.unwrap_or(committed.uncompressed_size),
                        info.media_type.clone(),
                    ),
                }))
            }
            Err(e) => {
                self.fail(index).await;
                Err(e)
            }
        }
    }

    async fn put_manifest(&self, bytes: &[u8], _instance_digest: Option<&str>) -> OcifreightCoreResult<()> {
        // Held only in scratch state; `commit` writes it into the store's
        // big-data table alongside the config/signatures once every layer
        // has finished committing.
        let digest = Sha256::digest(bytes);
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode(digest)))
            .map_err(|e| OcifreightCoreError::custom(e.to_string()))?;
        let path = self.scratch_path(&digest);
        tokio::fs::write(&path, bytes).await?;
        self.staged.lock().await.insert(
            digest,
            StagedBlob {
                path,
                size: bytes.len() as i64,
                diff_id: None,
            },
        );
        Ok(())
    }

    async fn put_signatures_with_format(
        &self,
        signatures: &[Vec<u8>],
        _instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<()> {
        self.pending_signatures.lock().await.extend_from_slice(signatures);
        Ok(())
    }

    async fn commit(&self, unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()> {
        let kind = crate::manifest::parse(unparsed_toplevel, None)?;
        let layer_infos = crate::manifest::layer_infos(&kind)?;

        let committed = self.committed.lock().await.clone();
        let top_layer_id = (0..layer_infos.len())
            .rev()
            .find_map(|i| committed.get(&i).cloned());

        let manifest_digest = Sha256::digest(unparsed_toplevel);
        let manifest_digest_str = format!("sha256:{}", hex::encode(manifest_digest));

        let mut big_data = vec![
            ("manifest".to_string(), unparsed_toplevel.to_vec()),
            (format!("manifest-{manifest_digest_str}"), unparsed_toplevel.to_vec()),
        ];

        // The config blob, and anything else staged but not committed as a
        // layer (there should only ever be the one config entry), is copied
        // into big-data keyed by its own digest literal.
        {
            let staged = self.staged.lock().await;
            for (digest, blob) in staged.iter() {
                if blob.diff_id.is_none() && digest.to_string() != manifest_digest_str {
                    let bytes = tokio::fs::read(&blob.path).await?;
                    big_data.push((digest.to_string(), bytes));
                }
            }
        }

        let signatures = self.pending_signatures.lock().await;
        if !signatures.is_empty() {
            let mut encoded = Vec::new();
            for sig in signatures.iter() {
                encoded.extend_from_slice(&(sig.len() as u32).to_le_bytes());
                encoded.extend_from_slice(sig);
            }
            big_data.push(("signatures".to_string(), encoded));
        }

        // Docker/podman convention: an image's id is the digest of its
        // config blob when one exists (deterministic across re-pulls of the
        // same image); schema-1 images carry no normal config, so fall back
        // to the manifest digest itself.
        let image_id = manifest_config_digest(&kind)
            .map(|d| d.to_string().replace("sha256:", ""))
            .unwrap_or_else(|| manifest_digest_str.replace("sha256:", ""));

        let record = ImageRecord {
            image_id,
            top_layer_id,
            names: self.name.iter().cloned().collect(),
        };

        self.store.commit_image(record, big_data).await
    }

    async fn close(&self) -> OcifreightCoreResult<()> {
        Ok(())
    }
}

fn manifest_config_digest(kind: &crate::manifest::ManifestKind) -> Option<Digest> {
    match kind {
        crate::manifest::ManifestKind::Manifest(m) => Some(m.config().digest().clone()),
        _ => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Source
//--------------------------------------------------------------------------------------------------

/// A [`Source`] reading a previously committed image back out of the layered
/// local store, substituting uncompressed layer identities the way the store
/// always does (see [`Source::layer_infos_for_copy`]).
pub struct LayeredStoreSource {
    store: Arc<Store>,
    image: ImageRecord,
}

impl LayeredStoreSource {
    /// Opens a source over an already-committed image, resolved by name or id.
    pub async fn open(store: Arc<Store>, name_or_id: &str) -> OcifreightCoreResult<Self> {
        let image = match store.find_image_by_name(name_or_id).await? {
            Some(image) => image,
            None => store
                .find_image_by_id(name_or_id)
                .await?
                .ok_or_else(|| OcifreightCoreError::NotFound(name_or_id.to_string()))?,
        };
        Ok(Self { store, image })
    }

    async fn manifest_bytes(&self) -> OcifreightCoreResult<Vec<u8>> {
        self.store
            .get_big_data(&self.image.image_id, "manifest")
            .await?
            .ok_or_else(|| OcifreightCoreError::NotFound(format!("manifest for image {}", self.image.image_id)))
    }

    async fn layer_chain(&self) -> OcifreightCoreResult<Vec<LayerRecord>> {
        let mut chain = Vec::new();
        let mut next = self.image.top_layer_id.clone();
        while let Some(id) = next {
            let layer = self
                .store
                .find_layer(&id)
                .await?
                .ok_or_else(|| OcifreightCoreError::NotFound(format!("layer {id}")))?;
            next = layer.parent_id.clone();
            chain.push(layer);
        }
        chain.reverse();
        Ok(chain)
    }
}

#[async_trait]
impl Source for LayeredStoreSource {
    async fn get_manifest(&self, _instance_digest: Option<&str>) -> OcifreightCoreResult<(Vec<u8>, MediaType)> {
        let bytes = self.manifest_bytes().await?;
        let kind = crate::manifest::parse(&bytes, None)?;
        let media_type = match &kind {
            crate::manifest::ManifestKind::Manifest(m) => {
                m.media_type().clone().unwrap_or(MediaType::ImageManifest)
            }
            crate::manifest::ManifestKind::Index(i) => {
                i.media_type().clone().unwrap_or(MediaType::ImageIndex)
            }
            crate::manifest::ManifestKind::Schema1(_) => MediaType::Other(
                "application/vnd.docker.distribution.manifest.v1+json".to_string(),
            ),
        };
        Ok((bytes, media_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(Box<dyn AsyncRead + Send + Unpin>, i64)> {
        for layer in self.layer_chain().await? {
            if layer.compressed_digest.as_ref() == Some(&info.digest)
                || layer.uncompressed_digest == info.digest
            {
                let path = self.store.layer_diff_path(&layer.layer_id);
                let mut file = tokio::fs::File::open(&path).await?;
                let size = file.seek(SeekFrom::End(0)).await? as i64;
                file.seek(SeekFrom::Start(0)).await?;
                return Ok((Box::new(file), size));
            }
        }

        // Not a layer: must be the config blob, stored as big-data keyed by
        // its own digest literal.
        let bytes = self
            .store
            .get_big_data(&self.image.image_id, &info.digest.to_string())
            .await?
            .ok_or_else(|| OcifreightCoreError::NotFound(format!("blob {}", info.digest)))?;
        let size = bytes.len() as i64;
        Ok((Box::new(std::io::Cursor::new(bytes)), size))
    }

    async fn get_signatures(&self, _instance_digest: Option<&str>) -> OcifreightCoreResult<Vec<Vec<u8>>> {
        let Some(encoded) = self.store.get_big_data(&self.image.image_id, "signatures").await? else {
            return Ok(Vec::new());
        };
        let mut signatures = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 <= encoded.len() {
            let len = u32::from_le_bytes(encoded[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            if cursor + len > encoded.len() {
                break;
            }
            signatures.push(encoded[cursor..cursor + len].to_vec());
            cursor += len;
        }
        Ok(signatures)
    }

    async fn layer_infos_for_copy(
        &self,
        _instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<Option<Vec<BlobInfo>>> {
        let chain = self.layer_chain().await?;
        if chain.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            chain
                .into_iter()
                .map(|layer| {
                    let mut info = BlobInfo::new(
                        layer.uncompressed_digest.clone(),
                        layer.uncompressed_size,
                        MediaType::ImageLayer,
                    );
                    info.compression_algorithm = Some(CompressionAlgorithm::None);
                    info
                })
                .collect(),
        ))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(byte: u8) -> Digest {
        Digest::from_str(&format!("sha256:{}", hex::encode([byte; 32]))).unwrap()
    }

    #[tokio::test]
    async fn layer_signals_release_waiters_in_order() {
        let signals = LayerSignals::default();
        signals.signal(0, true).await;
        assert!(signals.wait(0).await.is_ok());
    }

    #[tokio::test]
    async fn layer_signals_propagate_failure() {
        let signals = LayerSignals::default();
        signals.signal(0, false).await;
        assert!(signals.wait(0).await.is_err());
    }

    #[tokio::test]
    async fn digest_locks_grant_timeout_falls_through_when_free() {
        let locks = DigestLocks::default();
        let d = digest_of(1);
        assert!(locks.try_acquire(&d).await.is_some());
    }

    #[tokio::test]
    async fn digest_locks_second_acquire_times_out_while_held() {
        let locks = DigestLocks::default();
        let d = digest_of(2);
        let _held = locks.try_acquire(&d).await.unwrap();
        assert!(locks.try_acquire(&d).await.is_none());
    }

    #[tokio::test]
    async fn destination_commits_single_layer_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let destination = LayeredStoreDestination::new(store.clone(), Some("test/image".to_string())).unwrap();

        let layer_bytes = b"hello layer content".to_vec();
        let layer_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&layer_bytes))
        ))
        .unwrap();
        let info = BlobInfo {
            digest: layer_digest.clone(),
            size: layer_bytes.len() as i64,
            media_type: MediaType::ImageLayer,
            compression_operation: None,
            compression_algorithm: Some(CompressionAlgorithm::None),
        };
        let cache = crate::blobinfocache::memory::MemoryBlobInfoCache::default();
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(layer_bytes));
        destination
            .put_blob(
                reader,
                &info,
                &PutBlobOptions {
                    is_config: false,
                    empty_layer: false,
                    layer_index: Some(0),
                },
                &cache,
            )
            .await
            .unwrap();

        let config_bytes = b"{}".to_vec();
        let config_digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&config_bytes))
        ))
        .unwrap();
        let config_info = BlobInfo::new(config_digest.clone(), config_bytes.len() as i64, MediaType::ImageConfig);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(config_bytes));
        destination
            .put_blob(
                reader,
                &config_info,
                &PutBlobOptions {
                    is_config: true,
                    empty_layer: false,
                    layer_index: None,
                },
                &cache,
            )
            .await
            .unwrap();

        let manifest = oci_spec::image::ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(
                oci_spec::image::DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .digest(config_digest)
                    .size(2i64)
                    .build()
                    .unwrap(),
            )
            .layers(vec![oci_spec::image::DescriptorBuilder::default()
                .media_type(MediaType::ImageLayer)
                .digest(layer_digest)
                .size(20i64)
                .build()
                .unwrap()])
            .build()
            .unwrap();
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        destination.put_manifest(&manifest_bytes, None).await.unwrap();
        destination.commit(&manifest_bytes).await.unwrap();

        let committed = store.find_image_by_name("test/image").await.unwrap();
        assert!(committed.is_some());
        assert!(committed.unwrap().top_layer_id.is_some());
    }
}
