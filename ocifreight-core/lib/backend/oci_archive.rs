//! The `oci-archive:` backend: a single-file tar wrapper around an OCI
//! layout directory (see [`super::oci_layout`]). Reading lazily untars the
//! archive into a scratch directory on first access and delegates everything
//! else to an [`OciLayoutSource`]; writing stages into a scratch OCI layout
//! directory via [`OciLayoutDestination`] and tars it up on
//! [`Destination::commit`]. Archive entries carry no uid/gid/uname/gname —
//! only content and structure are meaningful to an OCI layout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use oci_spec::image::MediaType;
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;

use super::oci_layout::{OciLayoutDestination, OciLayoutSource};
use super::{Destination, PutBlobOptions, ReusedBlob, Source, TryReusingBlobOptions};
use crate::blobinfocache::BlobInfoCache;
use crate::digest::BlobInfo;
use crate::transport::Selector;
use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Source
//--------------------------------------------------------------------------------------------------

/// Reads an image out of an `oci-archive:` tarball.
pub struct OciArchiveSource {
    archive_path: PathBuf,
    selector: Selector,
    scratch: TempDir,
    extracted: OnceCell<OciLayoutSource>,
}

impl OciArchiveSource {
    /// Opens a source over `archive_path`; the archive is not read until the
    /// first [`Source`] method call.
    pub fn new(archive_path: impl Into<PathBuf>, selector: Selector) -> OcifreightCoreResult<Self> {
        Ok(Self {
            archive_path: archive_path.into(),
            selector,
            scratch: TempDir::new()?,
            extracted: OnceCell::new(),
        })
    }

    async fn inner(&self) -> OcifreightCoreResult<&OciLayoutSource> {
        self.extracted
            .get_or_try_init(|| async {
                untar(&self.archive_path, self.scratch.path()).await?;
                Ok::<_, crate::OcifreightCoreError>(OciLayoutSource::new(
                    self.scratch.path(),
                    self.selector.clone(),
                ))
            })
            .await
    }
}

#[async_trait]
impl Source for OciArchiveSource {
    async fn get_manifest(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<(Vec<u8>, MediaType)> {
        self.inner().await?.get_manifest(instance_digest).await
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(Box<dyn AsyncRead + Send + Unpin>, i64)> {
        self.inner().await?.get_blob(info).await
    }

    async fn get_signatures(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<Vec<Vec<u8>>> {
        self.inner().await?.get_signatures(instance_digest).await
    }

    async fn layer_infos_for_copy(
        &self,
        instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<Option<Vec<BlobInfo>>> {
        self.inner().await?.layer_infos_for_copy(instance_digest).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        // The scratch directory is extracted once under `OnceCell`; after
        // that, reads are plain file opens, same as `oci_layout`.
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Destination
//--------------------------------------------------------------------------------------------------

/// Writes an image into a new (or replaced) `oci-archive:` tarball.
pub struct OciArchiveDestination {
    archive_path: PathBuf,
    scratch: TempDir,
    inner: OciLayoutDestination,
}

impl OciArchiveDestination {
    /// Stages into a scratch OCI layout directory; [`Destination::commit`]
    /// tars it up into `archive_path`.
    pub async fn new(archive_path: impl Into<PathBuf>, selector: Selector) -> OcifreightCoreResult<Self> {
        let scratch = TempDir::new()?;
        let inner = OciLayoutDestination::new(scratch.path(), selector).await?;
        Ok(Self {
            archive_path: archive_path.into(),
            scratch,
            inner,
        })
    }
}

#[async_trait]
impl Destination for OciArchiveDestination {
    fn supported_manifest_mime_types(&self) -> Vec<MediaType> {
        self.inner.supported_manifest_mime_types()
    }

    fn supports_signatures(&self) -> bool {
        self.inner.supports_signatures()
    }

    fn desired_layer_compression(&self) -> crate::digest::CompressionOperation {
        self.inner.desired_layer_compression()
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        self.inner.accepts_foreign_layer_urls()
    }

    fn must_match_runtime_os(&self) -> bool {
        self.inner.must_match_runtime_os()
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        self.inner.ignores_embedded_docker_reference()
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        self.inner.has_thread_safe_put_blob()
    }

    fn supports_put_blob_partial(&self) -> bool {
        self.inner.supports_put_blob_partial()
    }

    async fn put_blob(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        info: &BlobInfo,
        options: &PutBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<BlobInfo> {
        self.inner.put_blob(reader, info, options, cache).await
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<Option<ReusedBlob>> {
        self.inner.try_reusing_blob(info, options, cache).await
    }

    async fn put_manifest(&self, bytes: &[u8], instance_digest: Option<&str>) -> OcifreightCoreResult<()> {
        self.inner.put_manifest(bytes, instance_digest).await
    }

    async fn put_signatures_with_format(
        &self,
        signatures: &[Vec<u8>],
        instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<()> {
        self.inner.put_signatures_with_format(signatures, instance_digest).await
    }

    async fn commit(&self, unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()> {
        self.inner.commit(unparsed_toplevel).await?;
        tar(self.scratch.path(), &self.archive_path).await
    }

    async fn close(&self) -> OcifreightCoreResult<()> {
        self.inner.close().await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: archive (un)packing
//--------------------------------------------------------------------------------------------------

async fn untar(archive_path: &Path, into: &Path) -> OcifreightCoreResult<()> {
    let file = fs::File::open(archive_path).await?;
    let mut archive = astral_tokio_tar::Archive::new(file);
    let mut entries = archive.entries()?;

    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        let relative = entry.path()?.to_path_buf();
        let target = into.join(&relative);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target).await?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut out = fs::File::create(&target).await?;
        tokio::io::copy(&mut entry, &mut out).await?;
    }

    Ok(())
}

/// Tars up every file under `src` into `dest`, zeroing uid/gid/uname/gname on
/// every entry: an OCI layout's identity is its content and paths, not the
/// filesystem ownership of whatever machine staged it.
async fn tar(src: &Path, dest: &Path) -> OcifreightCoreResult<()> {
    let out = fs::File::create(dest).await?;
    let mut builder = astral_tokio_tar::Builder::new(out);

    let mut stack = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let relative = path.strip_prefix(src).expect("walked path is under src");
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                let mut header = astral_tokio_tar::Header::new_gnu();
                header.set_entry_type(astral_tokio_tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                header.set_cksum();
                builder.append_data(&mut header, relative, tokio::io::empty()).await?;
                stack.push(path);
            } else {
                let mut header = astral_tokio_tar::Header::new_gnu();
                header.set_entry_type(astral_tokio_tar::EntryType::Regular);
                header.set_size(metadata.len());
                header.set_mode(0o644);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                header.set_cksum();
                let file = fs::File::open(&path).await?;
                builder.append_data(&mut header, relative, file).await?;
            }
        }
    }

    builder.finish().await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_single_file_through_tar_and_untar() {
        let staged = tempfile::tempdir().unwrap();
        fs::create_dir_all(staged.path().join("blobs/sha256")).await.unwrap();
        fs::write(staged.path().join("blobs/sha256/deadbeef"), b"hello").await.unwrap();
        fs::write(staged.path().join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)
            .await
            .unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        tar(staged.path(), archive.path()).await.unwrap();

        let extracted = tempfile::tempdir().unwrap();
        untar(archive.path(), extracted.path()).await.unwrap();

        let roundtripped = fs::read(extracted.path().join("blobs/sha256/deadbeef")).await.unwrap();
        assert_eq!(roundtripped, b"hello");
    }
}
