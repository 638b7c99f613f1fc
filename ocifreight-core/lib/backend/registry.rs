//! The `docker:` backend: a [`Source`]/[`Destination`] pair over a remote v2
//! registry via [`oci_client::Client`]: a single shared `Client`,
//! `pull_manifest_raw`/`pull_blob_stream_partial` for reads, and the
//! client's push counterparts for writes.
//!
//! Blob reads resume across retries: the blob is staged under
//! `<ocifreight home>/downloads/<algo>/<hex>`, opened in append mode when a
//! partial download already exists, and the registry is asked for only the
//! remaining byte range.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use oci_client::client::ClientConfig;
use oci_client::manifest::{OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client as OciClient, Reference as OciReference};
use oci_spec::image::{Digest, MediaType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::{Destination, PutBlobOptions, ReusedBlob, Source, TryReusingBlobOptions};
use crate::blobinfocache::BlobInfoCache;
use crate::digest::BlobInfo;
use crate::transport::docker::DockerReference;
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn to_oci_reference(reference: &DockerReference) -> OcifreightCoreResult<OciReference> {
    let mut s = format!("{}/{}", reference.registry, reference.repository);
    if let Some(tag) = &reference.tag {
        s.push(':');
        s.push_str(tag);
    }
    if let Some(digest) = &reference.digest {
        s.push('@');
        s.push_str(digest);
    }
    OciReference::from_str(&s).map_err(|e| OcifreightCoreError::InvalidReference(e.to_string()))
}

fn client_config() -> ClientConfig {
    // A platform resolver only matters when pulling an index without an
    // explicit instance digest; the copy engine always resolves the
    // platform itself via `crate::manifest::select_platform`, so the
    // default (first-entry) resolver is never actually consulted here.
    ClientConfig::default()
}

fn download_staging_path(digest: &Digest) -> PathBuf {
    ocifreight_utils::get_ocifreight_home_path()
        .join(ocifreight_utils::DOWNLOADS_SUBDIR)
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

/// Downloads `digest` into its staging path, resuming from whatever has
/// already been written there, then verifies the completed file's hash
/// before returning it: append mode when a partial file already exists, a
/// fresh file otherwise, and a `downloaded_size == declared_size`
/// short-circuit when nothing is missing.
async fn download_blob_resumable(
    client: &OciClient,
    reference: &OciReference,
    info: &BlobInfo,
) -> OcifreightCoreResult<(tokio::fs::File, i64)> {
    let download_path = download_staging_path(&info.digest);
    if let Some(parent) = download_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let downloaded_size = tokio::fs::metadata(&download_path).await.map(|m| m.len()).unwrap_or(0);
    if info.size_is_known() && downloaded_size as i64 == info.size {
        let file = tokio::fs::File::open(&download_path).await?;
        return Ok((file, info.size));
    }

    let layer = oci_client::client::LayerDescriptor {
        digest: info.digest.as_ref(),
        urls: &None,
    };
    let response = client
        .pull_blob_stream_partial(reference, &layer, downloaded_size, None)
        .await
        .map_err(OcifreightCoreError::Registry)?;
    let stream = match response {
        oci_client::client::BlobResponse::Full(s) => s,
        oci_client::client::BlobResponse::Partial(s) => s,
    };

    let mut open_options = tokio::fs::OpenOptions::new();
    if downloaded_size == 0 {
        open_options.create(true).truncate(true).write(true);
    } else {
        open_options.append(true);
    }
    let mut file = open_options.open(&download_path).await?;

    let mut byte_stream = stream
        .stream
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    while let Some(chunk) = byte_stream.next().await {
        let bytes: bytes::Bytes = chunk?;
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    drop(file);

    let actual_hash = hex::encode(crate::utils::get_file_hash(&download_path, info.digest.algorithm()).await?);
    if actual_hash != info.digest.digest() {
        tokio::fs::remove_file(&download_path).await?;
        return Err(OcifreightCoreError::DigestMismatch {
            expected: info.digest.to_string(),
            actual: format!("{}:{actual_hash}", info.digest.algorithm()),
        });
    }

    let file = tokio::fs::File::open(&download_path).await?;
    let size = file.metadata().await?.len() as i64;
    Ok((file, size))
}

//--------------------------------------------------------------------------------------------------
// Source
//--------------------------------------------------------------------------------------------------

/// Reads an image from a remote v2 registry.
pub struct RegistrySource {
    client: OciClient,
    reference: OciReference,
    auth: RegistryAuth,
}

impl RegistrySource {
    /// Opens a source for `reference`, authenticating with `auth`.
    pub fn new(reference: &DockerReference, auth: RegistryAuth) -> OcifreightCoreResult<Self> {
        let oci_reference = to_oci_reference(reference)?;
        Ok(Self {
            client: OciClient::new(client_config()),
            reference: oci_reference,
            auth,
        })
    }
}

#[async_trait]
impl Source for RegistrySource {
    async fn get_manifest(&self, instance_digest: Option<&str>) -> OcifreightCoreResult<(Vec<u8>, MediaType)> {
        let reference = match instance_digest {
            Some(digest) => OciReference::with_digest(
                self.reference.registry().to_string(),
                self.reference.repository().to_string(),
                digest.to_string(),
            ),
            None => self.reference.clone(),
        };

        let (bytes, _digest) = self
            .client
            .pull_manifest_raw(&reference, &self.auth, &["*/*"])
            .await
            .map_err(OcifreightCoreError::Registry)?;

        let media_type = crate::digest::guess_media_type(&bytes)?;
        Ok((bytes, media_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
    ) -> OcifreightCoreResult<(Box<dyn AsyncRead + Send + Unpin>, i64)> {
        let (file, size) = download_blob_resumable(&self.client, &self.reference, info).await?;
        Ok((Box::new(file), size))
    }

    async fn get_signatures(&self, _instance_digest: Option<&str>) -> OcifreightCoreResult<Vec<Vec<u8>>> {
        // Plain v2 registries have no native detached-signature storage; a
        // sigstore-convention image would carry its signature as a separate
        // referrer manifest, which a copy from `docker:` does not resolve.
        Ok(Vec::new())
    }

    async fn layer_infos_for_copy(
        &self,
        _instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<Option<Vec<BlobInfo>>> {
        Ok(None)
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Destination
//--------------------------------------------------------------------------------------------------

/// Writes an image to a remote v2 registry.
pub struct RegistryDestination {
    client: OciClient,
    reference: OciReference,
    auth: RegistryAuth,
    scope: String,
}

impl RegistryDestination {
    /// Opens a destination for `reference`, authenticating with `auth`.
    pub fn new(reference: &DockerReference, auth: RegistryAuth) -> OcifreightCoreResult<Self> {
        let oci_reference = to_oci_reference(reference)?;
        let scope = format!("{}/{}", reference.registry, reference.repository);
        Ok(Self {
            client: OciClient::new(client_config()),
            reference: oci_reference,
            auth,
            scope,
        })
    }
}

#[async_trait]
impl Destination for RegistryDestination {
    fn supported_manifest_mime_types(&self) -> Vec<MediaType> {
        vec![MediaType::ImageManifest, MediaType::ImageIndex]
    }

    fn supports_signatures(&self) -> bool {
        false
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
        false
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
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;

        if info.size_is_known() && bytes.len() as i64 != info.size {
            return Err(OcifreightCoreError::SizeMismatch {
                expected: info.size,
                actual: bytes.len() as i64,
            });
        }

        self.client
            .push_blob(&self.reference, &bytes, &info.digest.to_string())
            .await
            .map_err(OcifreightCoreError::Registry)?;

        cache
            .record_known_location(
                "docker",
                &self.scope,
                &info.digest,
                format!("{}@{}", self.scope, info.digest),
            )
            .await?;

        Ok(BlobInfo {
            digest: info.digest.clone(),
            size: bytes.len() as i64,
            media_type: info.media_type.clone(),
            compression_operation: info.compression_operation,
            compression_algorithm: info.compression_algorithm,
        })
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions,
        cache: &dyn BlobInfoCache,
    ) -> OcifreightCoreResult<Option<ReusedBlob>> {
        let candidates = cache
            .candidate_locations2(
                "docker",
                options.src_scope.as_deref().unwrap_or(&self.scope),
                &info.digest,
                options.can_substitute,
            )
            .await?;

        for candidate in candidates {
            if candidate.location.starts_with(&self.scope)
                && super::candidate_matches(&candidate.compressor, options)
            {
                return Ok(Some(ReusedBlob {
                    info: BlobInfo::new(candidate.digest, info.size, info.media_type.clone()),
                }));
            }
        }

        Ok(None)
    }

    async fn put_manifest(&self, bytes: &[u8], instance_digest: Option<&str>) -> OcifreightCoreResult<()> {
        let media_type = crate::digest::guess_media_type(bytes)?;
        let manifest: OciManifest = if crate::digest::is_index_media_type(&media_type) {
            OciManifest::ImageIndex(
                serde_json::from_slice(bytes).map_err(OcifreightCoreError::Json)?,
            )
        } else {
            OciManifest::Image(
                serde_json::from_slice::<OciImageManifest>(bytes).map_err(OcifreightCoreError::Json)?,
            )
        };

        let reference = match instance_digest {
            Some(digest) => OciReference::with_digest(
                self.reference.registry().to_string(),
                self.reference.repository().to_string(),
                digest.to_string(),
            ),
            None => self.reference.clone(),
        };

        self.client
            .push_manifest(&reference, &manifest)
            .await
            .map_err(OcifreightCoreError::Registry)?;

        Ok(())
    }

    async fn put_signatures_with_format(
        &self,
        signatures: &[Vec<u8>],
        _instance_digest: Option<&str>,
    ) -> OcifreightCoreResult<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        Err(OcifreightCoreError::Unsupported(
            "plain docker registries have no native detached-signature storage".to_string(),
        ))
    }

    async fn commit(&self, _unparsed_toplevel: &[u8]) -> OcifreightCoreResult<()> {
        // Every write so far has already been a durable registry API call;
        // there is no local staging area to flush.
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_oci_reference_round_trips_tag() {
        let docker_ref = DockerReference {
            registry: "docker.io".to_string(),
            repository: "library/alpine".to_string(),
            tag: Some("latest".to_string()),
            digest: None,
        };
        let oci_ref = to_oci_reference(&docker_ref).unwrap();
        assert_eq!(oci_ref.repository(), "library/alpine");
        assert_eq!(oci_ref.tag(), Some("latest"));
    }

    #[test]
    fn to_oci_reference_round_trips_digest() {
        let docker_ref = DockerReference {
            registry: "ghcr.io".to_string(),
            repository: "org/repo".to_string(),
            tag: None,
            digest: Some(
                "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            ),
        };
        let oci_ref = to_oci_reference(&docker_ref).unwrap();
        assert_eq!(oci_ref.digest(), Some("sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    struct EnvGuard {
        key: &'static str,
        prev: Option<std::ffi::OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<std::ffi::OsString>) -> Self {
            let prev = std::env::var_os(key);
            unsafe { std::env::set_var(key, value.into()) };
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match self.prev.take() {
                Some(value) => unsafe { std::env::set_var(self.key, value) },
                None => unsafe { std::env::remove_var(self.key) },
            }
        }
    }

    #[tokio::test]
    async fn download_blob_resumable_short_circuits_when_already_complete() {
        use sha2::Digest as _;

        let home = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::set(ocifreight_utils::OCIFREIGHT_HOME_ENV_VAR, home.path());

        let content = vec![0x5Au8; 4096];
        let digest =
            Digest::from_str(&format!("sha256:{}", hex::encode(sha2::Sha256::digest(&content))))
                .unwrap();
        let staged = download_staging_path(&digest);
        tokio::fs::create_dir_all(staged.parent().unwrap()).await.unwrap();
        tokio::fs::write(&staged, &content).await.unwrap();

        let info = BlobInfo::new(digest, content.len() as i64, MediaType::ImageLayerGzip);
        let client = OciClient::new(client_config());
        let reference = OciReference::from_str("registry.example.com/app:latest").unwrap();

        // Declared size already matches what's on disk, so this must resolve
        // without ever touching the client/network.
        let (file, size) = download_blob_resumable(&client, &reference, &info).await.unwrap();
        assert_eq!(size, content.len() as i64);
        drop(file);
    }

    #[test]
    fn download_staging_path_is_content_addressed() {
        let home = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::set(ocifreight_utils::OCIFREIGHT_HOME_ENV_VAR, home.path());
        let digest = Digest::from_str(&format!("sha256:{}", "7".repeat(64))).unwrap();
        let path = download_staging_path(&digest);
        assert!(path.ends_with(format!("downloads/sha256/{}", "7".repeat(64))));
    }
}
