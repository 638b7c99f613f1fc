//! Persistence primitives for the layered local store: the sqlite schema
//! shared with the blob-info cache, deterministic layer-id derivation, and
//! the high-level [`Store`] handle a layered-store destination drives.

pub mod db;
pub mod layer;

use std::path::{Path, PathBuf};

use oci_spec::image::Digest;
use sqlx::{Pool, Sqlite};
use tokio::fs;

use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A deterministically-derived, content-addressed filesystem layer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    /// The derived layer id.
    pub layer_id: String,
    /// The parent layer's id, or empty for a base layer.
    pub parent_id: Option<String>,
    /// Digest of the layer's uncompressed content (the diffID).
    pub uncompressed_digest: Digest,
    /// Size of the uncompressed content.
    pub uncompressed_size: i64,
    /// Digest of the layer's compressed blob as received, if known.
    pub compressed_digest: Option<Digest>,
    /// Size of the compressed blob, if known.
    pub compressed_size: Option<i64>,
}

/// A committed image record.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// The deterministic (or random-fallback) image id.
    pub image_id: String,
    /// The id of the topmost layer in this image's chain, if it has layers.
    pub top_layer_id: Option<String>,
    /// Names (tags) this image is known by.
    pub names: Vec<String>,
}

/// A handle onto one layered store's on-disk state: its sqlite metadata pool
/// and the directory raw layer diffs are written under. Mounting or applying
/// a layer's diff to a live rootfs is out of scope here, so `put_layer` only
/// needs to make the diff content-addressable and durable, not apply it to
/// anything.
pub struct Store {
    pool: Pool<Sqlite>,
    graph_root: PathBuf,
}

impl Store {
    /// Opens (creating if necessary) a store rooted at `graph_root`, with its
    /// metadata database at `graph_root/<OCI_DB_FILENAME>` and layer blobs
    /// under `graph_root/<LAYERS_SUBDIR>`.
    pub async fn open(graph_root: impl AsRef<Path>) -> OcifreightCoreResult<Self> {
        let graph_root = graph_root.as_ref().to_path_buf();
        fs::create_dir_all(&graph_root).await?;
        fs::create_dir_all(graph_root.join(ocifreight_utils::LAYERS_SUBDIR)).await?;
        let pool = db::get_or_create_pool(graph_root.join(ocifreight_utils::OCI_DB_FILENAME)).await?;
        Ok(Self { pool, graph_root })
    }

    /// The connection pool backing this store's metadata, reusable by a
    /// [`crate::blobinfocache::sqlite::SqliteBlobInfoCache`] sharing the same
    /// database.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn layer_blob_path(&self, layer_id: &str) -> PathBuf {
        self.graph_root
            .join(ocifreight_utils::LAYERS_SUBDIR)
            .join(format!("{layer_id}.tar"))
    }

    /// The path a committed layer's raw diff is stored at. Exposed so a
    /// destination adopting an existing layer under a *different* parent
    /// (same diffID, new chain) can re-derive a new id without re-fetching
    /// the diff bytes from the source.
    pub fn layer_diff_path(&self, layer_id: &str) -> PathBuf {
        self.layer_blob_path(layer_id)
    }

    /// Looks up an existing layer by its derived id.
    pub async fn find_layer(&self, layer_id: &str) -> OcifreightCoreResult<Option<LayerRecord>> {
        db::get_layer(&self.pool, layer_id).await
    }

    /// Looks up an existing layer by the digest of its uncompressed content.
    pub async fn find_layer_by_uncompressed_digest(
        &self,
        digest: &Digest,
    ) -> OcifreightCoreResult<Option<LayerRecord>> {
        db::get_layer_by_uncompressed_digest(&self.pool, digest).await
    }

    /// Looks up an existing layer by the digest of its compressed blob.
    pub async fn find_layer_by_compressed_digest(
        &self,
        digest: &Digest,
    ) -> OcifreightCoreResult<Option<LayerRecord>> {
        db::get_layer_by_compressed_digest(&self.pool, digest).await
    }

    /// Commits a new layer: copies `diff_path` into the store's
    /// content-addressed layer directory under the derived id, and records
    /// the layer's metadata row. If a layer with the same id already exists
    /// it is reused and `diff_path` is left untouched.
    pub async fn put_layer(
        &self,
        record: LayerRecord,
        diff_path: &Path,
    ) -> OcifreightCoreResult<LayerRecord> {
        if let Some(existing) = self.find_layer(&record.layer_id).await? {
            return Ok(existing);
        }

        let dest = self.layer_blob_path(&record.layer_id);
        fs::copy(diff_path, &dest).await?;
        db::insert_layer(&self.pool, &record).await?;
        Ok(record)
    }

    /// Creates (or replaces) the image record for `image_id`, writing every
    /// big-data entry and name atomically from the caller's point of view. If
    /// an image with this id already exists with a different top layer,
    /// fails with [`crate::OcifreightCoreError::DuplicateId`].
    pub async fn commit_image(
        &self,
        record: ImageRecord,
        big_data: Vec<(String, Vec<u8>)>,
    ) -> OcifreightCoreResult<()> {
        db::commit_image(&self.pool, &record, &big_data).await
    }

    /// Reads a big-data entry (manifest, `manifest-<digest>`, signatures, or
    /// an arbitrary cached blob) back out for a committed image.
    pub async fn get_big_data(
        &self,
        image_id: &str,
        key: &str,
    ) -> OcifreightCoreResult<Option<Vec<u8>>> {
        db::get_big_data(&self.pool, image_id, key).await
    }

    /// Resolves an image by one of its names.
    pub async fn find_image_by_name(&self, name: &str) -> OcifreightCoreResult<Option<ImageRecord>> {
        db::get_image_by_name(&self.pool, name).await
    }

    /// Resolves an image by its id.
    pub async fn find_image_by_id(&self, image_id: &str) -> OcifreightCoreResult<Option<ImageRecord>> {
        db::get_image_by_id(&self.pool, image_id).await
    }
}
