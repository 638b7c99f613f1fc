//! Sqlite connection pooling and the CRUD this crate's metadata tables need:
//! layer records, image records, their names, and big-data blobs.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use oci_spec::image::Digest;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};

use super::{ImageRecord, LayerRecord};
use crate::{OcifreightCoreError, OcifreightCoreResult};

/// Embeds every `.sql` file under `lib/migrations/ocifreight`, applied in
/// filename order against a freshly-opened pool.
pub static MIGRATOR: Migrator = sqlx::migrate!("lib/migrations/ocifreight");

//--------------------------------------------------------------------------------------------------
// Functions: pool lifecycle
//--------------------------------------------------------------------------------------------------

/// Opens (creating the file if necessary) a connection pool at `path` and
/// runs pending migrations against it.
pub async fn get_or_create_pool(path: impl AsRef<Path>) -> OcifreightCoreResult<Pool<Sqlite>> {
    let path: PathBuf = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(OcifreightCoreError::Database)?;

    MIGRATOR
        .run(&pool)
        .await
        .map_err(OcifreightCoreError::Migration)?;

    tracing::debug!(path = %path.display(), "opened ocifreight metadata database");
    Ok(pool)
}

//--------------------------------------------------------------------------------------------------
// Functions: layers
//--------------------------------------------------------------------------------------------------

pub(crate) async fn get_layer(
    pool: &Pool<Sqlite>,
    layer_id: &str,
) -> OcifreightCoreResult<Option<LayerRecord>> {
    let row = sqlx::query(
        r#"
        SELECT layer_id, parent_id, uncompressed_digest, uncompressed_size,
               compressed_digest, compressed_size
        FROM store_layers WHERE layer_id = ?
        "#,
    )
    .bind(layer_id)
    .fetch_optional(pool)
    .await
    .map_err(OcifreightCoreError::Database)?;

    row.map(row_to_layer).transpose()
}

pub(crate) async fn get_layer_by_uncompressed_digest(
    pool: &Pool<Sqlite>,
    digest: &Digest,
) -> OcifreightCoreResult<Option<LayerRecord>> {
    let row = sqlx::query(
        r#"
        SELECT layer_id, parent_id, uncompressed_digest, uncompressed_size,
               compressed_digest, compressed_size
        FROM store_layers WHERE uncompressed_digest = ?
        "#,
    )
    .bind(digest.to_string())
    .fetch_optional(pool)
    .await
    .map_err(OcifreightCoreError::Database)?;

    row.map(row_to_layer).transpose()
}

pub(crate) async fn get_layer_by_compressed_digest(
    pool: &Pool<Sqlite>,
    digest: &Digest,
) -> OcifreightCoreResult<Option<LayerRecord>> {
    let row = sqlx::query(
        r#"
        SELECT layer_id, parent_id, uncompressed_digest, uncompressed_size,
               compressed_digest, compressed_size
        FROM store_layers WHERE compressed_digest = ?
        "#,
    )
    .bind(digest.to_string())
    .fetch_optional(pool)
    .await
    .map_err(OcifreightCoreError::Database)?;

    row.map(row_to_layer).transpose()
}

pub(crate) async fn insert_layer(pool: &Pool<Sqlite>, record: &LayerRecord) -> OcifreightCoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO store_layers
            (layer_id, parent_id, uncompressed_digest, uncompressed_size, compressed_digest, compressed_size)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (layer_id) DO NOTHING
        "#,
    )
    .bind(&record.layer_id)
    .bind(&record.parent_id)
    .bind(record.uncompressed_digest.to_string())
    .bind(record.uncompressed_size)
    .bind(record.compressed_digest.as_ref().map(|d| d.to_string()))
    .bind(record.compressed_size)
    .execute(pool)
    .await
    .map_err(OcifreightCoreError::Database)?;

    Ok(())
}

fn row_to_layer(row: sqlx::sqlite::SqliteRow) -> OcifreightCoreResult<LayerRecord> {
    let uncompressed_digest: String = row.get("uncompressed_digest");
    let compressed_digest: Option<String> = row.get("compressed_digest");
    Ok(LayerRecord {
        layer_id: row.get("layer_id"),
        parent_id: row.get("parent_id"),
        uncompressed_digest: parse_digest(&uncompressed_digest)?,
        uncompressed_size: row.get("uncompressed_size"),
        compressed_digest: compressed_digest.as_deref().map(parse_digest).transpose()?,
        compressed_size: row.get("compressed_size"),
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: images
//--------------------------------------------------------------------------------------------------

pub(crate) async fn commit_image(
    pool: &Pool<Sqlite>,
    record: &ImageRecord,
    big_data: &[(String, Vec<u8>)],
) -> OcifreightCoreResult<()> {
    let mut tx = pool.begin().await.map_err(OcifreightCoreError::Database)?;

    let existing_top: Option<Option<String>> =
        sqlx::query("SELECT top_layer_id FROM store_images WHERE image_id = ?")
            .bind(&record.image_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(OcifreightCoreError::Database)?
            .map(|row| row.get("top_layer_id"));

    if let Some(existing) = existing_top {
        if existing != record.top_layer_id {
            return Err(OcifreightCoreError::DuplicateId(record.image_id.clone()));
        }
    } else {
        sqlx::query("INSERT INTO store_images (image_id, top_layer_id) VALUES (?, ?)")
            .bind(&record.image_id)
            .bind(&record.top_layer_id)
            .execute(&mut *tx)
            .await
            .map_err(OcifreightCoreError::Database)?;
    }

    for name in &record.names {
        sqlx::query(
            r#"
            INSERT INTO store_image_names (image_id, name) VALUES (?, ?)
            ON CONFLICT (name) DO UPDATE SET image_id = excluded.image_id
            "#,
        )
        .bind(&record.image_id)
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(OcifreightCoreError::Database)?;
    }

    for (key, value) in big_data {
        sqlx::query(
            r#"
            INSERT INTO store_big_data (image_id, key, value) VALUES (?, ?, ?)
            ON CONFLICT (image_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&record.image_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(OcifreightCoreError::Database)?;
    }

    tx.commit().await.map_err(OcifreightCoreError::Database)?;
    Ok(())
}

pub(crate) async fn get_big_data(
    pool: &Pool<Sqlite>,
    image_id: &str,
    key: &str,
) -> OcifreightCoreResult<Option<Vec<u8>>> {
    Ok(
        sqlx::query("SELECT value FROM store_big_data WHERE image_id = ? AND key = ?")
            .bind(image_id)
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(OcifreightCoreError::Database)?
            .map(|row| row.get("value")),
    )
}

pub(crate) async fn get_image_by_id(
    pool: &Pool<Sqlite>,
    image_id: &str,
) -> OcifreightCoreResult<Option<ImageRecord>> {
    let Some(row) = sqlx::query("SELECT image_id, top_layer_id FROM store_images WHERE image_id = ?")
        .bind(image_id)
        .fetch_optional(pool)
        .await
        .map_err(OcifreightCoreError::Database)?
    else {
        return Ok(None);
    };

    let names = sqlx::query("SELECT name FROM store_image_names WHERE image_id = ?")
        .bind(image_id)
        .fetch_all(pool)
        .await
        .map_err(OcifreightCoreError::Database)?
        .into_iter()
        .map(|r| r.get("name"))
        .collect();

    Ok(Some(ImageRecord {
        image_id: row.get("image_id"),
        top_layer_id: row.get("top_layer_id"),
        names,
    }))
}

pub(crate) async fn get_image_by_name(
    pool: &Pool<Sqlite>,
    name: &str,
) -> OcifreightCoreResult<Option<ImageRecord>> {
    let Some(row) = sqlx::query("SELECT image_id FROM store_image_names WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(OcifreightCoreError::Database)?
    else {
        return Ok(None);
    };
    let image_id: String = row.get("image_id");
    get_image_by_id(pool, &image_id).await
}

fn parse_digest(s: &str) -> OcifreightCoreResult<Digest> {
    Digest::from_str(s).map_err(|e| OcifreightCoreError::MalformedManifest(e.to_string()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(c: char) -> Digest {
        Digest::from_str(&format!("sha256:{}", c.to_string().repeat(64))).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_expected_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = get_or_create_pool(dir.path().join("meta.db")).await.unwrap();
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'store_layers'")
            .fetch_optional(&pool)
            .await
            .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn insert_and_fetch_layer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = get_or_create_pool(dir.path().join("meta.db")).await.unwrap();
        let record = LayerRecord {
            layer_id: "abc123".to_string(),
            parent_id: None,
            uncompressed_digest: d('a'),
            uncompressed_size: 100,
            compressed_digest: Some(d('b')),
            compressed_size: Some(50),
        };
        insert_layer(&pool, &record).await.unwrap();
        let fetched = get_layer(&pool, "abc123").await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn commit_image_rejects_conflicting_top_layer() {
        let dir = tempfile::tempdir().unwrap();
        let pool = get_or_create_pool(dir.path().join("meta.db")).await.unwrap();
        let first = ImageRecord {
            image_id: "img1".to_string(),
            top_layer_id: Some("layerA".to_string()),
            names: vec!["repo:tag".to_string()],
        };
        commit_image(&pool, &first, &[("manifest".to_string(), b"{}".to_vec())])
            .await
            .unwrap();

        let conflicting = ImageRecord {
            image_id: "img1".to_string(),
            top_layer_id: Some("layerB".to_string()),
            names: vec![],
        };
        let err = commit_image(&pool, &conflicting, &[]).await.unwrap_err();
        assert!(matches!(err, OcifreightCoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn find_image_by_name_resolves_committed_image() {
        let dir = tempfile::tempdir().unwrap();
        let pool = get_or_create_pool(dir.path().join("meta.db")).await.unwrap();
        let record = ImageRecord {
            image_id: "img2".to_string(),
            top_layer_id: None,
            names: vec!["my/repo:latest".to_string()],
        };
        commit_image(&pool, &record, &[("manifest".to_string(), b"{}".to_vec())])
            .await
            .unwrap();

        let found = get_image_by_name(&pool, "my/repo:latest").await.unwrap().unwrap();
        assert_eq!(found.image_id, "img2");
        let data = get_big_data(&pool, "img2", "manifest").await.unwrap().unwrap();
        assert_eq!(data, b"{}".to_vec());
    }
}
