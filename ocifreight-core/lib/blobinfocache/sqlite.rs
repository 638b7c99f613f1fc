//! Persistent, sqlite-backed [`BlobInfoCache`]: the same contract as
//! [`super::memory::MemoryBlobInfoCache`], but durable across process
//! restarts — the mapping an application configures to survive between CLI
//! invocations.

use std::str::FromStr;

use oci_spec::image::Digest;
use sqlx::{Pool, Row, Sqlite};

use super::{Candidate, Candidate2, BlobInfoCache, Location, REPLACEMENT_ATTEMPTS};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A blob-info cache backed by a sqlite database shared with the layered
/// store's own metadata (see [`crate::store::db`]); both run their
/// migrations from the same `lib/migrations/ocifreight` directory.
pub struct SqliteBlobInfoCache {
    pool: Pool<Sqlite>,
}

impl SqliteBlobInfoCache {
    /// Wraps an already-migrated connection pool.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl BlobInfoCache for SqliteBlobInfoCache {
    async fn uncompressed_digest(&self, digest: &Digest) -> OcifreightCoreResult<Option<Digest>> {
        if let Some(row) = sqlx::query("SELECT uncompressed_digest FROM blob_uncompressed_pairs WHERE compressed_digest = ?")
            .bind(digest.to_string())
            .fetch_optional(&self.pool)
            .await?
        {
            let value: String = row.get("uncompressed_digest");
            return Ok(Some(parse_digest(&value)?));
        }

        let is_target = sqlx::query(
            "SELECT 1 FROM blob_uncompressed_pairs WHERE uncompressed_digest = ? LIMIT 1",
        )
        .bind(digest.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(is_target.map(|_| digest.clone()))
    }

    async fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> OcifreightCoreResult<()> {
        if let Some(row) = sqlx::query(
            "SELECT uncompressed_digest FROM blob_uncompressed_pairs WHERE compressed_digest = ?",
        )
        .bind(compressed.to_string())
        .fetch_optional(&self.pool)
        .await?
        {
            let existing: String = row.get("uncompressed_digest");
            if existing != uncompressed.to_string() {
                tracing::warn!(
                    %compressed, existing, new = %uncompressed,
                    "conflicting uncompressed-digest pair recorded; overwriting"
                );
            }
        }

        sqlx::query(
            r#"
            INSERT INTO blob_uncompressed_pairs (compressed_digest, uncompressed_digest)
            VALUES (?, ?)
            ON CONFLICT (compressed_digest) DO UPDATE SET uncompressed_digest = excluded.uncompressed_digest
            "#,
        )
        .bind(compressed.to_string())
        .bind(uncompressed.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_digest_compressor_name(
        &self,
        digest: &Digest,
        name: &str,
    ) -> OcifreightCoreResult<()> {
        let existing = sqlx::query("SELECT compressor FROM blob_compressors WHERE digest = ?")
            .bind(digest.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get::<String, _>("compressor"));

        let to_store = match &existing {
            Some(existing_name) if existing_name != name => {
                tracing::warn!(%digest, existing = existing_name.as_str(), new = name, "conflicting compressor name recorded; downgrading to unknown");
                "unknown"
            }
            _ => name,
        };

        sqlx::query(
            r#"
            INSERT INTO blob_compressors (digest, compressor)
            VALUES (?, ?)
            ON CONFLICT (digest) DO UPDATE SET compressor = excluded.compressor
            "#,
        )
        .bind(digest.to_string())
        .bind(to_store)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compressor_name(&self, digest: &Digest) -> OcifreightCoreResult<Option<String>> {
        Ok(
            sqlx::query("SELECT compressor FROM blob_compressors WHERE digest = ?")
                .bind(digest.to_string())
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get("compressor")),
        )
    }

    async fn record_known_location(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        location: Location,
    ) -> OcifreightCoreResult<()> {
        sqlx::query(
            "DELETE FROM blob_locations WHERE transport = ? AND scope = ? AND digest = ? AND location = ?",
        )
        .bind(transport)
        .bind(scope)
        .bind(digest.to_string())
        .bind(&location)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO blob_locations (transport, scope, digest, location)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(transport)
        .bind(scope)
        .bind(digest.to_string())
        .bind(location)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn candidate_locations(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        can_substitute: bool,
    ) -> OcifreightCoreResult<Vec<Candidate>> {
        Ok(self
            .candidate_locations2(transport, scope, digest, can_substitute)
            .await?
            .into_iter()
            .map(|c| Candidate {
                digest: c.digest,
                location: c.location,
            })
            .collect())
    }

    async fn candidate_locations2(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        can_substitute: bool,
    ) -> OcifreightCoreResult<Vec<Candidate2>> {
        let mut out = Vec::new();
        self.push_digest_candidates(transport, scope, digest, &mut out).await?;

        if can_substitute {
            if let Some(uncompressed) = self.uncompressed_digest(digest).await? {
                for other in self.other_digests_sharing(digest, &uncompressed).await? {
                    if out.len() >= REPLACEMENT_ATTEMPTS {
                        break;
                    }
                    self.push_digest_candidates(transport, scope, &other, &mut out).await?;
                }
                if uncompressed != *digest && out.len() < REPLACEMENT_ATTEMPTS {
                    self.push_digest_candidates(transport, scope, &uncompressed, &mut out).await?;
                }
            }
        }

        Ok(out)
    }
}

impl SqliteBlobInfoCache {
    async fn push_digest_candidates(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        out: &mut Vec<Candidate2>,
    ) -> OcifreightCoreResult<()> {
        if out.len() >= REPLACEMENT_ATTEMPTS {
            return Ok(());
        }
        let Some(compressor) = self.compressor_name(digest).await? else {
            return Ok(());
        };
        if compressor == "unknown" {
            return Ok(());
        }

        let rows = sqlx::query(
            r#"
            SELECT location FROM blob_locations
            WHERE transport = ? AND scope = ? AND digest = ?
            ORDER BY id DESC
            "#,
        )
        .bind(transport)
        .bind(scope)
        .bind(digest.to_string())
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            if out.len() >= REPLACEMENT_ATTEMPTS {
                break;
            }
            out.push(Candidate2 {
                digest: digest.clone(),
                location: row.get("location"),
                compressor: compressor.clone(),
            });
        }
        Ok(())
    }

    async fn other_digests_sharing(
        &self,
        digest: &Digest,
        uncompressed: &Digest,
    ) -> OcifreightCoreResult<Vec<Digest>> {
        let rows = sqlx::query(
            r#"
            SELECT compressed_digest FROM blob_uncompressed_pairs
            WHERE uncompressed_digest = ? AND compressed_digest != ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(uncompressed.to_string())
        .bind(digest.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| parse_digest(&row.get::<String, _>("compressed_digest")))
            .collect()
    }
}

fn parse_digest(s: &str) -> OcifreightCoreResult<Digest> {
    Digest::from_str(s).map_err(|e| OcifreightCoreError::custom(anyhow::anyhow!(e.to_string())))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
