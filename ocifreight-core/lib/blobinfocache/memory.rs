//! In-memory [`BlobInfoCache`], scoped to the lifetime of the owning process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use oci_spec::image::Digest;

use super::{Candidate, Candidate2, BlobInfoCache, Location, REPLACEMENT_ATTEMPTS};
use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A process-lifetime, in-memory blob-info cache. Cheap to construct; holds
/// no file handles and needs no cleanup, so it has no `Drop` impl beyond the
/// default one.
#[derive(Default)]
pub struct MemoryBlobInfoCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// compressed digest -> uncompressed digest.
    uncompressed: HashMap<Digest, Digest>,
    /// Insertion order of `uncompressed` keys, for deterministic "other
    /// digests sharing this uncompressed equivalent" iteration.
    uncompressed_order: Vec<Digest>,
    /// digest -> compressor name.
    compressors: HashMap<Digest, String>,
    /// (transport, scope, digest) -> locations, most-recent first.
    locations: HashMap<(String, String, Digest), VecDeque<Location>>,
}

impl Inner {
    fn uncompressed_equivalent(&self, digest: &Digest) -> Option<Digest> {
        if let Some(u) = self.uncompressed.get(digest) {
            return Some(u.clone());
        }
        // A digest that is itself the *target* of some other digest's pair
        // is, by definition, already uncompressed.
        if self.uncompressed.values().any(|v| v == digest) {
            return Some(digest.clone());
        }
        None
    }

    fn locations_for(&self, transport: &str, scope: &str, digest: &Digest) -> Vec<Location> {
        self.locations
            .get(&(transport.to_string(), scope.to_string(), digest.clone()))
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn other_digests_sharing(&self, digest: &Digest, uncompressed: &Digest) -> Vec<Digest> {
        self.uncompressed_order
            .iter()
            .filter(|d| *d != digest && self.uncompressed.get(*d) == Some(uncompressed))
            .cloned()
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobInfoCache for MemoryBlobInfoCache {
    async fn uncompressed_digest(&self, digest: &Digest) -> OcifreightCoreResult<Option<Digest>> {
        Ok(self.inner.lock().unwrap().uncompressed_equivalent(digest))
    }

    async fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> OcifreightCoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.uncompressed.get(compressed) {
            if existing != uncompressed {
                tracing::warn!(
                    %compressed, existing = %existing, new = %uncompressed,
                    "conflicting uncompressed-digest pair recorded; overwriting"
                );
            }
        } else {
            inner.uncompressed_order.push(compressed.clone());
        }
        inner
            .uncompressed
            .insert(compressed.clone(), uncompressed.clone());
        Ok(())
    }

    async fn record_digest_compressor_name(
        &self,
        digest: &Digest,
        name: &str,
    ) -> OcifreightCoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.compressors.get(digest) {
            Some(existing) if existing != name => {
                tracing::warn!(%digest, existing, new = name, "conflicting compressor name recorded; downgrading to unknown");
                inner.compressors.insert(digest.clone(), "unknown".to_string());
            }
            _ => {
                inner.compressors.insert(digest.clone(), name.to_string());
            }
        }
        Ok(())
    }

    async fn compressor_name(&self, digest: &Digest) -> OcifreightCoreResult<Option<String>> {
        Ok(self.inner.lock().unwrap().compressors.get(digest).cloned())
    }

    async fn record_known_location(
        &self,
        transport: &str,
        scope: &str,
        digest: &Digest,
        location: Location,
    ) -> OcifreightCoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (transport.to_string(), scope.to_string(), digest.clone());
        let entry = inner.locations.entry(key).or_default();
        entry.retain(|l| l != &location);
        entry.push_front(location);
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
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();

        let mut push_digest = |d: &Digest, out: &mut Vec<Candidate2>| {
            if out.len() >= REPLACEMENT_ATTEMPTS {
                return;
            }
            let Some(compressor) = inner.compressors.get(d).cloned() else {
                return;
            };
            if compressor == "unknown" {
                return;
            }
            for location in inner.locations_for(transport, scope, d) {
                if out.len() >= REPLACEMENT_ATTEMPTS {
                    break;
                }
                out.push(Candidate2 {
                    digest: d.clone(),
                    location,
                    compressor: compressor.clone(),
                });
            }
        };

        push_digest(digest, &mut out);

        if can_substitute {
            if let Some(uncompressed) = inner.uncompressed_equivalent(digest) {
                for other in inner.other_digests_sharing(digest, &uncompressed) {
                    if out.len() >= REPLACEMENT_ATTEMPTS {
                        break;
                    }
                    push_digest(&other, &mut out);
                }
                if uncompressed != *digest && out.len() < REPLACEMENT_ATTEMPTS {
                    push_digest(&uncompressed, &mut out);
                }
            }
        }

        Ok(out)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(hex_prefix: char) -> Digest {
        Digest::from_str(&format!("sha256:{}", hex_prefix.to_string().repeat(64))).unwrap()
    }

    #[tokio::test]
    async fn candidate_locations2_orders_self_then_siblings_then_uncompressed_capped() {
        let cache = MemoryBlobInfoCache::default();
        let (a, b, u, cu) = (d('a'), d('b'), d('c'), d('d'));

        for digest in [&a, &b, &u, &cu] {
            cache
                .record_digest_compressor_name(digest, "gzip")
                .await
                .unwrap();
        }
        cache.record_digest_uncompressed_pair(&a, &u).await.unwrap();
        cache.record_digest_uncompressed_pair(&b, &u).await.unwrap();
        cache.record_digest_uncompressed_pair(&u, &u).await.unwrap();

        // Record in the order the scenario specifies: U/2, A/2, B/2, CU/2, then U/1, A/1, B/1, CU/1.
        for (digest, loc) in [(&u, "U/2"), (&a, "A/2"), (&b, "B/2"), (&cu, "CU/2")] {
            cache
                .record_known_location("T", "S", digest, loc.to_string())
                .await
                .unwrap();
        }
        for (digest, loc) in [(&u, "U/1"), (&a, "A/1"), (&b, "B/1"), (&cu, "CU/1")] {
            cache
                .record_known_location("T", "S", digest, loc.to_string())
                .await
                .unwrap();
        }

        let candidates = cache.candidate_locations2("T", "S", &a, true).await.unwrap();
        let locations: Vec<_> = candidates.iter().map(|c| c.location.as_str()).collect();
        assert_eq!(locations, vec!["A/1", "A/2", "B/1", "B/2", "U/1"]);
    }

    #[tokio::test]
    async fn candidate_locations_without_substitution_only_returns_exact_digest() {
        let cache = MemoryBlobInfoCache::default();
        let (a, u) = (d('a'), d('c'));
        cache.record_digest_compressor_name(&a, "gzip").await.unwrap();
        cache.record_digest_compressor_name(&u, "uncompressed").await.unwrap();
        cache.record_digest_uncompressed_pair(&a, &u).await.unwrap();
        cache
            .record_known_location("T", "S", &u, "U/1".to_string())
            .await
            .unwrap();
        cache
            .record_known_location("T", "S", &a, "A/1".to_string())
            .await
            .unwrap();

        let candidates = cache.candidate_locations("T", "S", &a, false).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].location, "A/1");
    }

    #[tokio::test]
    async fn conflicting_compressor_name_downgrades_to_unknown() {
        let cache = MemoryBlobInfoCache::default();
        let a = d('a');
        cache.record_digest_compressor_name(&a, "gzip").await.unwrap();
        cache.record_digest_compressor_name(&a, "zstd").await.unwrap();
        assert_eq!(cache.compressor_name(&a).await.unwrap().as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn uncompressed_digest_reports_self_when_target_of_a_pair() {
        let cache = MemoryBlobInfoCache::default();
        let (a, u) = (d('a'), d('c'));
        cache.record_digest_uncompressed_pair(&a, &u).await.unwrap();
        assert_eq!(cache.uncompressed_digest(&u).await.unwrap(), Some(u));
    }
}
