//! TTL cache for per-source intelligence results.
//!
//! Entries are keyed by `(entity id, source name)` and carry their own expiry
//! instant. An expired entry behaves exactly like a missing one: the first
//! read that observes the expiry removes it, and it never counts towards
//! [`TtlCache::stats`].
//!
//! The map itself is a `moka` cache, so capacity is bounded and every map
//! operation is internally synchronized. No lock is held outside a single map
//! operation.

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity_id: String,
    pub source: String,
}

impl CacheKey {
    pub fn new(entity_id: &str, source: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: u64,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_rate: f64,
}

pub struct TtlCache<V> {
    entries: Cache<CacheKey, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the live value for the key, removing it if it has expired.
    pub async fn get(&self, entity_id: &str, source: &str) -> Option<V> {
        let now = Instant::now();
        let outcome = self
            .entries
            .entry(CacheKey::new(entity_id, source))
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if !entry.value().is_live(now) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match outcome {
            CompResult::Unchanged(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit: {}/{}", entity_id, source);
                Some(entry.into_value().value)
            }
            CompResult::Removed(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache entry expired: {}/{}", entity_id, source);
                None
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `value`, replacing any previous entry. `None` uses the default TTL.
    pub async fn set(&self, entity_id: &str, source: &str, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl),
        };
        self.entries
            .insert(CacheKey::new(entity_id, source), entry)
            .await;
    }

    /// Removes one source's entry, or every entry for the id when `source` is
    /// `None`. Returns how many live entries were removed.
    pub async fn invalidate(&self, entity_id: &str, source: Option<&str>) -> usize {
        let now = Instant::now();
        let keys: Vec<CacheKey> = match source {
            Some(source) => vec![CacheKey::new(entity_id, source)],
            None => self
                .entries
                .iter()
                .filter(|(key, _)| key.entity_id == entity_id)
                .map(|(key, _)| key.as_ref().clone())
                .collect(),
        };

        let mut removed = 0;
        for key in keys {
            if let Some(entry) = self.entries.remove(&key).await {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }

        tracing::debug!("Invalidated {} cache entries for {}", removed, entity_id);
        removed
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        tracing::info!("Cache cleared");
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            size: self.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TtlCache<String> {
        TtlCache::new(Duration::from_secs(60), 1_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_returns_value() {
        let cache = cache();
        cache
            .set("CVE-2024-0001", "nvd", "payload".to_string(), None)
            .await;

        assert_eq!(
            cache.get("CVE-2024-0001", "nvd").await,
            Some("payload".to_string())
        );
        assert_eq!(cache.get("CVE-2024-0001", "epss").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss_and_is_removed() {
        let cache = cache();
        cache
            .set("CVE-2024-0001", "nvd", "a".to_string(), Some(Duration::from_secs(5)))
            .await;
        cache.set("CVE-2024-0002", "nvd", "b".to_string(), None).await;
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.get("CVE-2024-0001", "nvd").await, None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("CVE-2024-0002", "nvd").await, Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes_expiry() {
        let cache = cache();
        cache
            .set("ioc", "threat_feed", "old".to_string(), Some(Duration::from_secs(5)))
            .await;
        tokio::time::advance(Duration::from_secs(4)).await;
        cache
            .set("ioc", "threat_feed", "new".to_string(), Some(Duration::from_secs(5)))
            .await;
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(cache.get("ioc", "threat_feed").await, Some("new".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_single_and_all_sources() {
        let cache = cache();
        for source in ["nvd", "epss", "kev"] {
            cache
                .set("CVE-2024-0001", source, source.to_string(), None)
                .await;
        }
        cache.set("CVE-2024-0002", "nvd", "x".to_string(), None).await;

        assert_eq!(cache.invalidate("CVE-2024-0001", Some("nvd")).await, 1);
        assert_eq!(cache.invalidate("CVE-2024-0001", Some("nvd")).await, 0);
        assert_eq!(cache.invalidate("CVE-2024-0001", None).await, 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_ignores_expired_entries() {
        let cache = cache();
        cache
            .set("CVE-2024-0001", "nvd", "a".to_string(), Some(Duration::from_secs(1)))
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.invalidate("CVE-2024-0001", Some("nvd")).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_clear() {
        let cache = cache();
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.set("a", "nvd", "1".to_string(), None).await;
        cache.get("a", "nvd").await;
        cache.get("a", "nvd").await;
        cache.get("b", "nvd").await;
        cache.get("c", "nvd").await;

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        cache.clear().await;
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(cache.get("a", "nvd").await, None);
    }
}
