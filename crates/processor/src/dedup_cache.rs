//! Alert dedup cache (C10): an optimistic, cooldown-based early skip in
//! front of the authoritative MS transaction (`Store::try_create_alert`,
//! §4.3 step 4c). Never the source of truth for I-A1 — it only avoids
//! hammering the store with threshold evaluations it already knows are
//! within cooldown. Grounded in `other_examples`' `OrchestratorRateLimiter`
//! (a `HashMap<String, Instant>` cooldown map keyed by a composite string),
//! generalized with a capacity bound since this cache is keyed by
//! `device_id` and can grow unbounded with fleet size.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const ALERT_COOLDOWN_SECS: u64 = 300;
pub const CACHE_CAPACITY: usize = 1_000;

struct Inner {
    entries: HashMap<String, Instant>,
    /// Insertion order, used for bounded eviction. Approximate LRU (evicts
    /// oldest-inserted rather than least-recently-accessed) — adequate at
    /// this cache's scale (§3 DedupCacheEntry: "bounded capacity ≈ 1,000").
    order: VecDeque<String>,
}

pub struct DedupCache {
    inner: Mutex<Inner>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Builds the cache key for a threshold check: `"{device_id}:{parameter}"`.
    pub fn threshold_key(device_id: &str, parameter: &str) -> String {
        format!("{device_id}:{parameter}")
    }

    /// Builds the cache key for a trend check: `"{device_id}:{parameter}:trend"`.
    pub fn trend_key(device_id: &str, parameter: &str) -> String {
        format!("{device_id}:{parameter}:trend")
    }

    /// §4.3 step 4a: true if an entry exists for `key` younger than the
    /// cooldown window. Step 4e says an aborted-duplicate must NOT refresh
    /// the cache, so this never mutates state.
    pub async fn is_hot(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(key)
            .is_some_and(|t| t.elapsed() < Duration::from_secs(ALERT_COOLDOWN_SECS))
    }

    /// §4.3 step 4e: called only after a successful alert creation.
    pub async fn mark(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(key) {
            if inner.order.len() >= CACHE_CAPACITY {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                }
            }
            inner.order.push_back(key.to_string());
        }
        inner.entries.insert(key.to_string(), Instant::now());
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_key_is_not_hot() {
        let cache = DedupCache::new();
        assert!(!cache.is_hot("d1:ph").await);
    }

    #[tokio::test]
    async fn marked_key_is_hot_until_cooldown_elapses() {
        let cache = DedupCache::new();
        cache.mark("d1:ph").await;
        assert!(cache.is_hot("d1:ph").await);
    }

    #[tokio::test]
    async fn threshold_and_trend_keys_are_distinct() {
        let cache = DedupCache::new();
        cache.mark(&DedupCache::threshold_key("d1", "ph")).await;
        assert!(!cache.is_hot(&DedupCache::trend_key("d1", "ph")).await);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_entry() {
        let cache = DedupCache::new();
        for i in 0..CACHE_CAPACITY {
            cache.mark(&format!("d{i}:ph")).await;
        }
        assert!(cache.is_hot("d0:ph").await);
        cache.mark(&format!("d{CACHE_CAPACITY}:ph")).await;
        assert!(!cache.is_hot("d0:ph").await, "oldest entry should be evicted");
        assert!(cache.is_hot(&format!("d{CACHE_CAPACITY}:ph")).await);
    }
}
