//! Retrieval plan cache
//!
//! Plans are keyed by `(namespace, hash(user_input), memory-count bucket)`
//! and expire after a TTL. A cache hit bypasses the planner's model call
//! entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::RetrievalPlan;

/// Default plan TTL
pub const DEFAULT_PLAN_TTL: Duration = Duration::from_secs(300);

/// Bound on cached plans before eviction
const MAX_ENTRIES: usize = 1_000;

struct CachedPlan {
    plan: RetrievalPlan,
    created_at: Instant,
}

/// TTL cache for retrieval plans.
pub struct PlanCache {
    entries: DashMap<String, CachedPlan>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build the cache key for one planning request.
    pub fn key(namespace: &str, user_input: &str, memory_count: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_input.as_bytes());
        let digest = hasher.finalize();
        format!(
            "{}:{:x}:{}",
            namespace,
            digest,
            count_bucket(memory_count)
        )
    }

    pub fn get(&self, key: &str) -> Option<RetrievalPlan> {
        if let Some(entry) = self.entries.get(key) {
            if entry.created_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.plan.clone());
            }
        }
        // expired entries are dropped on the miss path
        self.entries
            .remove_if(key, |_, v| v.created_at.elapsed() > self.ttl);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: String, plan: RetrievalPlan) {
        if self.entries.len() >= MAX_ENTRIES {
            self.evict();
        }
        self.entries.insert(
            key,
            CachedPlan {
                plan,
                created_at: Instant::now(),
            },
        );
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop expired entries; if none were expired, drop the oldest.
    fn evict(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, v| v.created_at.elapsed() <= self.ttl);
        if self.entries.len() < before {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .max_by_key(|e| e.created_at.elapsed())
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// Bucket memory counts so plan reuse survives small writes: 0, 1-9,
/// 10-99, 100-999, ...
fn count_bucket(count: i64) -> u32 {
    let mut bucket = 0;
    let mut threshold = 1i64;
    while count >= threshold && bucket < 12 {
        bucket += 1;
        threshold = threshold.saturating_mul(10);
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(terms: &[&str]) -> RetrievalPlan {
        RetrievalPlan {
            search_terms: terms.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn keys_distinguish_namespace_and_bucket() {
        let a = PlanCache::key("ns1", "add tests", 5);
        let b = PlanCache::key("ns2", "add tests", 5);
        let c = PlanCache::key("ns1", "add tests", 500);
        assert_ne!(a, b);
        assert_ne!(a, c);
        // same bucket, same key
        assert_eq!(a, PlanCache::key("ns1", "add tests", 7));
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = PlanCache::new(Duration::from_secs(60));
        let key = PlanCache::key("default", "q", 0);

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), plan(&["q"]));
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = PlanCache::new(Duration::from_millis(0));
        let key = PlanCache::key("default", "q", 0);
        cache.put(key.clone(), plan(&["q"]));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn buckets_are_logarithmic() {
        assert_eq!(count_bucket(0), 0);
        assert_eq!(count_bucket(1), 1);
        assert_eq!(count_bucket(9), 1);
        assert_eq!(count_bucket(10), 2);
        assert_eq!(count_bucket(99), 2);
        assert_eq!(count_bucket(100), 3);
    }
}
