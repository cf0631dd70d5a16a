use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Thread-safe TTL cache with a size limit. Expired entries are dropped on
/// read and evicted in bulk when an insert finds the cache at capacity.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    max_size: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(max_size.min(4096)),
            max_size,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = match self.entries.get(key) {
            Some(e) => e,
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hit_count.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        if self.entries.len() >= self.max_size {
            self.evict_expired();
        }
        // Still full after eviction: skip the insert rather than grow.
        if self.entries.len() >= self.max_size {
            return;
        }

        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hit_count.load(Ordering::Relaxed),
            self.miss_count.load(Ordering::Relaxed),
        )
    }

    fn evict_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}
