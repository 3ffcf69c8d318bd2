//! Bounded in-process LRU cache with per-entry TTL

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// In-process cache tier.
///
/// Access is synchronous and never suspends. Expired entries are not returned by
/// [`LocalCache::get`] but stay in memory until evicted or invalidated so that
/// [`LocalCache::get_stale`] can serve a last-known-good copy.
pub struct LocalCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`, counting a hit or a miss
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        // Only fresh reads promote the entry
        let fresh = entries
            .peek(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false);

        let value = if fresh {
            entries.get(key).map(|entry| entry.value.clone())
        } else {
            None
        };

        match value {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Value for `key` even if expired, as long as it was inserted within `max_age`
    pub fn get_stale(&self, key: &str, max_age: Duration) -> Option<V> {
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| entry.inserted_at.elapsed() <= max_age)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        self.entries.lock().push(
            key.into(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Remove `key`, returning whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
