//! In-memory distributed cache
//!
//! Stands in for Redis when the registry runs as a single process, and lets tests
//! share one "distributed" tier between several registries or simulate an outage.

use super::{CacheError, DistributedCache};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub struct InMemoryDistributedCache {
    entries: DashMap<String, (String, Instant)>,
    unavailable: AtomicBool,
    operations: AtomicU64,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a connection error
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Operations attempted so far, including failed ones
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Raw read that bypasses availability and counters
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.1 > Instant::now())
            .map(|entry| entry.0.clone())
    }

    fn check(&self) -> Result<(), CacheError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Connection(
                "in-memory cache marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.check()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().1 > now)
            .count() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryDistributedCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = InMemoryDistributedCache::new();
        cache.set("k", "v", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let cache = InMemoryDistributedCache::new();
        cache.set_available(false);
        assert!(matches!(cache.get("k").await, Err(CacheError::Connection(_))));
        assert!(cache.set("k", "v", Duration::from_secs(1)).await.is_err());
        cache.set_available(true);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = InMemoryDistributedCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("registry:service:a", "1", ttl).await.unwrap();
        cache.set("registry:service:b", "2", ttl).await.unwrap();
        cache.set("other:c", "3", ttl).await.unwrap();

        assert_eq!(cache.count_prefix("registry:").await.unwrap(), 2);
        assert_eq!(cache.delete_prefix("registry:").await.unwrap(), 2);
        assert_eq!(cache.peek("other:c"), Some("3".to_string()));
    }
}
