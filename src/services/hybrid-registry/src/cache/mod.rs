//! Cache Module
//!
//! Two cache tiers sit in front of the durable store:
//! - [`LocalCache`]: in-process, bounded, least-recently-used, short TTL
//! - [`DistributedCache`]: shared across controller processes, longer TTL
//!
//! Neither tier is a source of truth. Values are serialized descriptors keyed by
//! [`service_key`].

mod local;
mod memory;
mod redis_cache;

pub use self::local::LocalCache;
pub use self::memory::InMemoryDistributedCache;
pub use self::redis_cache::RedisCache;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Distributed cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error() {
            CacheError::Connection(error.to_string())
        } else {
            CacheError::Command(error.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(error: deadpool_redis::PoolError) -> Self {
        CacheError::Connection(error.to_string())
    }
}

/// Shared cache used as the second lookup tier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Get a value, `None` on miss or expiry
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set a value with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete a key; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`, returning the number removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Count keys starting with `prefix`
    async fn count_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Backend name for logs and stats
    fn backend_name(&self) -> &'static str;
}

/// Key under which a service descriptor is cached
pub fn service_key(prefix: &str, service_name: &str) -> String {
    format!("{}service:{}", prefix, service_name)
}

/// Prefix covering every descriptor key
pub fn service_key_prefix(prefix: &str) -> String {
    format!("{}service:", prefix)
}
