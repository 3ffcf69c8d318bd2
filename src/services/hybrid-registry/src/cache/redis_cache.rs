//! Redis-backed distributed cache

use super::{CacheError, DistributedCache};
use crate::config::RedisConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Distributed cache on a deadpool-managed Redis connection pool
#[derive(Clone)]
pub struct RedisCache {
    pool: deadpool_redis::Pool,
}

impl RedisCache {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    /// Create the pool and verify the server answers PING
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(deadpool_redis::PoolConfig::new(config.max_connections));

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::Connection(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool.get().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;

        debug!("Connected to Redis at {}", config.url);
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, CacheError> {
        Ok(self.pool.get().await?)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let keys = self.scan_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let deleted: u64 = redis::cmd("DEL").arg(chunk).query_async(&mut *conn).await?;
            removed += deleted;
        }

        Ok(removed)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        Ok(self.scan_prefix(prefix).await?.len() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
