//! Redis storage. Every key is namespaced with the configured prefix.

use std::time::Duration;

use async_trait::async_trait;
use config::RedisConfig;

use super::{
    CacheStore,
    redis_pool::{Pool, create_pool},
};
use crate::error::StorageError;

/// Redis-backed storage.
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisStore {
    /// Creates the pool and verifies the server answers a `PING`.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // PX rejects zero.
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }
}
