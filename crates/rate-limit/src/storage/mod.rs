//! Key/value storage used by the limiter.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::StorageConfig;

use crate::{clock::Clock, error::StorageError};

pub mod memory;
pub mod redis;
mod redis_pool;

pub use memory::InMemoryStore;
pub use self::redis::RedisStore;

/// A string key/value store with per entry expiry.
///
/// Object safe so a custom backend can be injected into the manager builder.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Reads a value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError>;
}

/// Creates the backend selected in the configuration.
pub async fn from_config(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CacheStore>, StorageError> {
    match config {
        StorageConfig::Memory => {
            log::debug!("Using in-memory rate limit storage");
            Ok(Arc::new(InMemoryStore::new(clock)))
        }
        StorageConfig::Redis(redis_config) => {
            log::debug!("Using Redis rate limit storage at {}", redis_config.url);
            Ok(Arc::new(RedisStore::new(redis_config).await?))
        }
    }
}
