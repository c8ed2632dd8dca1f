//! In-memory storage backed by a mini-moka cache.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mini_moka::sync::Cache;

use super::CacheStore;
use crate::{clock::Clock, error::StorageError};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: u64,
}

/// In-memory storage. Entries expire according to the injected clock.
pub struct InMemoryStore {
    entries: Cache<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder().max_capacity(100_000).build();

        Self { entries, clock }
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();

        let Some(entry) = self.entries.get(&key) else {
            return Ok(None);
        };

        if entry.expires_at <= self.clock.now_millis() {
            self.entries.invalidate(&key);
            return Ok(None);
        }

        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl);

        self.entries.insert(key.to_string(), Entry { value, expires_at });

        Ok(())
    }
}
