//! Key-value cache of server reads, available while offline.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use medstock_common::{now_millis, Error, Result};
use medstock_storage::{CachedEntry, StoreOpener};

/// Last-writer-wins cache. Entries never expire.
pub struct ReadCache {
    store: Arc<StoreOpener>,
}

impl ReadCache {
    /// Create a cache on top of the shared store.
    pub fn new(store: Arc<StoreOpener>) -> Self {
        Self { store }
    }

    /// Store `data` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the store cannot be opened or written
    pub async fn put(&self, key: &str, data: Value) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("cache key must not be empty".to_string()));
        }
        let entry = CachedEntry {
            key: key.to_string(),
            data,
            last_updated: now_millis(),
        };
        self.store.get().await?.put_cached(entry).await?;
        debug!("Cached {}", key);
        Ok(())
    }

    /// Value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.data))
    }

    /// Entry stored under `key`, including when it was written.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CachedEntry>> {
        self.store.get().await?.get_cached(key).await
    }

    /// Serialize and store a typed value.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_value(value)?).await
    }

    /// Read back a typed value.
    ///
    /// # Errors
    /// - `Serialization` if the cached shape no longer matches `T`
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Forget one key.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.get().await?.delete_cached(key).await
    }

    /// Every cached entry, oldest write first.
    pub async fn entries(&self) -> Result<Vec<CachedEntry>> {
        self.store.get().await?.list_cached().await
    }

    /// Forget every key. Returns how many entries were removed.
    pub async fn clear(&self) -> Result<usize> {
        let store = self.store.get().await?;
        let entries = store.list_cached().await?;
        for entry in &entries {
            store.delete_cached(&entry.key).await?;
        }
        debug!("Cleared {} cached entries", entries.len());
        Ok(entries.len())
    }
}
