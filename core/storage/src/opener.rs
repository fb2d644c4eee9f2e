//! Lazily opened, shared store handle.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use medstock_common::Result;

use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::DurableStore;

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// SQLite database file.
    File(PathBuf),
    /// Non-durable memory store.
    Memory,
}

/// Opens the store once and hands out the same logical handle afterwards.
///
/// Concurrent callers of [`StoreOpener::get`] wait on a single open. A failed
/// open is not remembered, so the next call tries again.
pub struct StoreOpener {
    location: StoreLocation,
    cell: OnceCell<Arc<dyn DurableStore>>,
}

impl StoreOpener {
    /// Create an opener for `location`. Nothing is opened yet.
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already open store.
    pub fn from_store(store: Arc<dyn DurableStore>) -> Self {
        Self {
            location: StoreLocation::Memory,
            cell: OnceCell::new_with(Some(store)),
        }
    }

    /// Configured location.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Whether the store has been opened.
    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    /// Get the shared store, opening it on first use.
    ///
    /// # Errors
    /// - `StoreUnavailable` if opening fails
    pub async fn get(&self) -> Result<Arc<dyn DurableStore>> {
        let store = self
            .cell
            .get_or_try_init(|| async {
                debug!("Opening durable store at {:?}", self.location);
                let store: Arc<dyn DurableStore> = match &self.location {
                    StoreLocation::File(path) => Arc::new(SqliteStore::open(path).await?),
                    StoreLocation::Memory => Arc::new(MemoryStore::new()),
                };
                Ok::<_, medstock_common::Error>(store)
            })
            .await?;
        Ok(Arc::clone(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_handle_on_repeated_get() {
        let opener = StoreOpener::new(StoreLocation::Memory);
        assert!(!opener.is_open());

        let first = opener.get().await.unwrap();
        let second = opener.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(opener.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_get_opens_once() {
        let temp = TempDir::new().unwrap();
        let opener = Arc::new(StoreOpener::new(StoreLocation::File(
            temp.path().join("outbox.db"),
        )));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let opener = Arc::clone(&opener);
                tokio::spawn(async move { opener.get().await.unwrap() })
            })
            .collect();

        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap());
        }
        for store in &stores[1..] {
            assert!(Arc::ptr_eq(&stores[0], store));
        }
        assert_eq!(stores[0].name(), "sqlite");
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let temp = TempDir::new().unwrap();
        // A directory where the database file should be cannot be opened
        let blocked = temp.path().join("blocked");
        std::fs::create_dir_all(&blocked).unwrap();

        let opener = StoreOpener::new(StoreLocation::File(blocked.clone()));
        let err = opener.get().await.err().unwrap();
        assert!(err.is_store_unavailable());
        assert!(!opener.is_open());

        // Once the path is usable the next get opens it
        std::fs::remove_dir(&blocked).unwrap();
        let store = opener.get().await.unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(opener.is_open());
        assert!(blocked.is_file());
    }
}
