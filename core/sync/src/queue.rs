//! Durable outbox of mutations waiting to be replayed.

use std::sync::Arc;
use tracing::{debug, info};

use medstock_common::{ChangeId, Result};
use medstock_storage::{NewPendingChange, PendingChange, PendingIndex, StoreOpener};

use crate::remote::ReplayRequest;

/// Append-only producer, ordered full-drain consumer.
///
/// Changes are listed in exactly the order they were enqueued and are never
/// reordered, merged or edited in place.
pub struct ChangeQueue {
    store: Arc<StoreOpener>,
}

impl ChangeQueue {
    /// Create a queue on top of the shared store.
    pub fn new(store: Arc<StoreOpener>) -> Self {
        Self { store }
    }

    /// Persist one mutation.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the store cannot be opened or written
    pub async fn enqueue(&self, request: ReplayRequest) -> Result<PendingChange> {
        let change = NewPendingChange::new(request.method, request.url, request.headers, request.body);
        let store = self.store.get().await?;
        let pending = store.add_pending(change).await?;
        info!(
            "Queued change {} ({} {})",
            pending.id, pending.method, pending.url
        );
        Ok(pending)
    }

    /// All pending changes, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingChange>> {
        self.store
            .get()
            .await?
            .list_pending(PendingIndex::ByTimestamp)
            .await
    }

    /// Pending changes with one display label, oldest first.
    pub async fn list_by_type(&self, change_type: &str) -> Result<Vec<PendingChange>> {
        self.store
            .get()
            .await?
            .list_pending(PendingIndex::ByType(change_type.to_string()))
            .await
    }

    /// Look up a single change.
    pub async fn get(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        self.store.get().await?.get_pending(id).await
    }

    /// Drop a change from the outbox.
    pub async fn remove(&self, id: ChangeId) -> Result<()> {
        self.store.get().await?.delete_pending(id).await?;
        debug!("Removed change {} from queue", id);
        Ok(())
    }

    /// Number of pending changes.
    pub async fn count(&self) -> Result<u64> {
        self.store.get().await?.count_pending().await
    }
}
