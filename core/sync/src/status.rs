//! Sync status tracking and publication to UI subscribers.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use medstock_common::{ChangeId, Result};
use medstock_storage::{PendingChange, StoreOpener, LAST_SYNC_TIME_KEY};

use crate::observers::{ObserverList, Subscription};
use crate::queue::ChangeQueue;

/// Snapshot of the engine state shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: u64,
    pub is_syncing: bool,
    /// Epoch milliseconds of the last completed drain.
    pub last_sync_time: Option<i64>,
}

/// Payload delivered to status subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: SyncStatus,
    /// Pending changes at the time of the last refresh, oldest first.
    pub changes: Vec<PendingChange>,
}

impl StatusEvent {
    /// Pending change count carried by this event.
    pub fn count(&self) -> u64 {
        self.status.pending_count
    }
}

#[derive(Default)]
struct Published {
    status: SyncStatus,
    changes: Vec<PendingChange>,
}

/// Derives the sync status and republishes it to any number of subscribers.
pub struct StatusPublisher {
    store: Arc<StoreOpener>,
    queue: Arc<ChangeQueue>,
    current: Mutex<Published>,
    /// Serializes store reads with their publication, so an older read never
    /// overwrites a newer one.
    refresh_lock: AsyncMutex<()>,
    subscribers: ObserverList<StatusEvent>,
}

impl StatusPublisher {
    /// Create a publisher. Nothing is read until the first refresh.
    pub fn new(store: Arc<StoreOpener>, queue: Arc<ChangeQueue>, is_online: bool) -> Self {
        Self {
            store,
            queue,
            current: Mutex::new(Published {
                status: SyncStatus {
                    is_online,
                    ..SyncStatus::default()
                },
                changes: Vec::new(),
            }),
            refresh_lock: AsyncMutex::new(()),
            subscribers: ObserverList::new(),
        }
    }

    /// Latest status.
    pub fn status(&self) -> SyncStatus {
        self.lock().status.clone()
    }

    /// Latest status together with the pending changes.
    pub fn snapshot(&self) -> StatusEvent {
        let current = self.lock();
        StatusEvent {
            status: current.status.clone(),
            changes: current.changes.clone(),
        }
    }

    /// Attach a subscriber; it receives every later publication.
    pub fn subscribe(&self, callback: impl Fn(&StatusEvent) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(callback)
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Recompute the pending count and last sync time, then publish.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the store cannot be read; nothing is published
    pub async fn refresh(&self) -> Result<SyncStatus> {
        let _serialized = self.refresh_lock.lock().await;

        let changes = self.queue.list().await?;
        let last_sync_time = self
            .store
            .get()
            .await?
            .get_meta(LAST_SYNC_TIME_KEY)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok());

        let event = {
            let mut current = self.lock();
            current.status.pending_count = changes.len() as u64;
            if last_sync_time.is_some() {
                current.status.last_sync_time = last_sync_time;
            }
            current.changes = changes;
            StatusEvent {
                status: current.status.clone(),
                changes: current.changes.clone(),
            }
        };

        debug!("Pending changes: {}", event.count());
        self.subscribers.notify(&event);
        Ok(event.status)
    }

    /// Publish the removal of one change without re-listing the queue.
    ///
    /// Only the count is read back from the store; the published list drops
    /// `id`. A full [`StatusPublisher::refresh`] still follows each drain.
    pub async fn change_removed(&self, id: ChangeId) -> Result<SyncStatus> {
        let _serialized = self.refresh_lock.lock().await;

        let pending_count = self.queue.count().await?;

        let event = {
            let mut current = self.lock();
            current.status.pending_count = pending_count;
            current.changes.retain(|change| change.id != id);
            StatusEvent {
                status: current.status.clone(),
                changes: current.changes.clone(),
            }
        };

        debug!("Change {} removed, {} pending", id, pending_count);
        self.subscribers.notify(&event);
        Ok(event.status)
    }

    /// Refresh, logging instead of failing.
    pub async fn refresh_or_warn(&self) {
        if let Err(e) = self.refresh().await {
            warn!("Failed to refresh sync status: {}", e);
        }
    }

    /// Record a connectivity transition and publish.
    pub fn set_online(&self, online: bool) {
        self.update(|status| status.is_online = online);
    }

    /// Record the start or end of a drain and publish.
    pub fn set_syncing(&self, syncing: bool) {
        self.update(|status| status.is_syncing = syncing);
    }

    /// Record a completed drain and publish.
    pub fn set_last_sync_time(&self, timestamp: i64) {
        self.update(|status| status.last_sync_time = Some(timestamp));
    }

    fn update(&self, apply: impl FnOnce(&mut SyncStatus)) {
        let event = {
            let mut current = self.lock();
            let before = current.status.clone();
            apply(&mut current.status);
            if current.status == before {
                return;
            }
            StatusEvent {
                status: current.status.clone(),
                changes: current.changes.clone(),
            }
        };
        self.subscribers.notify(&event);
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
