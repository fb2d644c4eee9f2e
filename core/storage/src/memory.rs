//! In-memory durable store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use medstock_common::{now_millis, ChangeId, Error, Result};

use crate::records::{
    CachedEntry, LoggedSync, NewPendingChange, PendingChange, PendingIndex, SyncLogEntry,
};
use crate::store::DurableStore;

#[derive(Default)]
struct State {
    pending: BTreeMap<ChangeId, PendingChange>,
    next_pending_id: i64,
    pending_clock: i64,
    cached: HashMap<String, CachedEntry>,
    log: Vec<LoggedSync>,
    meta: HashMap<String, String>,
    leases: HashMap<String, (String, i64)>,
}

/// In-memory durable store.
///
/// Same ordering and lease semantics as the SQLite store, but nothing
/// survives a drop. It can be switched into an unavailable state to
/// exercise the "store could not be opened" paths.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    pending_accesses: AtomicU64,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of operations that touched the pending-changes collection.
    pub fn pending_accesses(&self) -> u64 {
        self.pending_accesses.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store disabled".to_string()));
        }
        Ok(())
    }

    fn touch_pending(&self) {
        self.pending_accesses.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.check()?;
        self.state
            .read()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.check()?;
        self.state
            .write()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_pending(&self, change: NewPendingChange) -> Result<PendingChange> {
        self.touch_pending();
        let mut state = self.write()?;

        state.next_pending_id += 1;
        let id = ChangeId::new(state.next_pending_id);
        let timestamp = now_millis().max(state.pending_clock.saturating_add(1));
        state.pending_clock = timestamp;

        let pending = PendingChange::from_new(id, timestamp, change);
        state.pending.insert(id, pending.clone());
        Ok(pending)
    }

    async fn get_pending(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        self.touch_pending();
        Ok(self.read()?.pending.get(&id).cloned())
    }

    async fn list_pending(&self, index: PendingIndex) -> Result<Vec<PendingChange>> {
        self.touch_pending();
        let state = self.read()?;
        // Ids and timestamps grow together, so id order is timestamp order
        let changes = state.pending.values();
        Ok(match index {
            PendingIndex::ByTimestamp => changes.cloned().collect(),
            PendingIndex::ByType(change_type) => changes
                .filter(|c| c.change_type == change_type)
                .cloned()
                .collect(),
        })
    }

    async fn delete_pending(&self, id: ChangeId) -> Result<()> {
        self.touch_pending();
        self.write()?.pending.remove(&id);
        Ok(())
    }

    async fn count_pending(&self) -> Result<u64> {
        self.touch_pending();
        Ok(self.read()?.pending.len() as u64)
    }

    async fn put_cached(&self, entry: CachedEntry) -> Result<()> {
        self.write()?.cached.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn get_cached(&self, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self.read()?.cached.get(key).cloned())
    }

    async fn list_cached(&self) -> Result<Vec<CachedEntry>> {
        let mut entries: Vec<_> = self.read()?.cached.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.last_updated
                .cmp(&b.last_updated)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    async fn delete_cached(&self, key: &str) -> Result<()> {
        self.write()?.cached.remove(key);
        Ok(())
    }

    async fn count_cached(&self) -> Result<u64> {
        Ok(self.read()?.cached.len() as u64)
    }

    async fn add_log(&self, entry: SyncLogEntry) -> Result<i64> {
        let mut state = self.write()?;
        let id = state.log.len() as i64 + 1;
        state.log.push(LoggedSync { id, entry });
        Ok(id)
    }

    async fn list_log(&self) -> Result<Vec<LoggedSync>> {
        let mut log = self.read()?.log.clone();
        log.sort_by_key(|logged| (logged.entry.timestamp, logged.id));
        Ok(log)
    }

    async fn count_log(&self) -> Result<u64> {
        Ok(self.read()?.log.len() as u64)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.write()?.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.write()?;
        let now = now_millis();

        let acquired = match state.leases.get(name) {
            None => true,
            Some((current, expires_at)) => current == holder || *expires_at <= now,
        };
        if acquired {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            state.leases.insert(
                name.to_string(),
                (holder.to_string(), now.saturating_add(ttl_ms)),
            );
        }
        Ok(acquired)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.write()?;
        if state
            .leases
            .get(name)
            .is_some_and(|(current, _)| current == holder)
        {
            state.leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Headers, LogStatus};
    use medstock_common::HttpMethod;

    fn change(url: &str) -> NewPendingChange {
        NewPendingChange::new(HttpMethod::Post, url, Headers::new(), None)
    }

    #[tokio::test]
    async fn test_add_and_list_in_order() {
        let store = MemoryStore::new();
        let a = store.add_pending(change("/api/materials")).await.unwrap();
        let b = store.add_pending(change("/api/barcodes")).await.unwrap();

        assert!(a.timestamp < b.timestamp);
        let listed = store.list_pending(PendingIndex::ByTimestamp).await.unwrap();
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.add_pending(change("/api/materials")).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.count_pending().await.is_err());

        store.set_unavailable(false);
        assert_eq!(store.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_accesses_counted() {
        let store = MemoryStore::new();
        store.set_meta("k", "v").await.unwrap();
        assert_eq!(store.pending_accesses(), 0);

        store.count_pending().await.unwrap();
        assert_eq!(store.pending_accesses(), 1);
    }

    #[tokio::test]
    async fn test_log_and_leases() {
        let store = MemoryStore::new();
        store
            .add_log(SyncLogEntry {
                change_type: "create_materials".to_string(),
                url: "/api/materials".to_string(),
                status: LogStatus::Success,
                error: None,
                timestamp: 1,
            })
            .await
            .unwrap();
        assert_eq!(store.count_log().await.unwrap(), 1);

        let ttl = Duration::from_secs(30);
        assert!(store.try_acquire_lease("drain", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("drain", "b", ttl).await.unwrap());
        store.release_lease("drain", "a").await.unwrap();
        assert!(store.try_acquire_lease("drain", "b", ttl).await.unwrap());
    }
}
