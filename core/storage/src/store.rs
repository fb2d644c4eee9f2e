//! Durable store trait definition.

use async_trait::async_trait;
use std::time::Duration;

use medstock_common::{ChangeId, Result};

use crate::records::{
    CachedEntry, LoggedSync, NewPendingChange, PendingChange, PendingIndex, SyncLogEntry,
};

/// Crash-durable store behind the offline engine.
///
/// Holds three logical collections (pending changes, cached reads, sync log)
/// plus a small metadata table and named leases. Every completed write must
/// survive a restart for durable backends.
///
/// All operations may fail with [`medstock_common::Error::StoreUnavailable`];
/// callers treat a failure as "the operation did not happen".
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Append a pending change.
    ///
    /// # Postconditions
    /// - The returned change has an id and timestamp strictly greater than
    ///   every change added before it through this store.
    async fn add_pending(&self, change: NewPendingChange) -> Result<PendingChange>;

    /// Get a pending change by id.
    async fn get_pending(&self, id: ChangeId) -> Result<Option<PendingChange>>;

    /// Scan pending changes through an index, ascending by timestamp.
    async fn list_pending(&self, index: PendingIndex) -> Result<Vec<PendingChange>>;

    /// Delete a pending change. Deleting a missing id is not an error.
    async fn delete_pending(&self, id: ChangeId) -> Result<()>;

    /// Number of pending changes.
    async fn count_pending(&self) -> Result<u64>;

    /// Insert or replace a cached entry.
    async fn put_cached(&self, entry: CachedEntry) -> Result<()>;

    /// Get a cached entry by key.
    async fn get_cached(&self, key: &str) -> Result<Option<CachedEntry>>;

    /// All cached entries, ascending by `last_updated`.
    async fn list_cached(&self) -> Result<Vec<CachedEntry>>;

    /// Delete a cached entry. Deleting a missing key is not an error.
    async fn delete_cached(&self, key: &str) -> Result<()>;

    /// Number of cached entries.
    async fn count_cached(&self) -> Result<u64>;

    /// Append a sync log entry and return its id.
    async fn add_log(&self, entry: SyncLogEntry) -> Result<i64>;

    /// All sync log entries, ascending by timestamp.
    async fn list_log(&self) -> Result<Vec<LoggedSync>>;

    /// Number of sync log entries.
    async fn count_log(&self) -> Result<u64>;

    /// Read a metadata value.
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Write a metadata value.
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Try to take the named lease for `ttl`.
    ///
    /// Succeeds when the lease is free, expired, or already held by `holder`
    /// (which renews it).
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the named lease if `holder` owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Metadata key of the last completed drain, in epoch milliseconds.
pub const LAST_SYNC_TIME_KEY: &str = "last_sync_time";
