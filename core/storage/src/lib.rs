//! Durable store abstraction for MedStock.
//!
//! This module provides a trait-based interface over the crash-durable
//! storage that backs the offline engine, with a SQLite backend for real
//! devices and a memory backend for tests.
//!
//! # Design Principles
//! - One store, three logical collections: pending changes, cached reads,
//!   sync log
//! - Async operations: blocking database work never runs on the caller's task
//! - Unified error semantics: an unusable store is always `StoreUnavailable`

pub mod memory;
pub mod opener;
pub mod records;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use opener::{StoreLocation, StoreOpener};
pub use records::{
    CachedEntry, Headers, LogStatus, LoggedSync, NewPendingChange, PendingChange, PendingIndex,
    SyncLogEntry,
};
pub use sqlite::SqliteStore;
pub use store::{DurableStore, LAST_SYNC_TIME_KEY};
