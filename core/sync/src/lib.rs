//! MedStock offline sync engine
//!
//! This crate keeps the inventory client usable without a network:
//! - Connectivity monitoring from host online/offline signals
//! - Durable outbox of mutations, replayed in enqueue order
//! - Sync coordinator with per-change outcome classification
//! - Read cache of server responses
//! - Status publication to UI subscribers
//! - Optional periodic wakeups

pub mod cache;
pub mod connectivity;
pub mod engine;
pub mod observers;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod status;

// Re-export main types
pub use cache::ReadCache;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{classify, LeaseConfig, SyncCoordinator, SyncReport, DRAIN_LEASE};
pub use observers::{ObserverList, Subscription};
pub use queue::ChangeQueue;
pub use remote::{
    CredentialSource, HttpRemote, RemoteApi, RemoteResponse, ReplayAuth, ReplayRequest,
    TransportError,
};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle, WakeupMode};
pub use status::{StatusEvent, StatusPublisher, SyncStatus};
