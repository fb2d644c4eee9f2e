//! MedStock offline engine
//!
//! Composition root wiring the durable store, connectivity monitor, change
//! queue, sync coordinator, read cache and status publisher into a single
//! [`OfflineEngine`] owned by the host application.

pub mod config;
pub mod engine;

pub use config::{
    default_config_path, default_database_path, EngineConfig, ReplayAuthMode, MEMORY_DATABASE,
};
pub use engine::OfflineEngine;

// Types callers need to talk to the engine
pub use medstock_common::{ChangeId, Error, HttpMethod, Result};
pub use medstock_storage::{LogStatus, LoggedSync, PendingChange};
pub use medstock_sync::{
    Connectivity, CredentialSource, HttpRemote, RemoteApi, RemoteResponse, ReplayRequest,
    StatusEvent, Subscription, SyncReport, SyncStatus, TransportError,
};
