//! Common utilities and types shared across MedStock modules.
//!
//! This module provides the foundational types used by the durable store,
//! the sync engine and the application layer, so every crate agrees on
//! identifiers, timestamps and error semantics.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{derive_change_type, now_millis, ChangeId, HttpMethod, KNOWN_RESOURCES};
