//! Common error types for MedStock.

use thiserror::Error;

/// Top-level error type for MedStock operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable store could not be opened or used.
    ///
    /// Callers treat this as "the operation did not happen".
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store statement failed.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sync machinery (scheduler, background task) failed.
    #[error("Sync error: {0}")]
    Sync(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether the failure means the store itself is unreachable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
