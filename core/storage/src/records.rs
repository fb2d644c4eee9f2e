//! Record types held by the durable store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use medstock_common::{derive_change_type, ChangeId, HttpMethod};

/// Header name to value mapping captured at enqueue time.
pub type Headers = BTreeMap<String, String>;

/// A mutation request about to be queued.
///
/// The store turns it into a [`PendingChange`] by assigning the id and the
/// ordering timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPendingChange {
    /// Target of the replayed request.
    pub url: String,
    /// Verb of the replayed request.
    pub method: HttpMethod,
    /// Headers exactly as captured.
    pub headers: Headers,
    /// Pre-serialized payload, never inspected.
    pub body: Option<String>,
    /// Display label, derived once here.
    pub change_type: String,
}

impl NewPendingChange {
    /// Capture a request and derive its display label.
    pub fn new(
        method: HttpMethod,
        url: impl Into<String>,
        headers: Headers,
        body: Option<String>,
    ) -> Self {
        let url = url.into();
        let change_type = derive_change_type(&method, &url);
        Self {
            url,
            method,
            headers,
            body,
            change_type,
        }
    }
}

/// A serialized, replayable mutation waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Store-assigned monotonic identifier.
    pub id: ChangeId,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
    /// Enqueue time in epoch milliseconds; the ordering key.
    pub timestamp: i64,
    /// `"<verb>_<resource>"`, for status display only.
    pub change_type: String,
    /// Persisted but never incremented.
    pub retry_count: u32,
}

impl PendingChange {
    /// Build the stored row from a new change.
    pub fn from_new(id: ChangeId, timestamp: i64, change: NewPendingChange) -> Self {
        Self {
            id,
            url: change.url,
            method: change.method,
            headers: change.headers,
            body: change.body,
            timestamp,
            change_type: change.change_type,
            retry_count: 0,
        }
    }
}

/// Index used when scanning pending changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PendingIndex {
    /// Every change, ascending by timestamp.
    #[default]
    ByTimestamp,
    /// Changes with the given label, ascending by timestamp.
    ByType(String),
}

/// A cached read, last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: String,
    pub data: serde_json::Value,
    /// Epoch milliseconds of the last write.
    pub last_updated: i64,
}

/// Outcome recorded for one replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    ClientError,
    ServerError,
    NetworkError,
}

impl LogStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
        }
    }

    /// Parse the stored string form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(Self::Success),
            "client_error" => Some(Self::ClientError),
            "server_error" => Some(Self::ServerError),
            "network_error" => Some(Self::NetworkError),
            _ => None,
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Append-only audit record of a replay attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub change_type: String,
    pub url: String,
    pub status: LogStatus,
    pub error: Option<String>,
    pub timestamp: i64,
}

/// A sync log entry together with its store id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedSync {
    pub id: i64,
    #[serde(flatten)]
    pub entry: SyncLogEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_change_derives_type() {
        let change = NewPendingChange::new(
            HttpMethod::Post,
            "/api/materials",
            Headers::new(),
            Some("{}".to_string()),
        );
        assert_eq!(change.change_type, "create_materials");
    }

    #[test]
    fn test_pending_from_new_starts_without_retries() {
        let change = NewPendingChange::new(HttpMethod::Delete, "/api/stock/1", Headers::new(), None);
        let pending = PendingChange::from_new(ChangeId::new(3), 1_000, change);
        assert_eq!(pending.id, ChangeId::new(3));
        assert_eq!(pending.retry_count, 0);
        assert_eq!(pending.change_type, "delete_stock");
    }

    #[test]
    fn test_log_status_strings() {
        for status in [
            LogStatus::Success,
            LogStatus::ClientError,
            LogStatus::ServerError,
            LogStatus::NetworkError,
        ] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LogStatus::parse("pending"), None);
        assert_eq!(
            serde_json::to_string(&LogStatus::NetworkError).unwrap(),
            "\"network_error\""
        );
    }
}
