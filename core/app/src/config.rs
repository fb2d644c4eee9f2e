//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use medstock_common::{Error, Result};
use medstock_storage::StoreLocation;
use medstock_sync::{LeaseConfig, WakeupMode};

/// Database path that selects the non-durable memory store.
pub const MEMORY_DATABASE: &str = ":memory:";

/// Database file name inside the data directory.
const DATABASE_FILENAME: &str = "offline.db";

/// How captured credentials are treated at replay time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayAuthMode {
    /// Replay headers exactly as captured.
    #[default]
    Captured,
    /// Replace `Authorization` with the current token, when there is one.
    Refresh,
}

/// Offline engine configuration.
///
/// Every field has a default, so a partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file, or `:memory:`.
    pub database_path: PathBuf,
    /// Base URL for relative request URLs.
    pub api_base_url: Option<String>,
    /// User agent sent with replayed requests.
    pub user_agent: String,
    /// Per-request timeout. No timeout when unset.
    pub request_timeout_secs: Option<u64>,
    /// Drain automatically when connectivity comes back.
    pub auto_sync_on_reconnect: bool,
    /// Periodic wakeup interval. Wakeups are manual when unset.
    pub wakeup_interval_secs: Option<u64>,
    /// Store lease TTL for multi-instance deployments.
    pub lease_ttl_secs: Option<u64>,
    pub replay_auth: ReplayAuthMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            api_base_url: None,
            user_agent: format!("medstock/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: None,
            auto_sync_on_reconnect: true,
            wakeup_interval_secs: None,
            lease_ttl_secs: None,
            replay_auth: ReplayAuthMode::Captured,
        }
    }
}

impl EngineConfig {
    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid configuration: {e}")))
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Config` if it is malformed or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path must not be empty".to_string()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(Error::Config("user_agent must not be empty".to_string()));
        }
        if let Some(base) = &self.api_base_url {
            let url = Url::parse(base)
                .map_err(|e| Error::Config(format!("invalid api_base_url {base}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "api_base_url must be http or https, got {}",
                    url.scheme()
                )));
            }
        }
        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("wakeup_interval_secs", self.wakeup_interval_secs),
            ("lease_ttl_secs", self.lease_ttl_secs),
        ] {
            if value == Some(0) {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Where the durable store lives.
    pub fn store_location(&self) -> StoreLocation {
        if self.database_path == Path::new(MEMORY_DATABASE) {
            StoreLocation::Memory
        } else {
            StoreLocation::File(self.database_path.clone())
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn wakeup_mode(&self) -> WakeupMode {
        match self.wakeup_interval_secs {
            Some(secs) => WakeupMode::Periodic {
                interval: Duration::from_secs(secs),
            },
            None => WakeupMode::Manual,
        }
    }

    /// Lease settings, with a fresh holder id per call.
    pub fn lease(&self) -> Option<LeaseConfig> {
        self.lease_ttl_secs
            .map(|secs| LeaseConfig::new(Duration::from_secs(secs)))
    }
}

/// `<data dir>/medstock/offline.db`, or a file in the working directory when
/// the platform has no data directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("medstock").join(DATABASE_FILENAME))
        .unwrap_or_else(|| PathBuf::from(DATABASE_FILENAME))
}

/// `<config dir>/medstock/config.json`, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("medstock").join("config.json"))
}
