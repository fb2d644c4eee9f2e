//! SQLite-backed durable store.
//!
//! Persists the outbox, the read cache and the sync log in a single SQLite
//! file so queued writes survive restarts and crashes.

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use medstock_common::{now_millis, ChangeId, Error, HttpMethod, Result};

use crate::records::{
    CachedEntry, Headers, LogStatus, LoggedSync, NewPendingChange, PendingChange, PendingIndex,
    SyncLogEntry,
};
use crate::store::DurableStore;

/// Current on-disk schema version, kept in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

/// Metadata key holding the last timestamp handed to a pending change.
const PENDING_CLOCK_KEY: &str = "pending_clock";

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS pending_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        headers TEXT NOT NULL,
        body TEXT,
        timestamp INTEGER NOT NULL,
        change_type TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_pending_timestamp ON pending_changes(timestamp);
    CREATE INDEX IF NOT EXISTS idx_pending_type ON pending_changes(change_type);

    CREATE TABLE IF NOT EXISTS cached_data (
        key TEXT PRIMARY KEY,
        data TEXT NOT NULL,
        last_updated INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cached_last_updated ON cached_data(last_updated);

    CREATE TABLE IF NOT EXISTS sync_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        change_type TEXT NOT NULL,
        url TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sync_log_timestamp ON sync_log(timestamp);

    CREATE TABLE IF NOT EXISTS sync_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_leases (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
"#;

const PENDING_COLUMNS: &str =
    "id, url, method, headers, body, timestamp, change_type, retry_count";

/// Durable store on top of a single SQLite database.
///
/// The connection lives behind a mutex and every operation runs on the
/// blocking thread pool, one transaction per operation.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    ///
    /// Creating the schema is idempotent: opening an existing database only
    /// adds whatever tables or indexes are missing.
    ///
    /// # Errors
    /// - `StoreUnavailable` if the file cannot be created, opened or migrated
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("store open task failed: {e}")))?
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::initialize(conn, ":memory:".to_string())
    }

    /// Where this store lives, for diagnostics.
    pub fn location(&self) -> &str {
        &self.location
    }

    fn open_blocking(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StoreUnavailable(format!(
                        "cannot create store directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(unavailable)?;
        Self::initialize(conn, path.display().to_string())
    }

    fn initialize(conn: Connection, location: String) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;

        // In-memory databases answer "memory" instead of switching to WAL
        if let Err(e) = conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
            row.get::<_, String>(0)
        }) {
            warn!("Could not enable WAL journal for {}: {}", location, e);
        }

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(unavailable)?;
        if version > SCHEMA_VERSION {
            return Err(Error::StoreUnavailable(format!(
                "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(unavailable)?;

        info!("Durable store opened at {}", location);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::StoreUnavailable("connection lock poisoned".to_string()))?;
            op(&mut conn).map_err(map_sqlite_error)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add_pending(&self, change: NewPendingChange) -> Result<PendingChange> {
        let headers = serde_json::to_string(&change.headers)?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let previous = tx
                .query_row(
                    "SELECT value FROM sync_metadata WHERE key = ?1",
                    [PENDING_CLOCK_KEY],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .and_then(|value| value.parse::<i64>().ok());
            let timestamp = match previous {
                Some(previous) => now_millis().max(previous.saturating_add(1)),
                None => now_millis(),
            };

            tx.execute(
                r#"
                INSERT INTO pending_changes
                (url, method, headers, body, timestamp, change_type, retry_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                "#,
                params![
                    change.url,
                    change.method.as_str(),
                    headers,
                    change.body,
                    timestamp,
                    change.change_type,
                ],
            )?;
            let id = ChangeId::new(tx.last_insert_rowid());

            tx.execute(
                "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?1, ?2)",
                params![PENDING_CLOCK_KEY, timestamp.to_string()],
            )?;
            tx.commit()?;

            debug!("Stored pending change {} ({})", id, change.change_type);
            Ok(PendingChange::from_new(id, timestamp, change))
        })
        .await
    }

    async fn get_pending(&self, id: ChangeId) -> Result<Option<PendingChange>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_changes WHERE id = ?1"),
                [id.get()],
                pending_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_pending(&self, index: PendingIndex) -> Result<Vec<PendingChange>> {
        self.with_conn(move |conn| {
            let rows = match index {
                PendingIndex::ByTimestamp => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PENDING_COLUMNS} FROM pending_changes ORDER BY timestamp ASC, id ASC"
                    ))?;
                    let rows = stmt.query_map([], pending_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                PendingIndex::ByType(change_type) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PENDING_COLUMNS} FROM pending_changes \
                         WHERE change_type = ?1 ORDER BY timestamp ASC, id ASC"
                    ))?;
                    let rows = stmt.query_map([change_type], pending_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(rows)
        })
        .await
    }

    async fn delete_pending(&self, id: ChangeId) -> Result<()> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM pending_changes WHERE id = ?1", [id.get()])?;
            debug!("Deleted pending change {} ({} rows)", id, removed);
            Ok(())
        })
        .await
    }

    async fn count_pending(&self) -> Result<u64> {
        self.with_conn(|conn| count(conn, "SELECT COUNT(*) FROM pending_changes"))
            .await
    }

    async fn put_cached(&self, entry: CachedEntry) -> Result<()> {
        let data = serde_json::to_string(&entry.data)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cached_data (key, data, last_updated) VALUES (?1, ?2, ?3)",
                params![entry.key, data, entry.last_updated],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_cached(&self, key: &str) -> Result<Option<CachedEntry>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key, data, last_updated FROM cached_data WHERE key = ?1",
                [key],
                cached_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_cached(&self) -> Result<Vec<CachedEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, data, last_updated FROM cached_data ORDER BY last_updated ASC, key ASC",
            )?;
            let rows = stmt.query_map([], cached_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn delete_cached(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cached_data WHERE key = ?1", [key])?;
            Ok(())
        })
        .await
    }

    async fn count_cached(&self) -> Result<u64> {
        self.with_conn(|conn| count(conn, "SELECT COUNT(*) FROM cached_data"))
            .await
    }

    async fn add_log(&self, entry: SyncLogEntry) -> Result<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO sync_log (change_type, url, status, error, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    entry.change_type,
                    entry.url,
                    entry.status.as_str(),
                    entry.error,
                    entry.timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_log(&self) -> Result<Vec<LoggedSync>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, change_type, url, status, error, timestamp
                FROM sync_log ORDER BY timestamp ASC, id ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                let raw_status: String = row.get(3)?;
                let status = LogStatus::parse(&raw_status).ok_or_else(|| {
                    conversion_error(
                        3,
                        Error::Serialization(format!("unknown log status: {raw_status}")),
                    )
                })?;
                Ok(LoggedSync {
                    id: row.get(0)?,
                    entry: SyncLogEntry {
                        change_type: row.get(1)?,
                        url: row.get(2)?,
                        status,
                        error: row.get(4)?,
                        timestamp: row.get(5)?,
                    },
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn count_log(&self) -> Result<u64> {
        self.with_conn(|conn| count(conn, "SELECT COUNT(*) FROM sync_log"))
            .await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let name = name.to_string();
        let holder = holder.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_millis();

            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT holder, expires_at FROM sync_leases WHERE name = ?1",
                    [&name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let acquired = match current {
                None => true,
                Some((current_holder, expires_at)) => {
                    current_holder == holder || expires_at <= now
                }
            };

            if acquired {
                tx.execute(
                    "INSERT OR REPLACE INTO sync_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)",
                    params![name, holder, now.saturating_add(ttl_ms)],
                )?;
            }
            tx.commit()?;
            Ok(acquired)
        })
        .await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let name = name.to_string();
        let holder = holder.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM sync_leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )?;
            Ok(())
        })
        .await
    }
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
    let method: String = row.get(2)?;
    let method = method
        .parse::<HttpMethod>()
        .map_err(|e| conversion_error(2, e))?;

    let headers: String = row.get(3)?;
    let headers: Headers =
        serde_json::from_str(&headers).map_err(|e| conversion_error(3, Error::from(e)))?;

    let retry_count: i64 = row.get(7)?;

    Ok(PendingChange {
        id: ChangeId::new(row.get(0)?),
        url: row.get(1)?,
        method,
        headers,
        body: row.get(4)?,
        timestamp: row.get(5)?,
        change_type: row.get(6)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    })
}

fn cached_from_row(row: &Row<'_>) -> rusqlite::Result<CachedEntry> {
    let data: String = row.get(1)?;
    let data = serde_json::from_str(&data).map_err(|e| conversion_error(1, Error::from(e)))?;
    Ok(CachedEntry {
        key: row.get(0)?,
        data,
        last_updated: row.get(2)?,
    })
}

fn count(conn: &Connection, sql: &str) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn conversion_error(column: usize, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn unavailable(err: rusqlite::Error) -> Error {
    Error::StoreUnavailable(err.to_string())
}

/// Storage-level failures mean the store is unusable; anything else is a
/// failed statement.
fn map_sqlite_error(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt => Error::StoreUnavailable(err.to_string()),
            _ => Error::Database(err.to_string()),
        },
        _ => Error::Database(err.to_string()),
    }
}
