// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Progress marker persistence.
//!
//! A progress marker records how far verification or replication has
//! advanced for one channel. Markers are addressed by path:
//!
//! ```text
//! /<purpose>/<channel>      e.g. /LastSingleVerified/flights
//! ```
//!
//! and hold a single [`ProgressValue`]: a minute bucket for the verifier,
//! a sequence number for the replicator.
//!
//! # Monotonic Updates
//!
//! [`ProgressStore::update_increase()`] never moves a marker backwards. The
//! SQLite implementation enforces this inside the upsert itself
//! (`WHERE excluded.ordinal > markers.ordinal`), so two leaders racing on the
//! same channel cannot regress it either.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff up to
//! `SQLITE_RETRY_MAX_ATTEMPTS` before surfacing the error.

use crate::config::ProgressConfig;
use crate::error::{HubError, Result};
use crate::model::MinutePath;
use crate::store::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Purpose of the verifier's marker.
pub const LAST_SINGLE_VERIFIED: &str = "LastSingleVerified";

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path under which a marker is stored.
pub fn marker_path(purpose: &str, channel: &str) -> String {
    format!("/{}/{}", purpose, channel)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProgressValue
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted cursor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressValue {
    Minute(MinutePath),
    Sequence(u64),
}

impl ProgressValue {
    /// Ordering value used for monotonic comparison.
    pub fn ordinal(&self) -> i64 {
        match self {
            ProgressValue::Minute(path) => path.ordinal(),
            ProgressValue::Sequence(seq) => i64::try_from(*seq).unwrap_or(i64::MAX),
        }
    }

    pub fn as_minute(&self) -> Option<MinutePath> {
        match self {
            ProgressValue::Minute(path) => Some(*path),
            ProgressValue::Sequence(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProgressValue::Minute(_) => "minute",
            ProgressValue::Sequence(_) => "sequence",
        }
    }

    fn encode(&self) -> String {
        match self {
            ProgressValue::Minute(path) => path.to_url(),
            ProgressValue::Sequence(seq) => seq.to_string(),
        }
    }

    fn decode(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "minute" => MinutePath::from_url(value).map(ProgressValue::Minute),
            "sequence" => value.parse().ok().map(ProgressValue::Sequence),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProgressStore trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted per-(channel, purpose) cursors.
pub trait ProgressStore: Send + Sync + 'static {
    /// Current value, or `default` if the marker has never been written.
    fn get(&self, channel: &str, purpose: &str, default: ProgressValue) -> BoxFuture<'_, ProgressValue>;

    /// Advance the marker to `value` if that is an increase.
    ///
    /// Returns `true` if the stored value changed.
    fn update_increase(&self, value: ProgressValue, channel: &str, purpose: &str) -> BoxFuture<'_, bool>;

    /// Remove a marker.
    fn delete(&self, channel: &str, purpose: &str) -> BoxFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::progress_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Marker storage backed by SQLite, with a write-through cache.
pub struct SqliteProgressStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, ProgressValue>>,
    path: String,
    wal_mode: bool,
}

impl SqliteProgressStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &ProgressConfig) -> Result<Self> {
        let in_memory = config.sqlite_path == ":memory:";
        info!(path = %config.sqlite_path, "Initializing progress store");

        let pool = if in_memory {
            // One connection, never recycled: each SQLite connection would
            // otherwise get its own private in-memory database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| HubError::Config(format!("Invalid SQLite path: {}", e)))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| HubError::Config(format!("Invalid SQLite path: {}", e)))?
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
            if config.wal_mode {
                options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            }
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markers (
                path TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, String)> = sqlx::query_as("SELECT path, kind, value FROM markers")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (path, kind, value) in rows {
            match ProgressValue::decode(&kind, &value) {
                Some(decoded) => {
                    debug!(path = %path, value = %decoded, "Loaded marker from disk");
                    cache.insert(path, decoded);
                }
                None => warn!(path = %path, kind = %kind, value = %value, "Ignoring undecodable marker"),
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored progress markers from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: config.sqlite_path.clone(),
            wal_mode: config.wal_mode && !in_memory,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All markers, keyed by path.
    pub async fn get_all(&self) -> HashMap<String, ProgressValue> {
        self.cache.read().await.clone()
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.wal_mode {
            let pool = &self.pool;
            let result = execute_with_retry("progress_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("Progress store closed");
    }
}

impl ProgressStore for SqliteProgressStore {
    fn get(&self, channel: &str, purpose: &str, default: ProgressValue) -> BoxFuture<'_, ProgressValue> {
        let path = marker_path(purpose, channel);
        Box::pin(async move { Ok(self.cache.read().await.get(&path).copied().unwrap_or(default)) })
    }

    fn update_increase(&self, value: ProgressValue, channel: &str, purpose: &str) -> BoxFuture<'_, bool> {
        let path = marker_path(purpose, channel);
        Box::pin(async move {
            let pool = &self.pool;
            let kind = value.kind();
            let encoded = value.encode();
            let ordinal = value.ordinal();
            let now = chrono::Utc::now().timestamp_millis();

            let result = execute_with_retry("progress_update", || async {
                sqlx::query(
                    r#"
                    INSERT INTO markers (path, kind, value, ordinal, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(path) DO UPDATE SET
                        kind = excluded.kind,
                        value = excluded.value,
                        ordinal = excluded.ordinal,
                        updated_at = excluded.updated_at
                    WHERE excluded.ordinal > markers.ordinal
                    "#,
                )
                .bind(&path)
                .bind(kind)
                .bind(&encoded)
                .bind(ordinal)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            let advanced = result.rows_affected() > 0;
            if advanced {
                // Racing updates can commit in one order and reach the cache in another.
                self.cache
                    .write()
                    .await
                    .entry(path.clone())
                    .and_modify(|cached| {
                        if value.ordinal() > cached.ordinal() {
                            *cached = value;
                        }
                    })
                    .or_insert(value);
                debug!(path = %path, value = %value, "Marker advanced");
            } else {
                debug!(path = %path, value = %value, "Marker not advanced (not an increase)");
            }
            Ok(advanced)
        })
    }

    fn delete(&self, channel: &str, purpose: &str) -> BoxFuture<'_, ()> {
        let path = marker_path(purpose, channel);
        Box::pin(async move {
            self.cache.write().await.remove(&path);
            let pool = &self.pool;
            execute_with_retry("progress_delete", || async {
                sqlx::query("DELETE FROM markers WHERE path = ?")
                    .bind(&path)
                    .execute(pool)
                    .await
            })
            .await?;
            info!(path = %path, "Deleted marker");
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local markers. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    markers: RwLock<HashMap<String, ProgressValue>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, channel: &str, purpose: &str, default: ProgressValue) -> BoxFuture<'_, ProgressValue> {
        let path = marker_path(purpose, channel);
        Box::pin(async move { Ok(self.markers.read().await.get(&path).copied().unwrap_or(default)) })
    }

    fn update_increase(&self, value: ProgressValue, channel: &str, purpose: &str) -> BoxFuture<'_, bool> {
        let path = marker_path(purpose, channel);
        Box::pin(async move {
            let mut markers = self.markers.write().await;
            match markers.get(&path) {
                Some(current) if current.ordinal() >= value.ordinal() => Ok(false),
                _ => {
                    markers.insert(path, value);
                    Ok(true)
                }
            }
        })
    }

    fn delete(&self, channel: &str, purpose: &str) -> BoxFuture<'_, ()> {
        let path = marker_path(purpose, channel);
        Box::pin(async move {
            self.markers.write().await.remove(&path);
            Ok(())
        })
    }
}
