//! SQLite-backed shared store
//!
//! Every `cfa run` process for one data directory opens the same database
//! file, which makes it the cross-process analogue of the userscript
//! manager's value storage. SQLite has no change notification across
//! processes, so every write also appends to `kv_log`, and each store polls
//! that log for entries written by other stores.
//!
//! A store publishes its own writes as soon as they commit. The log keeps
//! every write, so a value that is set and removed again between two polls
//! still reaches other processes as two changes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use cfa_notify::{KeyValueStore, StoreChange, StoreError, StoreSupport};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CfaConfig;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Log entries older than this are pruned on write. A poller stalled for
/// longer misses them.
const LOG_RETENTION_MS: i64 = 60_000;

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

pub struct SqliteStore {
    pool: SqlitePool,
    /// Tags this store's log entries so its poller can skip them
    origin: String,
    changes: broadcast::Sender<StoreChange>,
    poller: JoinHandle<()>,
}

impl SqliteStore {
    pub async fn open(config: &CfaConfig, poll_interval: Duration) -> Result<Self> {
        info!("Connecting to store: {}", config.db_path.display());

        let options = SqliteConnectOptions::from_str(&config.db_url())?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Other instances hold the write lock briefly
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        run_migrations(&pool).await?;
        Self::from_pool(pool, poll_interval).await
    }

    /// Wraps an already migrated pool and starts the change poller. Changes
    /// made before this call are not reported.
    pub async fn from_pool(pool: SqlitePool, poll_interval: Duration) -> Result<Self> {
        let origin = Uuid::new_v4().simple().to_string();
        let last_seen = latest_seq(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let poller = tokio::spawn(poll_changes(
            pool.clone(),
            origin.clone(),
            changes.clone(),
            last_seen,
            poll_interval,
        ));
        Ok(Self {
            pool,
            origin,
            changes,
            poller,
        })
    }

    /// All live keys and values, for `cfa state`.
    pub async fn entries(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM kv ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Removes every remaining key, in key order. Goes through `remove` so
    /// running instances observe the removals.
    pub async fn clear(&self) -> Result<usize> {
        let keys: Vec<(String,)> = sqlx::query_as("SELECT key FROM kv ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        for (key,) in &keys {
            self.remove(key).await?;
        }
        Ok(keys.len())
    }

    /// Applies one write and logs it in the same transaction. `None` removes;
    /// removing an absent key is not a change and is not logged.
    async fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let affected = match value {
            Some(value) => sqlx::query(
                "INSERT INTO kv (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected(),
            None => sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?
                .rows_affected(),
        };
        if affected == 0 {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query("INSERT INTO kv_log (key, value, origin, written_at) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(&self.origin)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query("DELETE FROM kv_log WHERE written_at < ?")
            .bind(now - LOG_RETENTION_MS)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        // No subscribers is fine
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            new_value: value.map(str::to_string),
        });
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, Some(value)).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.write(key, None).await
    }

    fn support(&self) -> StoreSupport {
        StoreSupport::FULL
    }

    fn watch(&self) -> Option<broadcast::Receiver<StoreChange>> {
        Some(self.changes.subscribe())
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

async fn latest_seq(pool: &SqlitePool) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM kv_log")
        .fetch_one(pool)
        .await?;
    Ok(seq)
}

/// Republishes log entries newer than `last_seen` that other stores wrote,
/// one change per write, in write order.
async fn poll_changes(
    pool: SqlitePool,
    origin: String,
    changes: broadcast::Sender<StoreChange>,
    mut last_seen: i64,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let rows: Vec<(i64, String, Option<String>, String)> = match sqlx::query_as(
            "SELECT seq, key, value, origin FROM kv_log WHERE seq > ? ORDER BY seq",
        )
        .bind(last_seen)
        .fetch_all(&pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to poll store changes: {}", e);
                continue;
            }
        };

        for (seq, key, new_value, writer) in rows {
            last_seen = seq;
            if writer == origin {
                continue;
            }
            debug!(key = %key, removed = new_value.is_none(), "Store changed");
            let _ = changes.send(StoreChange { key, new_value });
        }
    }
}

// Migrations are inline, the binary ships without a migrations directory
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )",
    )
    .execute(pool)
    .await?;

    let found: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .context("Failed to read schema version")?;

    if found > SCHEMA_VERSION {
        anyhow::bail!(
            "Store schema {} is newer than this cfa understands ({}); upgrade cfa",
            found,
            SCHEMA_VERSION
        );
    }
    if found == SCHEMA_VERSION {
        debug!(version = found, "Store schema current");
        return Ok(());
    }

    if found < 1 {
        create_kv(pool).await?;
        record_version(pool, 1, "Versioned key/value table").await?;
    }
    if found < 2 {
        add_change_log(pool).await?;
        record_version(pool, 2, "Append-only change log").await?;
    }
    Ok(())
}

async fn create_kv(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT,
            version INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_version ON kv(version)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves change tracking out of `kv` into `kv_log`. Tombstones are dropped,
/// the log records removals instead.
async fn add_change_log(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in [
        "CREATE TABLE kv_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            value TEXT,
            origin TEXT NOT NULL,
            written_at INTEGER NOT NULL
        )",
        "CREATE INDEX idx_kv_log_written_at ON kv_log(written_at)",
        "CREATE TABLE kv_live (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        "INSERT INTO kv_live (key, value) SELECT key, value FROM kv WHERE value IS NOT NULL",
        "DROP TABLE kv",
        "ALTER TABLE kv_live RENAME TO kv",
    ] {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn record_version(pool: &SqlitePool, version: i64, description: &str) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO schema_version (version, description) VALUES (?, ?)")
        .bind(version)
        .bind(description)
        .execute(pool)
        .await?;
    info!(version, "{}", description);
    Ok(())
}
