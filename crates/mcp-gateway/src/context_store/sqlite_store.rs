use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::schema::{now_epoch_seconds, SCHEMA_SQL};
use super::ContextStore;
use crate::error::{GatewayError, GatewayResult};
use crate::memory::{Message, Transcript};

type SqlitePool = Pool<SqliteConnectionManager>;

/// Embedded relational store: one `contexts` row per session, JSON transcript,
/// epoch-seconds `timestamp` of last access.
pub struct SqliteContextStore {
    pool: Arc<SqlitePool>,
    ttl_seconds: i64,
}

impl SqliteContextStore {
    pub fn open(db_path: &Path, ttl: Duration) -> GatewayResult<Self> {
        info!("Opening context database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(GatewayError::storage)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder().max_size(8).build(manager)?;
        Self::with_pool(pool, ttl)
    }

    /// Private database living as long as the store. A single pooled
    /// connection, since every `:memory:` connection is its own database.
    pub fn open_in_memory(ttl: Duration) -> GatewayResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::with_pool(pool, ttl)
    }

    fn with_pool(pool: SqlitePool, ttl: Duration) -> GatewayResult<Self> {
        pool.get()?.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            pool: Arc::new(pool),
            ttl_seconds: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        })
    }

    /// Runs blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut Connection) -> GatewayResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(GatewayError::storage)?
    }
}

fn delete_expired(conn: &Connection, ttl_seconds: i64) -> rusqlite::Result<usize> {
    let cutoff = now_epoch_seconds().saturating_sub(ttl_seconds);
    conn.execute("DELETE FROM contexts WHERE timestamp < ?1", params![cutoff])
}

fn decode(session_id: &str, raw: &str) -> GatewayResult<Transcript> {
    serde_json::from_str(raw).map_err(|e| {
        GatewayError::storage(format!("corrupt context for session {}: {}", session_id, e))
    })
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, session_id: &str) -> GatewayResult<Option<Transcript>> {
        let ttl_seconds = self.ttl_seconds;
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            delete_expired(&tx, ttl_seconds)?;

            let raw: Option<String> = tx
                .query_row(
                    "SELECT context FROM contexts WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if raw.is_some() {
                tx.execute(
                    "UPDATE contexts SET timestamp = ?1 WHERE session_id = ?2",
                    params![now_epoch_seconds(), session_id],
                )?;
            }
            tx.commit()?;

            raw.map(|raw| decode(&session_id, &raw)).transpose()
        })
        .await
    }

    async fn put(&self, session_id: &str, transcript: &[Message]) -> GatewayResult<()> {
        let encoded = serde_json::to_string(transcript).map_err(GatewayError::storage)?;
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO contexts (session_id, context, timestamp) VALUES (?1, ?2, ?3)",
                params![session_id, encoded, now_epoch_seconds()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> GatewayResult<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM contexts WHERE session_id = ?1", params![session_id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn sweep_expired(&self) -> GatewayResult<usize> {
        let ttl_seconds = self.ttl_seconds;
        let removed = self
            .with_conn(move |conn| Ok(delete_expired(conn, ttl_seconds)?))
            .await?;
        if removed > 0 {
            debug!("Swept {} expired sqlite session(s)", removed);
        }
        Ok(removed)
    }
}
