//! Embedded SQLite persistence: single writer connection, WAL durability,
//! retry-on-conflict transaction executor, full-text search queries.

pub mod migrations;

use rusqlite::{Connection, OpenFlags, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StoreError;
use crate::models::SearchHit;

/// Defaults for the retrying transaction executor.
const RETRY_INITIAL: Duration = Duration::from_millis(40);
const RETRY_CAP: Duration = Duration::from_secs(3);
const RETRY_ATTEMPTS: u32 = 10;

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at `path`, apply pragmas, run migrations.
    pub fn open(path: &Path, skip_backup: bool) -> Result<Store, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(StoreError::from_sqlite)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;
             PRAGMA mmap_size=268435456;",
        )
        .map_err(StoreError::from_sqlite)?;

        migrations::run(&conn, path, skip_backup)?;

        Ok(Store {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The writer connection. Poisoning is recovered; SQLite state is
    /// consistent regardless of a panicking holder.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside an immediate transaction: commit on Ok, roll back on
    /// Err. Errors from `f` pass through unchanged.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(StoreError::from_sqlite)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(StoreError::from_sqlite)?;
                Ok(value)
            }
            Err(err) => {
                // Rollback failure is secondary to the original error.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

/// Retries transactions on serialization and deadlock errors with jittered
/// exponential backoff. All other errors surface immediately.
#[derive(Debug, Clone)]
pub struct TxExecutor {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub num_retries: u32,
}

impl Default for TxExecutor {
    fn default() -> Self {
        TxExecutor {
            initial_delay: RETRY_INITIAL,
            max_delay: RETRY_CAP,
            num_retries: RETRY_ATTEMPTS,
        }
    }
}

impl TxExecutor {
    pub fn execute<T>(
        &self,
        store: &Store,
        mut f: impl FnMut(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=self.num_retries {
            match store.with_tx(&mut f) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err,
                        "retrying transaction");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::RetriesExceeded { attempts: self.num_retries })
    }

    /// Backoff for the given 1-based attempt: doubling from the initial
    /// delay, capped, with +/-50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self
            .initial_delay
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(self.max_delay)
    }
}

// --- Full-text search ---

impl Store {
    /// Global search over (subject, body), ordered by FTS rank.
    /// The query string passes through to FTS5 as a black box.
    pub fn search_global(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>, StoreError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.topic_id, m.sender_id, a.name, m.subject, m.body, m.created_at
                 FROM messages_fts f
                 JOIN messages m ON m.id = f.rowid
                 JOIN agents a ON a.id = m.sender_id
                 WHERE messages_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(StoreError::from_sqlite)?;
        let hits = stmt
            .query_map(params![query, limit], search_hit_row)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(hits)
    }

    /// Agent-scoped search: only messages with a recipient row for `agent_id`.
    pub fn search_for_agent(
        &self,
        agent_id: i64,
        query: &str,
        limit: i64,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.topic_id, m.sender_id, a.name, m.subject, m.body, m.created_at
                 FROM messages_fts f
                 JOIN messages m ON m.id = f.rowid
                 JOIN message_recipients r ON r.message_id = m.id
                 JOIN agents a ON a.id = m.sender_id
                 WHERE messages_fts MATCH ?1 AND r.agent_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
            )
            .map_err(StoreError::from_sqlite)?;
        let hits = stmt
            .query_map(params![query, agent_id, limit], search_hit_row)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(hits)
    }
}

fn search_hit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchHit> {
    Ok(SearchHit {
        message_id: row.get(0)?,
        topic_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        created_at: row.get(6)?,
    })
}
