//! Per-project offline queue: when the daemon is unreachable the CLI
//! persists operations here, keyed by time-ordered idempotency tokens, and
//! drains them on the next successful connection. Delivery is at-least-once
//! in transport; the server's idempotency ledger makes it at-most-once in
//! effect.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::now_epoch;

pub const QUEUE_DIR: &str = ".subtrate";
pub const QUEUE_FILE: &str = "queue.db";

const DEFAULT_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Send,
    Publish,
    Heartbeat,
    StatusUpdate,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Send => "send",
            OpKind::Publish => "publish",
            OpKind::Heartbeat => "heartbeat",
            OpKind::StatusUpdate => "status_update",
        }
    }

    fn parse(s: &str) -> Option<OpKind> {
        match s {
            "send" => Some(OpKind::Send),
            "publish" => Some(OpKind::Publish),
            "heartbeat" => Some(OpKind::Heartbeat),
            "status_update" => Some(OpKind::StatusUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOp {
    /// Time-ordered idempotency key (UUIDv7), minted at enqueue time.
    pub id: String,
    pub kind: OpKind,
    pub payload: serde_json::Value,
    /// Resolved to an agent ID at delivery time, not enqueue time.
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Fresh idempotency key. UUIDv7 keeps the queue naturally time-ordered.
pub fn new_idempotency_key() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Walk up from `start` looking for a directory that already carries the
/// queue marker, falling back to the nearest git root.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    let mut git_root = None;
    while let Some(current) = dir {
        if current.join(QUEUE_DIR).is_dir() {
            return Some(current.to_path_buf());
        }
        if git_root.is_none() && current.join(".git").exists() {
            git_root = Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    git_root
}

pub fn queue_path(project_root: &Path) -> PathBuf {
    project_root.join(QUEUE_DIR).join(QUEUE_FILE)
}

pub struct OfflineQueue {
    conn: Mutex<Connection>,
}

impl OfflineQueue {
    pub fn open(path: &Path) -> Result<OfflineQueue, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StoreError::from_sqlite)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS pending_ops (
                 id TEXT PRIMARY KEY,
                 kind TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 agent_name TEXT NOT NULL,
                 session_id TEXT,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL,
                 state TEXT NOT NULL DEFAULT 'pending'
                     CHECK (state IN ('pending','failed','delivered')),
                 last_error TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_pending_state ON pending_ops(state, created_at);",
        )
        .map_err(StoreError::from_sqlite)?;
        Ok(OfflineQueue { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist an operation with a fresh key and the given TTL.
    pub fn enqueue(
        &self,
        kind: OpKind,
        payload: serde_json::Value,
        agent_name: &str,
        session_id: Option<&str>,
        ttl_secs: Option<i64>,
    ) -> Result<QueuedOp, StoreError> {
        let now = now_epoch();
        let op = QueuedOp {
            id: new_idempotency_key(),
            kind,
            payload,
            agent_name: agent_name.to_string(),
            session_id: session_id.map(String::from),
            created_at: now,
            expires_at: now + ttl_secs.unwrap_or(DEFAULT_TTL_SECS),
        };
        self.conn()
            .execute(
                "INSERT INTO pending_ops
                     (id, kind, payload, agent_name, session_id, created_at, expires_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
                params![
                    op.id,
                    op.kind.as_str(),
                    op.payload.to_string(),
                    op.agent_name,
                    op.session_id,
                    op.created_at,
                    op.expires_at,
                ],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(op)
    }

    /// All pending, unexpired operations in creation order. Previously
    /// failed ops come back too; failure leaves them pending for the next
    /// drain.
    pub fn drain(&self) -> Result<Vec<QueuedOp>, StoreError> {
        let now = now_epoch();
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, payload, agent_name, session_id, created_at, expires_at
                 FROM pending_ops
                 WHERE state IN ('pending','failed') AND expires_at > ?1
                 ORDER BY created_at ASC, id ASC",
            )
            .map_err(StoreError::from_sqlite)?;
        let ops = stmt
            .query_map(params![now], |row| {
                let kind: String = row.get(1)?;
                let payload: String = row.get(2)?;
                Ok(QueuedOp {
                    id: row.get(0)?,
                    kind: OpKind::parse(&kind).unwrap_or(OpKind::StatusUpdate),
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    agent_name: row.get(3)?,
                    session_id: row.get(4)?,
                    created_at: row.get(5)?,
                    expires_at: row.get(6)?,
                })
            })
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(ops)
    }

    pub fn mark_delivered(&self, id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE pending_ops SET state = 'delivered', last_error = NULL WHERE id = ?1",
                params![id],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE pending_ops SET state = 'failed', last_error = ?2 WHERE id = ?1",
                params![id, reason],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    /// Delete delivered ops and anything past its TTL.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_epoch();
        let removed = self
            .conn()
            .execute(
                "DELETE FROM pending_ops WHERE state = 'delivered' OR expires_at <= ?1",
                params![now],
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(removed)
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM pending_ops WHERE state IN ('pending','failed')",
                [],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(count)
    }

    pub fn op_state(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row("SELECT state FROM pending_ops WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(StoreError::from_sqlite)
    }
}
