//! Numbered schema migrations, embedded in the binary.
//!
//! The `schema_migrations` table records every applied version with a dirty
//! flag. Startup refuses to proceed when the stored version is newer than
//! this binary knows (downgrade) or when a previous migration left the flag
//! dirty. A `<dbpath>.<nanos>.backup` copy is written before any forward
//! migration unless suppressed.

use rusqlite::Connection;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;
use crate::models::now_epoch;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core schema",
        up: "
            CREATE TABLE agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                project_key TEXT,
                git_branch TEXT,
                created_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL
            );

            CREATE TABLE topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                topic_type TEXT NOT NULL
                    CHECK (topic_type IN ('direct','broadcast','queue','inbox')),
                retention_secs INTEGER,
                next_offset INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                topic_id INTEGER NOT NULL REFERENCES topics(id),
                log_offset INTEGER NOT NULL,
                sender_id INTEGER NOT NULL REFERENCES agents(id),
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                priority TEXT NOT NULL CHECK (priority IN ('urgent','normal','low')),
                deadline INTEGER,
                attachments BLOB,
                created_at INTEGER NOT NULL,
                UNIQUE (topic_id, log_offset)
            );
            CREATE INDEX idx_messages_thread ON messages(thread_id, log_offset);
            CREATE INDEX idx_messages_sender ON messages(sender_id);

            CREATE TABLE message_recipients (
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                state TEXT NOT NULL DEFAULT 'unread'
                    CHECK (state IN ('unread','read','starred','snoozed','archived','trash')),
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                snoozed_until INTEGER,
                read_at INTEGER,
                acknowledged_at INTEGER,
                PRIMARY KEY (message_id, agent_id)
            );
            CREATE INDEX idx_recipients_agent_state ON message_recipients(agent_id, state);

            CREATE TABLE subscriptions (
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (agent_id, topic_id)
            );
            CREATE INDEX idx_subscriptions_topic ON subscriptions(topic_id);

            CREATE TABLE consumer_offsets (
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
                last_offset INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (agent_id, topic_id)
            );

            CREATE TABLE sessions (
                session_id TEXT PRIMARY KEY,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL
            );

            CREATE TABLE project_defaults (
                project_key TEXT PRIMARY KEY,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        name: "full-text index",
        up: "
            CREATE VIRTUAL TABLE messages_fts USING fts5(
                subject,
                body,
                content='messages',
                content_rowid='id',
                tokenize='porter unicode61'
            );

            CREATE TRIGGER messages_fts_insert AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, subject, body)
                VALUES (new.id, new.subject, new.body);
            END;

            CREATE TRIGGER messages_fts_delete AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, subject, body)
                VALUES ('delete', old.id, old.subject, old.body);
            END;
        ",
    },
    Migration {
        version: 3,
        name: "idempotency ledger",
        up: "
            CREATE TABLE idempotency (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                message_id INTEGER,
                thread_id TEXT,
                recipients_count INTEGER,
                observed_at INTEGER NOT NULL
            );
            CREATE INDEX idx_idempotency_observed ON idempotency(observed_at);
        ",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply all pending migrations. Called once at store open, before any
/// other statement runs.
pub fn run(conn: &Connection, db_path: &Path, skip_backup: bool) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            dirty INTEGER NOT NULL DEFAULT 0,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(StoreError::from_sqlite)?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
        .map_err(StoreError::from_sqlite)?;

    let latest = latest_version();
    if current > latest {
        return Err(StoreError::DowngradeDetected { found: current, supported: latest });
    }

    let dirty: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema_migrations WHERE dirty = 1 ORDER BY version LIMIT 1",
            [],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::from_sqlite(other)),
        })?;
    if let Some(version) = dirty {
        return Err(StoreError::DirtyMigration(version));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(());
    }

    if !skip_backup && db_path.exists() && current > 0 {
        let backup = backup_path(db_path);
        std::fs::copy(db_path, &backup)?;
        tracing::info!(backup = %backup.display(), "wrote pre-migration backup");
    }

    for migration in pending {
        tracing::info!(version = migration.version, name = migration.name, "applying migration");
        // The dirty mark commits before the migration body so a crash
        // mid-migration is visible on the next start.
        conn.execute(
            "INSERT INTO schema_migrations (version, dirty, applied_at) VALUES (?1, 1, ?2)",
            rusqlite::params![migration.version, now_epoch()],
        )
        .map_err(StoreError::from_sqlite)?;

        conn.execute_batch(migration.up).map_err(StoreError::from_sqlite)?;

        conn.execute(
            "UPDATE schema_migrations SET dirty = 0 WHERE version = ?1",
            rusqlite::params![migration.version],
        )
        .map_err(StoreError::from_sqlite)?;
    }

    Ok(())
}

fn backup_path(db_path: &Path) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    db_path.with_extension(format!("db.{nanos}.backup"))
}

/// Rebuild the FTS index from the messages table. The triggers keep it
/// current; this exists for recovery after an out-of-band restore.
pub fn rebuild_fts_index(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("INSERT INTO messages_fts(messages_fts) VALUES ('rebuild');")
        .map_err(StoreError::from_sqlite)
}
