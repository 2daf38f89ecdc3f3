use rusqlite::{Connection, params};
use std::sync::{Arc, Mutex};

use crate::models::now_epoch;

/// Interval between maintenance sweeps (seconds).
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Result of a single maintenance sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub topics_checked: usize,
    pub messages_pruned: i64,
    pub idempotency_pruned: i64,
}

/// Spawns a background task that periodically prunes messages in topics
/// with a retention duration and drops idempotency keys older than the
/// dedup window.
///
/// Pruning deletes message rows (recipient rows cascade) but never reuses
/// log offsets; the per-topic high-water mark is untouched.
pub fn spawn_sweep_task(db_path: String, dedup_window_secs: i64) {
    tokio::spawn(async move {
        let conn = Arc::new(Mutex::new(match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "sweep task: failed to open DB");
                return;
            }
        }));
        {
            let db = conn.lock().unwrap_or_else(|e| e.into_inner());
            db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
                .ok();
        }

        // Initial delay: let the daemon finish starting before the first sweep
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;

        loop {
            {
                let db = conn.lock().unwrap_or_else(|e| {
                    tracing::warn!("sweep task DB mutex poisoned, recovering");
                    e.into_inner()
                });
                let result = run_sweep(&db, dedup_window_secs);
                if result.messages_pruned > 0 || result.idempotency_pruned > 0 {
                    tracing::info!(
                        messages = result.messages_pruned,
                        idempotency_keys = result.idempotency_pruned,
                        "sweep pruned rows"
                    );
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
        }
    });
}

/// Execute one maintenance sweep. Returns structured results for
/// inspection and tests.
pub fn run_sweep(conn: &Connection, dedup_window_secs: i64) -> SweepResult {
    let now = now_epoch();
    let mut result = SweepResult::default();

    let topics: Vec<(i64, i64)> = {
        let mut stmt = match conn
            .prepare("SELECT id, retention_secs FROM topics WHERE retention_secs IS NOT NULL")
        {
            Ok(s) => s,
            Err(_) => return result,
        };
        match stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => return result,
        }
    };
    result.topics_checked = topics.len();

    for (topic_id, retention_secs) in topics {
        let cutoff = now - retention_secs;
        let pruned = conn
            .execute(
                "DELETE FROM messages WHERE topic_id = ?1 AND created_at < ?2",
                params![topic_id, cutoff],
            )
            .unwrap_or(0) as i64;
        result.messages_pruned += pruned;
    }

    result.idempotency_pruned = conn
        .execute(
            "DELETE FROM idempotency WHERE observed_at < ?1",
            params![now - dedup_window_secs],
        )
        .unwrap_or(0) as i64;

    result
}
