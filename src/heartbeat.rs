//! Agent liveness: last-seen timestamps in the store, an in-memory
//! active-session map, and on-demand status computation. Heartbeats are
//! idempotent by construction and bypass the mail actor.

use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{MailError, ServiceResult, StoreError};
use crate::models::{Liveness, now_epoch};
use crate::store::Store;

pub struct HeartbeatTracker {
    store: Arc<Store>,
    /// agent_id -> active session_id. Many readers, occasional writers.
    active: RwLock<HashMap<i64, String>>,
    pub active_threshold_secs: i64,
    pub offline_threshold_secs: i64,
}

impl HeartbeatTracker {
    pub fn new(store: Arc<Store>, active_threshold_secs: i64, offline_threshold_secs: i64) -> Self {
        HeartbeatTracker {
            store,
            active: RwLock::new(HashMap::new()),
            active_threshold_secs,
            offline_threshold_secs,
        }
    }

    /// Record a heartbeat: bumps the agent's `last_active_at` and, when a
    /// session is named, the session row too.
    pub fn heartbeat(&self, agent_id: i64, session_id: Option<&str>) -> ServiceResult<i64> {
        let now = now_epoch();
        let conn = self.store.conn();
        let updated = conn
            .execute(
                "UPDATE agents SET last_active_at = ?2 WHERE id = ?1",
                params![agent_id, now],
            )
            .map_err(StoreError::from_sqlite)?;
        if updated == 0 {
            return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
        }
        if let Some(session_id) = session_id {
            conn.execute(
                "UPDATE sessions SET last_active_at = ?2 WHERE session_id = ?1",
                params![session_id, now],
            )
            .map_err(StoreError::from_sqlite)?;
        }
        Ok(Ok(now))
    }

    /// Mark the agent as being inside a live session.
    pub fn start_session(&self, agent_id: i64, session_id: &str) {
        let mut map = self.active.write().unwrap_or_else(|e| e.into_inner());
        map.insert(agent_id, session_id.to_string());
    }

    /// Returns true if the agent had a session to end.
    pub fn end_session(&self, agent_id: i64) -> bool {
        let mut map = self.active.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&agent_id).is_some()
    }

    pub fn in_session(&self, agent_id: i64) -> bool {
        let map = self.active.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(&agent_id)
    }

    /// Liveness from the last heartbeat and session membership. Computed on
    /// demand, never persisted. `now` is injected so tests can steer time.
    pub fn status_at(&self, agent_id: i64, last_active_at: i64, now: i64) -> Liveness {
        let elapsed = now - last_active_at;
        if elapsed > self.offline_threshold_secs {
            Liveness::Offline
        } else if elapsed > self.active_threshold_secs {
            Liveness::Idle
        } else if self.in_session(agent_id) {
            Liveness::Busy
        } else {
            Liveness::Active
        }
    }

    /// Current liveness for an agent, reading `last_active_at` from the store.
    pub fn status_of(&self, agent_id: i64) -> ServiceResult<Liveness> {
        let last_active_at: Option<i64> = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT last_active_at FROM agents WHERE id = ?1",
                params![agent_id],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from_sqlite(other)),
            })?
        };
        match last_active_at {
            None => Ok(Err(MailError::NotFound(format!("agent {agent_id}")))),
            Some(ts) => Ok(Ok(self.status_at(agent_id, ts, now_epoch()))),
        }
    }
}
