//! Agent identity: memorable name generation, registration (agent + inbox
//! topic in one transaction), and session/project identity resolution that
//! survives session compaction via JSON files under the daemon data dir.

use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MailError, ServiceResult, StoreError};
use crate::mail::{agent_by_conn, agent_row};
use crate::models::*;
use crate::store::{Store, TxExecutor};

const ADJECTIVES: &[&str] = &[
    "bold", "calm", "deft", "eager", "fleet", "glad", "keen", "lucid", "merry", "nimble",
    "plucky", "quick", "sage", "tidy", "vivid", "wry", "zesty", "brisk", "clever", "steady",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "marten", "osprey", "puffin", "raven", "stoat",
    "tern", "vole", "wren", "beaver", "condor", "dingo", "egret", "ferret", "gannet", "ibis",
];

/// How the identity for a session was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    SessionFile,
    SessionRow,
    ProjectDefault,
    Created,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::SessionFile => "session_file",
            IdentitySource::SessionRow => "session_row",
            IdentitySource::ProjectDefault => "project_default",
            IdentitySource::Created => "created",
        }
    }
}

pub struct IdentityRegistry {
    store: Arc<Store>,
    executor: TxExecutor,
    identity_dir: PathBuf,
}

impl IdentityRegistry {
    pub fn new(store: Arc<Store>, identity_dir: PathBuf) -> Self {
        IdentityRegistry {
            store,
            executor: TxExecutor::default(),
            identity_dir,
        }
    }

    // --- Registration and admin ---

    /// Create an agent and its inbox topic atomically. With no explicit
    /// name, samples adjective+noun pairs until one is free (ten tries),
    /// then falls back to `Agent-<8-hex>` from a fresh UUID.
    pub fn register_agent(
        &self,
        name: Option<&str>,
        project_key: Option<&str>,
        git_branch: Option<&str>,
    ) -> ServiceResult<Agent> {
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() || name.len() > 100 {
                return Ok(Err(MailError::InvalidArgument("agent name must be 1-100 characters".into())));
            }
            return match self.try_register(name, project_key, git_branch) {
                Ok(agent) => Ok(Ok(agent)),
                Err(StoreError::UniqueConstraint) => {
                    Ok(Err(MailError::Conflict(format!("agent {name} already exists"))))
                }
                Err(err) => Err(err),
            };
        }

        for _ in 0..10 {
            let candidate = generate_name();
            match self.try_register(&candidate, project_key, git_branch) {
                Ok(agent) => return Ok(Ok(agent)),
                Err(StoreError::UniqueConstraint) => continue,
                Err(err) => return Err(err),
            }
        }
        let fallback = fallback_name();
        match self.try_register(&fallback, project_key, git_branch) {
            Ok(agent) => Ok(Ok(agent)),
            Err(StoreError::UniqueConstraint) => {
                Ok(Err(MailError::Conflict(format!("agent {fallback} already exists"))))
            }
            Err(err) => Err(err),
        }
    }

    fn try_register(
        &self,
        name: &str,
        project_key: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Agent, StoreError> {
        let now = now_epoch();
        self.executor.execute(&self.store, |tx| {
            tx.execute(
                "INSERT INTO agents (name, project_key, git_branch, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, project_key, git_branch, now],
            )
            .map_err(StoreError::from_sqlite)?;
            let agent_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO topics (name, topic_type, created_at) VALUES (?1, 'inbox', ?2)",
                params![inbox_topic_name(name), now],
            )
            .map_err(StoreError::from_sqlite)?;
            let topic_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO subscriptions (agent_id, topic_id, created_at) VALUES (?1, ?2, ?3)",
                params![agent_id, topic_id, now],
            )
            .map_err(StoreError::from_sqlite)?;
            tx.execute(
                "INSERT INTO consumer_offsets (agent_id, topic_id, last_offset) VALUES (?1, ?2, 0)",
                params![agent_id, topic_id],
            )
            .map_err(StoreError::from_sqlite)?;

            Ok(Agent {
                id: agent_id,
                name: name.to_string(),
                project_key: project_key.map(String::from),
                git_branch: git_branch.map(String::from),
                created_at: now,
                last_active_at: now,
            })
        })
    }

    pub fn get_agent(&self, agent_id: i64) -> ServiceResult<Agent> {
        let conn = self.store.conn();
        match agent_by_conn(&conn, agent_id)? {
            Some(agent) => Ok(Ok(agent)),
            None => Ok(Err(MailError::NotFound(format!("agent {agent_id}")))),
        }
    }

    pub fn get_agent_by_name(&self, name: &str) -> ServiceResult<Agent> {
        let conn = self.store.conn();
        let agent = conn
            .query_row(
                "SELECT id, name, project_key, git_branch, created_at, last_active_at
                 FROM agents WHERE name = ?1",
                params![name],
                agent_row,
            )
            .optional()
            .map_err(StoreError::from_sqlite)?;
        match agent {
            Some(agent) => Ok(Ok(agent)),
            None => Ok(Err(MailError::NotFound(format!("agent {name}")))),
        }
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, project_key, git_branch, created_at, last_active_at
                 FROM agents ORDER BY id",
            )
            .map_err(StoreError::from_sqlite)?;
        let agents = stmt
            .query_map([], agent_row)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(agents)
    }

    /// Delete an agent. Subscriptions, offsets, sessions and recipient rows
    /// cascade; deletion is refused while any message names the agent as
    /// sender, so dangling sender references never exist.
    pub fn delete_agent(&self, agent_id: i64) -> ServiceResult<()> {
        self.executor.execute(&self.store, |tx| {
            let sent: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE sender_id = ?1",
                    params![agent_id],
                    |r| r.get(0),
                )
                .map_err(StoreError::from_sqlite)?;
            if sent > 0 {
                return Ok(Err(MailError::Conflict(format!(
                    "agent {agent_id} has {sent} sent messages"
                ))));
            }
            let name: Option<String> = tx
                .query_row("SELECT name FROM agents WHERE id = ?1", params![agent_id], |r| r.get(0))
                .optional()
                .map_err(StoreError::from_sqlite)?;
            let Some(name) = name else {
                return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
            };
            tx.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])
                .map_err(StoreError::from_sqlite)?;
            // The inbox topic goes too, unless messages from other senders
            // still live in it; those stay addressable by thread and search.
            tx.execute(
                "DELETE FROM topics WHERE name = ?1
                 AND NOT EXISTS (SELECT 1 FROM messages WHERE topic_id = topics.id)",
                params![inbox_topic_name(&name)],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(Ok(()))
        })
    }

    /// Update the stored git branch when the caller reports a new one.
    pub fn update_git_branch(&self, agent_id: i64, git_branch: &str) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE agents SET git_branch = ?2 WHERE id = ?1",
            params![agent_id, git_branch],
        )
        .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    // --- Session identity resolution ---

    /// Resolve a stable identity for a session, in order: persisted session
    /// file, session row in the store, project default, fresh creation.
    pub fn ensure_identity(
        &self,
        session_id: &str,
        project_dir: Option<&str>,
        git_branch: Option<&str>,
    ) -> ServiceResult<(Agent, IdentitySource)> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Ok(Err(MailError::InvalidArgument("session_id must not be empty".into())));
        }
        let project_key = project_dir.map(canonical_project_key);

        // 1. Persisted session file.
        if let Some(file) = self.load_session_file(session_id)? {
            let agent = match self.get_agent(file.agent_id)? {
                Ok(agent) => agent,
                Err(_) => {
                    return Ok(Err(MailError::NotFound(format!(
                        "agent {} referenced by session file",
                        file.agent_id
                    ))));
                }
            };
            let agent = self.adopt(session_id, agent, project_key.as_deref(), git_branch, false)?;
            return Ok(Ok((agent, IdentitySource::SessionFile)));
        }

        // 2. Session row in the store.
        let from_row: Option<i64> = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT agent_id FROM sessions WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::from_sqlite)?
        };
        if let Some(agent_id) = from_row {
            let agent = match self.get_agent(agent_id)? {
                Ok(agent) => agent,
                Err(err) => return Ok(Err(err)),
            };
            let agent = self.adopt(session_id, agent, project_key.as_deref(), git_branch, false)?;
            return Ok(Ok((agent, IdentitySource::SessionRow)));
        }

        // 3. Project default (file first, then store row).
        if let Some(key) = project_key.as_deref() {
            let from_default = match self.load_project_file(key)? {
                Some(file) => Some(file.agent_id),
                None => {
                    let conn = self.store.conn();
                    conn.query_row(
                        "SELECT agent_id FROM project_defaults WHERE project_key = ?1",
                        params![key],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(StoreError::from_sqlite)?
                }
            };
            if let Some(agent_id) = from_default
                && let Ok(agent) = self.get_agent(agent_id)?
            {
                let agent = self.adopt(session_id, agent, Some(key), git_branch, false)?;
                return Ok(Ok((agent, IdentitySource::ProjectDefault)));
            }
        }

        // 4. Fresh agent.
        let agent = match self.register_agent(None, project_key.as_deref(), git_branch)? {
            Ok(agent) => agent,
            Err(err) => return Ok(Err(err)),
        };
        let agent = self.adopt(session_id, agent, project_key.as_deref(), git_branch, true)?;
        Ok(Ok((agent, IdentitySource::Created)))
    }

    /// Bind `session_id` to `agent`: upsert the session row, refresh the
    /// git branch when drifted, and persist the identity files.
    fn adopt(
        &self,
        session_id: &str,
        mut agent: Agent,
        project_key: Option<&str>,
        git_branch: Option<&str>,
        new_project_default: bool,
    ) -> Result<Agent, StoreError> {
        let now = now_epoch();
        self.executor.execute(&self.store, |tx| {
            tx.execute(
                "INSERT INTO sessions (session_id, agent_id, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(session_id)
                 DO UPDATE SET agent_id = excluded.agent_id, last_active_at = excluded.last_active_at",
                params![session_id, agent.id, now],
            )
            .map_err(StoreError::from_sqlite)?;
            if new_project_default && let Some(key) = project_key {
                tx.execute(
                    "INSERT OR IGNORE INTO project_defaults (project_key, agent_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![key, agent.id, now],
                )
                .map_err(StoreError::from_sqlite)?;
            }
            Ok(())
        })?;

        if let Some(branch) = git_branch
            && agent.git_branch.as_deref() != Some(branch)
        {
            self.update_git_branch(agent.id, branch)?;
            agent.git_branch = Some(branch.to_string());
        }

        let offsets = self.consumer_offsets_snapshot(agent.id)?;
        let file = IdentityFile {
            session_id: Some(session_id.to_string()),
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            project_key: project_key.map(String::from),
            git_branch: agent.git_branch.clone(),
            created_at: agent.created_at,
            last_active_at: now,
            consumer_offsets: offsets,
        };
        self.write_session_file(session_id, &file)?;
        if new_project_default && let Some(key) = project_key {
            let mut project_file = file.clone();
            project_file.session_id = None;
            self.write_project_file(key, &project_file)?;
        }
        Ok(agent)
    }

    fn consumer_offsets_snapshot(&self, agent_id: i64) -> Result<HashMap<String, i64>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT t.name, o.last_offset FROM consumer_offsets o
                 JOIN topics t ON t.id = o.topic_id
                 WHERE o.agent_id = ?1",
            )
            .map_err(StoreError::from_sqlite)?;
        let offsets = stmt
            .query_map(params![agent_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(offsets)
    }

    // --- Identity files ---

    fn session_file_path(&self, session_id: &str) -> PathBuf {
        self.identity_dir.join("by-session").join(format!("{session_id}.json"))
    }

    fn project_file_path(&self, project_key: &str) -> PathBuf {
        self.identity_dir
            .join("by-project")
            .join(format!("{}.json", project_key_hash(project_key)))
    }

    fn load_session_file(&self, session_id: &str) -> Result<Option<IdentityFile>, StoreError> {
        read_identity_file(&self.session_file_path(session_id))
    }

    fn load_project_file(&self, project_key: &str) -> Result<Option<IdentityFile>, StoreError> {
        read_identity_file(&self.project_file_path(project_key))
    }

    fn write_session_file(&self, session_id: &str, file: &IdentityFile) -> Result<(), StoreError> {
        write_identity_file(&self.session_file_path(session_id), file)
    }

    fn write_project_file(&self, project_key: &str, file: &IdentityFile) -> Result<(), StoreError> {
        write_identity_file(&self.project_file_path(project_key), file)
    }
}

/// 8-hex truncated SHA-256 of the canonical project path.
pub fn project_key_hash(project_key: &str) -> String {
    let digest = Sha256::digest(project_key.as_bytes());
    hex::encode(&digest[..4])
}

fn canonical_project_key(project_dir: &str) -> String {
    Path::new(project_dir)
        .canonicalize()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| project_dir.to_string())
}

fn read_identity_file(path: &Path) -> Result<Option<IdentityFile>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Temp-file + atomic rename so concurrent writers for the same session
/// never interleave. Directories are created 0700.
fn write_identity_file(path: &Path, file: &IdentityFile) -> Result<(), StoreError> {
    let parent = path.parent().expect("identity file has a parent dir");
    create_private_dir(parent)?;
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(file).expect("identity file serializes");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

fn generate_name() -> String {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let noun = NOUNS.choose(&mut rng).expect("non-empty list");
    format!("{}{}", capitalize(adjective), capitalize(noun))
}

fn fallback_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("Agent-{}", &id[..8])
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
