//! CLI-side plumbing: pick how to reach the daemon (probe, direct store,
//! or queue-only), and replay queued operations once a path exists.
//!
//! Mode selection order: explicit queue-only, then a daemon probe with a
//! short timeout, then direct store access. If everything fails and
//! queueing is not suppressed, fall back to queue-only silently.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::error::MailError;
use crate::heartbeat::HeartbeatTracker;
use crate::identity::IdentityRegistry;
use crate::mail::MailService;
use crate::models::{MessageState, Priority, PublishInput, SendInput};
use crate::queue::{OfflineQueue, OpKind, QueuedOp};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Flags the core observes from the CLI surface.
#[derive(Debug, Clone, Default)]
pub struct ModeFlags {
    pub queue_only: bool,
    pub no_queue: bool,
    pub daemon_url: Option<String>,
}

pub enum ClientMode {
    QueueOnly,
    Remote(RemoteClient),
    Direct(DirectClient),
}

impl ClientMode {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMode::QueueOnly => "queue-only",
            ClientMode::Remote(_) => "remote",
            ClientMode::Direct(_) => "direct",
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon unreachable and queueing is disabled")]
    NoPath,
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Domain(#[from] MailError),
    #[error(transparent)]
    Storage(#[from] crate::error::StoreError),
}

/// Choose a client mode. Never errors unless `no_queue` forbids the final
/// fallback.
pub fn select_mode(flags: &ModeFlags, config: &Config) -> Result<ClientMode, ClientError> {
    if flags.queue_only {
        return Ok(ClientMode::QueueOnly);
    }

    let url = flags
        .daemon_url
        .clone()
        .or_else(|| std::env::var("SUBTRATE_DAEMON_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
    let remote = RemoteClient::new(&url);
    if remote.probe() {
        return Ok(ClientMode::Remote(remote));
    }

    match DirectClient::open(config) {
        Ok(direct) => Ok(ClientMode::Direct(direct)),
        Err(err) => {
            if flags.no_queue {
                tracing::debug!(error = %err, "direct store open failed and queueing is disabled");
                Err(ClientError::NoPath)
            } else {
                Ok(ClientMode::QueueOnly)
            }
        }
    }
}

// --- Remote client (JSON gateway over HTTP) ---

pub struct RemoteClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl RemoteClient {
    pub fn new(base: &str) -> RemoteClient {
        RemoteClient {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// Health probe with the short connect timeout.
    pub fn probe(&self) -> bool {
        self.http
            .get(format!("{}/api/v1/health", self.base))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let detail: serde_json::Value = response.json().unwrap_or_default();
        let message = detail["error"].as_str().unwrap_or("request failed").to_string();
        match status.as_u16() {
            404 => Err(MailError::NotFound(message).into()),
            409 => Err(MailError::Conflict(message).into()),
            400 => Err(MailError::InvalidArgument(message).into()),
            _ => Err(ClientError::Transport(format!("{status}: {message}"))),
        }
    }

    fn deliver(&self, op: &QueuedOp) -> Result<(), ClientError> {
        let mut body = op.payload.clone();
        let obj = body.as_object_mut().ok_or_else(|| {
            ClientError::Domain(MailError::InvalidArgument("queued payload is not an object".into()))
        })?;
        obj.insert("sender".into(), op.agent_name.clone().into());
        obj.insert("idempotency_key".into(), op.id.clone().into());
        if let Some(session) = &op.session_id {
            obj.insert("session_id".into(), session.clone().into());
        }
        match op.kind {
            OpKind::Send => self.post("/api/v1/mail/send", body),
            OpKind::Publish => self.post("/api/v1/mail/publish", body),
            OpKind::Heartbeat => self.post("/api/v1/heartbeat", body),
            OpKind::StatusUpdate => self.post("/api/v1/mail/state", body),
        }
    }
}

// --- Direct client (in-process store access) ---

pub struct DirectClient {
    pub service: Arc<MailService>,
    pub registry: IdentityRegistry,
    pub tracker: HeartbeatTracker,
}

impl DirectClient {
    pub fn open(config: &Config) -> Result<DirectClient, crate::error::StoreError> {
        let store = Arc::new(crate::store::Store::open(&config.db_path, config.skip_backup)?);
        let events = Arc::new(crate::events::EventBus::new());
        let service = Arc::new(MailService::new(Arc::clone(&store), events));
        let registry = IdentityRegistry::new(Arc::clone(&store), config.identity_dir());
        let tracker = HeartbeatTracker::new(
            store,
            config.active_threshold_secs,
            config.offline_threshold_secs,
        );
        Ok(DirectClient { service, registry, tracker })
    }

    fn deliver(&self, op: &QueuedOp) -> Result<(), ClientError> {
        let agent = self.registry.get_agent_by_name(&op.agent_name)??;
        let p = &op.payload;
        match op.kind {
            OpKind::Send => {
                let input = SendInput {
                    sender_id: agent.id,
                    recipient_names: string_list(&p["to"]),
                    subject: p["subject"].as_str().unwrap_or_default().to_string(),
                    body: p["body"].as_str().unwrap_or_default().to_string(),
                    priority: parse_priority(p)?,
                    thread_id: p["thread_id"].as_str().map(String::from),
                    deadline: p["deadline"].as_i64(),
                    attachments: None,
                    topic_name: p["topic"].as_str().map(String::from),
                    idempotency_key: Some(op.id.clone()),
                };
                self.service.send(&input)??;
                Ok(())
            }
            OpKind::Publish => {
                let input = PublishInput {
                    sender_id: agent.id,
                    topic_name: p["topic"].as_str().unwrap_or_default().to_string(),
                    subject: p["subject"].as_str().unwrap_or_default().to_string(),
                    body: p["body"].as_str().unwrap_or_default().to_string(),
                    priority: parse_priority(p)?,
                    idempotency_key: Some(op.id.clone()),
                };
                self.service.publish(&input)??;
                Ok(())
            }
            OpKind::Heartbeat => {
                self.tracker.heartbeat(agent.id, op.session_id.as_deref())??;
                Ok(())
            }
            OpKind::StatusUpdate => {
                let message_id = p["message_id"].as_i64().ok_or_else(|| {
                    ClientError::Domain(MailError::InvalidArgument("message_id is required".into()))
                })?;
                let state = MessageState::from_wire(p["state"].as_str().unwrap_or_default())?;
                self.service
                    .update_state(agent.id, message_id, state, p["snoozed_until"].as_i64())??;
                Ok(())
            }
        }
    }
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_priority(payload: &serde_json::Value) -> Result<Priority, MailError> {
    match payload["priority"].as_str() {
        Some(s) => Priority::from_wire(s),
        None => Ok(Priority::Normal),
    }
}

// --- Drain ---

#[derive(Debug, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub purged: usize,
}

/// Replay all pending ops through a connected mode, in order. One failure
/// leaves that op pending and does not stop the rest. Runs before the
/// user-requested command.
pub fn drain_queue(queue: &OfflineQueue, mode: &ClientMode) -> Result<DrainReport, ClientError> {
    let mut report = DrainReport {
        purged: queue.purge_expired()?,
        ..DrainReport::default()
    };
    let ops = queue.drain()?;
    for op in &ops {
        let outcome = match mode {
            ClientMode::QueueOnly => return Ok(report),
            ClientMode::Remote(remote) => remote.deliver(op),
            ClientMode::Direct(direct) => direct.deliver(op),
        };
        match outcome {
            Ok(()) => {
                queue.mark_delivered(&op.id)?;
                report.delivered += 1;
            }
            Err(err) => {
                tracing::warn!(op = %op.id, kind = op.kind.as_str(), error = %err,
                    "queued op delivery failed");
                queue.mark_failed(&op.id, &err.to_string())?;
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
