//! Framed binary socket protocol: one newline-delimited JSON frame per
//! request, discriminated by a top-level `kind` field. Timestamps cross
//! this boundary as 64-bit epoch seconds; priority and state cross in
//! their wire spellings (`PRIORITY_*`, `STATE_*`).
//!
//! The frame kinds are frozen the same way the gateway paths are: adding a
//! kind is fine, changing one is a protocol break.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::error::MailError;
use crate::heartbeat::HeartbeatTracker;
use crate::identity::IdentityRegistry;
use crate::mail::actor::MailboxHandle;
use crate::models::*;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Per-topic resume cursor carried by poll requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCursor {
    pub topic_id: i64,
    pub offset: i64,
}

/// A message plus the caller's envelope, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: i64,
    pub thread_id: String,
    pub topic_id: i64,
    pub log_offset: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<String>, // base64
    pub created_at: i64,
    pub state: String,
    pub is_starred: bool,
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<i64>,
}

impl WireMessage {
    pub fn from_envelope(env: &MessageEnvelope) -> WireMessage {
        use base64::Engine;
        WireMessage {
            id: env.message.id,
            thread_id: env.message.thread_id.clone(),
            topic_id: env.message.topic_id,
            log_offset: env.message.log_offset,
            sender_id: env.message.sender_id,
            sender_name: env.sender_name.clone(),
            subject: env.message.subject.clone(),
            body: env.message.body.clone(),
            priority: env.message.priority.wire().to_string(),
            deadline: env.message.deadline,
            attachments: env
                .message
                .attachments
                .as_ref()
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
            created_at: env.message.created_at,
            state: env.recipient.state.wire().to_string(),
            is_starred: env.recipient.is_starred,
            is_archived: env.recipient.is_archived,
            snoozed_until: env.recipient.snoozed_until,
            read_at: env.recipient.read_at,
            acknowledged_at: env.recipient.acknowledged_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> daemon frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireRequest {
    Send {
        sender_id: i64,
        #[serde(default)]
        to: Vec<String>,
        subject: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        thread_id: Option<String>,
        #[serde(default)]
        deadline: Option<i64>,
        #[serde(default)]
        attachments: Option<String>, // base64
        #[serde(default)]
        topic: Option<String>,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Publish {
        sender_id: i64,
        topic: String,
        subject: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    FetchInbox {
        agent_id: i64,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        unread_only: bool,
        #[serde(default)]
        include_archived: bool,
    },
    ReadMessage { agent_id: i64, message_id: i64 },
    AckMessage { agent_id: i64, message_id: i64 },
    UpdateState {
        agent_id: i64,
        message_id: i64,
        state: String,
        #[serde(default)]
        snoozed_until: Option<i64>,
    },
    PollChanges {
        agent_id: i64,
        #[serde(default)]
        since: Vec<OffsetCursor>,
    },
    GetStatus { agent_id: i64 },
    HasUnackedStatusTo { sender_id: i64, recipient_id: i64 },
    GetThread { thread_id: String },
    CreateTopic {
        name: String,
        topic_type: String,
        #[serde(default)]
        retention_secs: Option<i64>,
    },
    ListTopics,
    Subscribe { agent_id: i64, topic: String },
    Unsubscribe { agent_id: i64, topic: String },
    Search {
        query: String,
        #[serde(default)]
        agent_id: Option<i64>,
        #[serde(default)]
        limit: Option<i64>,
    },
    RegisterAgent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        project_key: Option<String>,
        #[serde(default)]
        git_branch: Option<String>,
    },
    GetAgent { agent_id: i64 },
    ListAgents,
    DeleteAgent { agent_id: i64 },
    Heartbeat {
        agent_id: i64,
        #[serde(default)]
        session_id: Option<String>,
    },
    EnsureIdentity {
        session_id: String,
        #[serde(default)]
        project_dir: Option<String>,
        #[serde(default)]
        git_branch: Option<String>,
    },
    StartSession { agent_id: i64, session_id: String },
    EndSession { agent_id: i64 },
}

// ---------------------------------------------------------------------------
// Daemon -> client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAgent {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
}

impl From<&Agent> for WireAgent {
    fn from(agent: &Agent) -> WireAgent {
        WireAgent {
            id: agent.id,
            name: agent.name.clone(),
            project_key: agent.project_key.clone(),
            git_branch: agent.git_branch.clone(),
            created_at: agent.created_at,
            last_active_at: agent.last_active_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireResponse {
    SendReceipt { message_id: i64, thread_id: String },
    PublishReceipt { message_id: i64, recipients_count: i64 },
    Inbox { messages: Vec<WireMessage> },
    Message { message: Box<WireMessage> },
    Acked { acknowledged_at: i64 },
    StateChanged { state: String, is_starred: bool, is_archived: bool },
    Changes { messages: Vec<WireMessage>, offsets: Vec<OffsetCursor> },
    Status {
        agent_id: i64,
        agent_name: String,
        unread: i64,
        urgent: i64,
        starred: i64,
        snoozed: i64,
    },
    Flag { value: bool },
    Thread { thread_id: String, messages: Vec<WireMessage> },
    Topic {
        id: i64,
        name: String,
        topic_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retention_secs: Option<i64>,
    },
    Topics { topics: Vec<serde_json::Value> },
    Subscribed { agent_id: i64, topic_id: i64 },
    Unsubscribed { removed: bool },
    Hits { hits: Vec<serde_json::Value> },
    Agent { agent: WireAgent },
    Agents { agents: Vec<WireAgent> },
    Deleted,
    HeartbeatAt { at: i64, liveness: String },
    Identity { agent: WireAgent, source: String },
    SessionStarted,
    SessionEnded { was_active: bool },
    Error { code: String, message: String },
}

impl WireResponse {
    fn domain_error(err: &MailError) -> WireResponse {
        let code = match err {
            MailError::NotFound(_) => "not_found",
            MailError::InvalidArgument(_) => "invalid_argument",
            MailError::Conflict(_) => "conflict",
            MailError::InvalidTransition { .. } => "invalid_transition",
        };
        WireResponse::Error { code: code.into(), message: err.to_string() }
    }

    fn infra_error(message: String) -> WireResponse {
        WireResponse::Error { code: "unavailable".into(), message }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WireContext {
    pub mailbox: MailboxHandle,
    pub service: Arc<crate::mail::MailService>,
    pub registry: Arc<IdentityRegistry>,
    pub tracker: Arc<HeartbeatTracker>,
}

/// Bind and serve. One task per connection, one frame per line, responses
/// in request order per connection.
pub async fn serve(ctx: WireContext, addr: String) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "wire listener failed to bind");
            return;
        }
    };
    tracing::info!(%addr, "wire listener ready");
    serve_on(ctx, listener).await;
}

/// Accept loop over an already-bound listener.
pub async fn serve_on(ctx: WireContext, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "wire connection opened");
                    let (read_half, mut write_half) = socket.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let response = match serde_json::from_str::<WireRequest>(&line) {
                            Ok(request) => handle(&ctx, request).await,
                            Err(err) => WireResponse::Error {
                                code: "bad_frame".into(),
                                message: err.to_string(),
                            },
                        };
                        let mut frame = serde_json::to_string(&response)
                            .unwrap_or_else(|_| r#"{"kind":"error","code":"internal"}"#.to_string());
                        frame.push('\n');
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    tracing::debug!(%peer, "wire connection closed");
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "wire accept failed");
            }
        }
    }
}

macro_rules! respond {
    ($outcome:expr, $ok:pat => $response:expr) => {
        match $outcome {
            Ok(Ok($ok)) => $response,
            Ok(Err(domain)) => WireResponse::domain_error(&domain),
            Err(infra) => WireResponse::infra_error(infra.to_string()),
        }
    };
}

async fn handle(ctx: &WireContext, request: WireRequest) -> WireResponse {
    match request {
        WireRequest::Send {
            sender_id, to, subject, body, priority, thread_id, deadline,
            attachments, topic, idempotency_key,
        } => {
            let priority = match parse_priority(priority.as_deref()) {
                Ok(p) => p,
                Err(err) => return WireResponse::domain_error(&err),
            };
            let attachments = match decode_attachments(attachments.as_deref()) {
                Ok(a) => a,
                Err(err) => return WireResponse::domain_error(&err),
            };
            let input = SendInput {
                sender_id,
                recipient_names: to,
                subject,
                body,
                priority,
                thread_id,
                deadline,
                attachments,
                topic_name: topic,
                idempotency_key,
            };
            respond!(ctx.mailbox.send_mail(input).await,
                receipt => WireResponse::SendReceipt {
                    message_id: receipt.message_id,
                    thread_id: receipt.thread_id,
                })
        }
        WireRequest::Publish { sender_id, topic, subject, body, priority, idempotency_key } => {
            let priority = match parse_priority(priority.as_deref()) {
                Ok(p) => p,
                Err(err) => return WireResponse::domain_error(&err),
            };
            let input = PublishInput {
                sender_id,
                topic_name: topic,
                subject,
                body,
                priority,
                idempotency_key,
            };
            respond!(ctx.mailbox.publish(input).await,
                receipt => WireResponse::PublishReceipt {
                    message_id: receipt.message_id,
                    recipients_count: receipt.recipients_count,
                })
        }
        WireRequest::FetchInbox { agent_id, limit, unread_only, include_archived } => {
            respond!(
                ctx.mailbox
                    .fetch_inbox(agent_id, limit.unwrap_or(50), unread_only, include_archived)
                    .await,
                envelopes => WireResponse::Inbox {
                    messages: envelopes.iter().map(WireMessage::from_envelope).collect(),
                }
            )
        }
        WireRequest::ReadMessage { agent_id, message_id } => {
            respond!(ctx.mailbox.read_message(agent_id, message_id).await,
                env => WireResponse::Message { message: Box::new(WireMessage::from_envelope(&env)) })
        }
        WireRequest::AckMessage { agent_id, message_id } => {
            respond!(ctx.mailbox.ack_message(agent_id, message_id).await,
                at => WireResponse::Acked { acknowledged_at: at })
        }
        WireRequest::UpdateState { agent_id, message_id, state, snoozed_until } => {
            let state = match MessageState::from_wire(&state) {
                Ok(s) => s,
                Err(err) => return WireResponse::domain_error(&err),
            };
            respond!(
                ctx.mailbox.update_state(agent_id, message_id, state, snoozed_until).await,
                meta => WireResponse::StateChanged {
                    state: meta.state.wire().to_string(),
                    is_starred: meta.is_starred,
                    is_archived: meta.is_archived,
                }
            )
        }
        WireRequest::PollChanges { agent_id, since } => {
            let cursor: HashMap<i64, i64> =
                since.iter().map(|c| (c.topic_id, c.offset)).collect();
            respond!(ctx.mailbox.poll_changes(agent_id, cursor).await,
                poll => {
                    let mut offsets: Vec<OffsetCursor> = poll
                        .offsets
                        .iter()
                        .map(|(&topic_id, &offset)| OffsetCursor { topic_id, offset })
                        .collect();
                    offsets.sort_by_key(|c| c.topic_id);
                    WireResponse::Changes {
                        messages: poll.messages.iter().map(WireMessage::from_envelope).collect(),
                        offsets,
                    }
                })
        }
        WireRequest::GetStatus { agent_id } => {
            respond!(ctx.mailbox.get_status(agent_id).await,
                status => WireResponse::Status {
                    agent_id: status.agent_id,
                    agent_name: status.agent_name,
                    unread: status.unread,
                    urgent: status.urgent,
                    starred: status.starred,
                    snoozed: status.snoozed,
                })
        }
        WireRequest::HasUnackedStatusTo { sender_id, recipient_id } => {
            respond!(ctx.mailbox.has_unacked_status_to(sender_id, recipient_id).await,
                value => WireResponse::Flag { value })
        }
        // Thread reads are immutable-row queries; they bypass the mailbox.
        WireRequest::GetThread { thread_id } => respond_thread(ctx, &thread_id),
        WireRequest::CreateTopic { name, topic_type, retention_secs } => {
            let topic_type = match TopicType::parse(&topic_type) {
                Ok(t) => t,
                Err(err) => return WireResponse::domain_error(&err),
            };
            match ctx.service.create_topic(&name, topic_type, retention_secs) {
                Ok(Ok(topic)) => WireResponse::Topic {
                    id: topic.id,
                    name: topic.name,
                    topic_type: topic.topic_type.as_str().to_string(),
                    retention_secs: topic.retention_secs,
                },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::ListTopics => match ctx.service.list_topics() {
            Ok(Ok(topics)) => WireResponse::Topics {
                topics: topics
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "id": t.id,
                            "name": t.name,
                            "topic_type": t.topic_type.as_str(),
                            "retention_secs": t.retention_secs,
                            "created_at": t.created_at,
                        })
                    })
                    .collect(),
            },
            Ok(Err(domain)) => WireResponse::domain_error(&domain),
            Err(store) => WireResponse::infra_error(store.to_string()),
        },
        WireRequest::Subscribe { agent_id, topic } => {
            match ctx.service.subscribe(agent_id, &topic) {
                Ok(Ok(sub)) => WireResponse::Subscribed { agent_id: sub.agent_id, topic_id: sub.topic_id },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::Unsubscribe { agent_id, topic } => {
            match ctx.service.unsubscribe(agent_id, &topic) {
                Ok(Ok(removed)) => WireResponse::Unsubscribed { removed },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::Search { query, agent_id, limit } => {
            match ctx.service.search(agent_id, &query, limit.unwrap_or(50)) {
                Ok(Ok(hits)) => WireResponse::Hits {
                    hits: hits
                        .iter()
                        .map(|h| {
                            serde_json::json!({
                                "message_id": h.message_id,
                                "topic_id": h.topic_id,
                                "sender_id": h.sender_id,
                                "sender_name": h.sender_name,
                                "subject": h.subject,
                                "body": h.body,
                                "created_at": h.created_at,
                            })
                        })
                        .collect(),
                },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::RegisterAgent { name, project_key, git_branch } => {
            match ctx.registry.register_agent(name.as_deref(), project_key.as_deref(), git_branch.as_deref()) {
                Ok(Ok(agent)) => WireResponse::Agent { agent: WireAgent::from(&agent) },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::GetAgent { agent_id } => match ctx.registry.get_agent(agent_id) {
            Ok(Ok(agent)) => WireResponse::Agent { agent: WireAgent::from(&agent) },
            Ok(Err(domain)) => WireResponse::domain_error(&domain),
            Err(store) => WireResponse::infra_error(store.to_string()),
        },
        WireRequest::ListAgents => match ctx.registry.list_agents() {
            Ok(agents) => WireResponse::Agents {
                agents: agents.iter().map(WireAgent::from).collect(),
            },
            Err(store) => WireResponse::infra_error(store.to_string()),
        },
        WireRequest::DeleteAgent { agent_id } => match ctx.registry.delete_agent(agent_id) {
            Ok(Ok(())) => WireResponse::Deleted,
            Ok(Err(domain)) => WireResponse::domain_error(&domain),
            Err(store) => WireResponse::infra_error(store.to_string()),
        },
        WireRequest::Heartbeat { agent_id, session_id } => {
            match ctx.tracker.heartbeat(agent_id, session_id.as_deref()) {
                Ok(Ok(at)) => {
                    let liveness = match ctx.tracker.status_of(agent_id) {
                        Ok(Ok(liveness)) => liveness.as_str().to_string(),
                        _ => Liveness::Active.as_str().to_string(),
                    };
                    WireResponse::HeartbeatAt { at, liveness }
                }
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::EnsureIdentity { session_id, project_dir, git_branch } => {
            match ctx.registry.ensure_identity(&session_id, project_dir.as_deref(), git_branch.as_deref()) {
                Ok(Ok((agent, source))) => WireResponse::Identity {
                    agent: WireAgent::from(&agent),
                    source: source.as_str().to_string(),
                },
                Ok(Err(domain)) => WireResponse::domain_error(&domain),
                Err(store) => WireResponse::infra_error(store.to_string()),
            }
        }
        WireRequest::StartSession { agent_id, session_id } => {
            ctx.tracker.start_session(agent_id, &session_id);
            WireResponse::SessionStarted
        }
        WireRequest::EndSession { agent_id } => WireResponse::SessionEnded {
            was_active: ctx.tracker.end_session(agent_id),
        },
    }
}

fn respond_thread(ctx: &WireContext, thread_id: &str) -> WireResponse {
    match ctx.service.get_thread(thread_id) {
        Ok(Ok(thread)) => WireResponse::Thread {
            thread_id: thread.thread_id,
            messages: thread
                .messages
                .iter()
                .map(|m| {
                    let env = MessageEnvelope {
                        message: m.clone(),
                        sender_name: String::new(),
                        recipient: RecipientMeta {
                            state: MessageState::Unread,
                            is_starred: false,
                            is_archived: false,
                            snoozed_until: None,
                            read_at: None,
                            acknowledged_at: None,
                        },
                    };
                    WireMessage::from_envelope(&env)
                })
                .collect(),
        },
        Ok(Err(domain)) => WireResponse::domain_error(&domain),
        Err(store) => WireResponse::infra_error(store.to_string()),
    }
}

fn parse_priority(value: Option<&str>) -> Result<Priority, MailError> {
    match value {
        None => Ok(Priority::Normal),
        Some(s) => Priority::from_wire(s),
    }
}

fn decode_attachments(value: Option<&str>) -> Result<Option<Vec<u8>>, MailError> {
    use base64::Engine;
    match value {
        None => Ok(None),
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|_| MailError::InvalidArgument("attachments must be base64".into())),
    }
}
