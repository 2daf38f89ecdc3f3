// Route module decomposition — each domain area in its own file.
// Shared DTOs and error mapping live here; route functions in submodules.

mod agents;
mod mail;
mod poll;
mod search;
mod stream;
mod system;
mod topics;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use agents::{
    delete_agent, end_session, ensure_identity, get_agent, heartbeat, heartbeat_by_name,
    list_agents, register_agent, start_session,
};
pub use mail::{
    ack_message, agent_status, get_thread, has_unacked, inbox, publish_message, read_message,
    send_message, update_state, update_state_by_name,
};
pub use poll::{poll_changes, wait_changes};
pub use search::search_messages;
pub use stream::event_stream;
pub use system::{health, internal_error, not_found, stats, unprocessable};
pub use topics::{create_topic, list_topics, subscribe_topic, unsubscribe_topic};

use rocket::http::Status;
use rocket::serde::json::Json;
use serde::Serialize;

use crate::error::{MailError, StoreError};
use crate::mail::actor::AskError;
use crate::models::*;

pub type ApiError = (Status, Json<serde_json::Value>);

pub fn domain_error(err: &MailError) -> ApiError {
    let status = match err {
        MailError::NotFound(_) => Status::NotFound,
        MailError::Conflict(_) => Status::Conflict,
        MailError::InvalidArgument(_) | MailError::InvalidTransition { .. } => Status::BadRequest,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

pub fn storage_error(err: &StoreError) -> ApiError {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"error": err.to_string()})),
    )
}

pub fn ask_error(err: &AskError) -> ApiError {
    match err {
        AskError::ActorTerminated => (
            Status::ServiceUnavailable,
            Json(serde_json::json!({"error": "mail actor terminated"})),
        ),
        AskError::Storage(store) => storage_error(store),
    }
}

/// Collapse the nested service result into a route result.
pub fn unwrap_service<T>(outcome: Result<Result<T, MailError>, StoreError>) -> Result<T, ApiError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(domain)) => Err(domain_error(&domain)),
        Err(store) => Err(storage_error(&store)),
    }
}

/// Same, for replies that travelled through the actor mailbox.
pub fn unwrap_ask<T>(outcome: Result<Result<T, MailError>, AskError>) -> Result<T, ApiError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(domain)) => Err(domain_error(&domain)),
        Err(infra) => Err(ask_error(&infra)),
    }
}

// --- Gateway DTOs ---
//
// The JSON gateway mirrors the binary facade but converts at the boundary:
// enum values in wire spelling, timestamps as RFC 3339 strings, attachment
// blobs as base64.

#[derive(Debug, Serialize)]
pub struct AgentDto {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness: Option<String>,
}

impl AgentDto {
    pub fn new(agent: &Agent, liveness: Option<Liveness>) -> AgentDto {
        AgentDto {
            id: agent.id,
            name: agent.name.clone(),
            project_key: agent.project_key.clone(),
            git_branch: agent.git_branch.clone(),
            created_at: epoch_to_rfc3339(agent.created_at),
            last_active_at: epoch_to_rfc3339(agent.last_active_at),
            liveness: liveness.map(|l| l.as_str().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    pub id: i64,
    pub thread_id: String,
    pub topic_id: i64,
    pub log_offset: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<String>,
    pub created_at: String,
    pub state: String,
    pub is_starred: bool,
    pub is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<String>,
}

impl MessageDto {
    pub fn from_envelope(env: &MessageEnvelope) -> MessageDto {
        use base64::Engine;
        MessageDto {
            id: env.message.id,
            thread_id: env.message.thread_id.clone(),
            topic_id: env.message.topic_id,
            log_offset: env.message.log_offset,
            sender_id: env.message.sender_id,
            sender_name: env.sender_name.clone(),
            subject: env.message.subject.clone(),
            body: env.message.body.clone(),
            priority: env.message.priority.wire().to_string(),
            deadline: env.message.deadline.map(epoch_to_rfc3339),
            attachments: env
                .message
                .attachments
                .as_ref()
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
            created_at: epoch_to_rfc3339(env.message.created_at),
            state: env.recipient.state.wire().to_string(),
            is_starred: env.recipient.is_starred,
            is_archived: env.recipient.is_archived,
            snoozed_until: env.recipient.snoozed_until.map(epoch_to_rfc3339),
            read_at: env.recipient.read_at.map(epoch_to_rfc3339),
            acknowledged_at: env.recipient.acknowledged_at.map(epoch_to_rfc3339),
        }
    }

    /// A thread view row has no recipient context; only message fields are
    /// meaningful.
    pub fn from_message(message: &Message, sender_name: &str) -> MessageDto {
        let env = MessageEnvelope {
            message: message.clone(),
            sender_name: sender_name.to_string(),
            recipient: RecipientMeta {
                state: MessageState::Unread,
                is_starred: false,
                is_archived: false,
                snoozed_until: None,
                read_at: None,
                acknowledged_at: None,
            },
        };
        MessageDto::from_envelope(&env)
    }
}

#[derive(Debug, Serialize)]
pub struct TopicDto {
    pub id: i64,
    pub name: String,
    pub topic_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<i64>,
    pub created_at: String,
}

impl TopicDto {
    pub fn new(topic: &Topic) -> TopicDto {
        TopicDto {
            id: topic.id,
            name: topic.name.clone(),
            topic_type: topic.topic_type.as_str().to_string(),
            retention_secs: topic.retention_secs,
            created_at: epoch_to_rfc3339(topic.created_at),
        }
    }
}

/// Parse an optional wire-form priority, defaulting to normal.
pub fn priority_or_default(value: Option<&str>) -> Result<Priority, ApiError> {
    match value {
        None => Ok(Priority::Normal),
        Some(s) => Priority::from_wire(s).map_err(|e| domain_error(&e)),
    }
}

/// Gateway timestamps arrive as RFC 3339 strings.
pub fn parse_deadline(value: Option<&str>) -> Result<Option<i64>, ApiError> {
    match value {
        None => Ok(None),
        Some(s) => rfc3339_to_epoch(s).map(Some).map_err(|e| domain_error(&e)),
    }
}

pub fn decode_attachments(value: Option<&str>) -> Result<Option<Vec<u8>>, ApiError> {
    use base64::Engine;
    match value {
        None => Ok(None),
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|_| {
                domain_error(&MailError::InvalidArgument("attachments must be base64".into()))
            }),
    }
}
