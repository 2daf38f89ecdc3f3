use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::MailError;

/// Whole-second Unix timestamp, the store's native time representation.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Epoch seconds -> RFC 3339, for the JSON gateway boundary.
pub fn epoch_to_rfc3339(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// RFC 3339 -> epoch seconds. Rejects unparseable input at the boundary.
pub fn rfc3339_to_epoch(s: &str) -> Result<i64, MailError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|_| MailError::InvalidArgument(format!("unparseable timestamp: {s}")))
}

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Priority, MailError> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(MailError::InvalidArgument(format!("unknown priority: {other}"))),
        }
    }

    /// External wire spelling (binary protocol and JSON gateway).
    pub fn wire(&self) -> &'static str {
        match self {
            Priority::Urgent => "PRIORITY_URGENT",
            Priority::Normal => "PRIORITY_NORMAL",
            Priority::Low => "PRIORITY_LOW",
        }
    }

    pub fn from_wire(s: &str) -> Result<Priority, MailError> {
        match s {
            "PRIORITY_URGENT" => Ok(Priority::Urgent),
            "PRIORITY_NORMAL" => Ok(Priority::Normal),
            "PRIORITY_LOW" => Ok(Priority::Low),
            // Accept the internal spelling too; hook scripts are sloppy.
            other => Priority::parse(other),
        }
    }

    /// Sort rank for inbox ordering: urgent first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Unread,
    Read,
    Starred,
    Snoozed,
    Archived,
    Trash,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Unread => "unread",
            MessageState::Read => "read",
            MessageState::Starred => "starred",
            MessageState::Snoozed => "snoozed",
            MessageState::Archived => "archived",
            MessageState::Trash => "trash",
        }
    }

    pub fn parse(s: &str) -> Result<MessageState, MailError> {
        match s {
            "unread" => Ok(MessageState::Unread),
            "read" => Ok(MessageState::Read),
            "starred" => Ok(MessageState::Starred),
            "snoozed" => Ok(MessageState::Snoozed),
            "archived" => Ok(MessageState::Archived),
            "trash" => Ok(MessageState::Trash),
            other => Err(MailError::InvalidArgument(format!("unknown state: {other}"))),
        }
    }

    pub fn wire(&self) -> &'static str {
        match self {
            MessageState::Unread => "STATE_UNREAD",
            MessageState::Read => "STATE_READ",
            MessageState::Starred => "STATE_STARRED",
            MessageState::Snoozed => "STATE_SNOOZED",
            MessageState::Archived => "STATE_ARCHIVED",
            MessageState::Trash => "STATE_TRASH",
        }
    }

    pub fn from_wire(s: &str) -> Result<MessageState, MailError> {
        match s {
            "STATE_UNREAD" => Ok(MessageState::Unread),
            "STATE_READ" => Ok(MessageState::Read),
            "STATE_STARRED" => Ok(MessageState::Starred),
            "STATE_SNOOZED" => Ok(MessageState::Snoozed),
            "STATE_ARCHIVED" => Ok(MessageState::Archived),
            "STATE_TRASH" => Ok(MessageState::Trash),
            other => MessageState::parse(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicType {
    Direct,
    Broadcast,
    Queue,
    Inbox,
}

impl TopicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicType::Direct => "direct",
            TopicType::Broadcast => "broadcast",
            TopicType::Queue => "queue",
            TopicType::Inbox => "inbox",
        }
    }

    pub fn parse(s: &str) -> Result<TopicType, MailError> {
        match s {
            "direct" => Ok(TopicType::Direct),
            "broadcast" => Ok(TopicType::Broadcast),
            "queue" => Ok(TopicType::Queue),
            "inbox" => Ok(TopicType::Inbox),
            other => Err(MailError::InvalidArgument(format!("unknown topic type: {other}"))),
        }
    }
}

/// Computed liveness; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Active,
    Busy,
    Idle,
    Offline,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Active => "active",
            Liveness::Busy => "busy",
            Liveness::Idle => "idle",
            Liveness::Offline => "offline",
        }
    }
}

// --- Entities ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
}

/// The inbox topic name is a fixed bijection of the agent name.
pub fn inbox_topic_name(agent_name: &str) -> String {
    format!("inbox:{agent_name}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub topic_type: TopicType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: String,
    pub topic_id: i64,
    pub log_offset: i64,
    pub sender_id: i64,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<u8>>,
    pub created_at: i64,
}

/// Per-agent envelope state around a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientMeta {
    pub state: MessageState,
    pub is_starred: bool,
    pub is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<i64>,
}

impl RecipientMeta {
    /// The state polling queries must report: a snoozed recipient whose
    /// wake time has passed appears unread whether or not any wake job ran.
    pub fn effective_state(&self, now: i64) -> MessageState {
        match (self.state, self.snoozed_until) {
            (MessageState::Snoozed, Some(until)) if until <= now => MessageState::Unread,
            (state, _) => state,
        }
    }
}

/// A message joined with the fetching agent's recipient row and the sender
/// name, as returned by inbox and poll queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    #[serde(flatten)]
    pub recipient: RecipientMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub agent_id: i64,
    pub topic_id: i64,
    pub created_at: i64,
}

// --- Operation inputs and receipts ---

#[derive(Debug, Clone)]
pub struct SendInput {
    pub sender_id: i64,
    pub recipient_names: Vec<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub thread_id: Option<String>,
    pub deadline: Option<i64>,
    pub attachments: Option<Vec<u8>>,
    pub topic_name: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: i64,
    pub thread_id: String,
}

#[derive(Debug, Clone)]
pub struct PublishInput {
    pub sender_id: i64,
    pub topic_name: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: i64,
    pub recipients_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: i64,
    pub agent_name: String,
    pub unread: i64,
    pub urgent: i64,
    pub starred: i64,
    pub snoozed: i64,
}

/// Delta of messages since a per-topic offset vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub messages: Vec<MessageEnvelope>,
    /// topic_id -> highest offset now observed, for the next poll.
    pub offsets: HashMap<i64, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadView {
    pub thread_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message_id: i64,
    pub topic_id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
    pub created_at: i64,
}

// --- Identity files ---

/// On-disk JSON identity record; one schema for both the by-session and
/// by-project files. Times are seconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub agent_id: i64,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
    /// topic name -> last delivered log offset, snapshotted at resolve time.
    #[serde(default)]
    pub consumer_offsets: HashMap<String, i64>,
}
