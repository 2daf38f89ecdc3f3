use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::MailError;
use crate::identity::IdentityRegistry;
use crate::mail::MailService;
use crate::mail::actor::MailboxHandle;
use crate::models::*;

use super::{
    ApiError, MessageDto, decode_attachments, domain_error, parse_deadline, priority_or_default,
    unwrap_ask, unwrap_service,
};

#[derive(Debug, Deserialize)]
pub struct SendBody {
    #[serde(default)]
    pub sender_id: Option<i64>,
    /// Name-addressed form used by queued-op replay and hook scripts.
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub attachments: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn resolve_sender(
    registry: &IdentityRegistry,
    sender_id: Option<i64>,
    sender: Option<&str>,
) -> Result<i64, ApiError> {
    match (sender_id, sender) {
        (Some(id), _) => Ok(id),
        (None, Some(name)) => Ok(unwrap_service(registry.get_agent_by_name(name))?.id),
        (None, None) => Err(domain_error(&MailError::InvalidArgument(
            "sender_id or sender is required".into(),
        ))),
    }
}

#[post("/api/v1/mail/send", format = "json", data = "<body>")]
pub async fn send_message(
    mailbox: &State<MailboxHandle>,
    registry: &State<Arc<IdentityRegistry>>,
    body: Json<SendBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sender_id = resolve_sender(registry, body.sender_id, body.sender.as_deref())?;
    let input = SendInput {
        sender_id,
        recipient_names: body.to.clone(),
        subject: body.subject.trim().to_string(),
        body: body.body.clone(),
        priority: priority_or_default(body.priority.as_deref())?,
        thread_id: body.thread_id.clone(),
        deadline: parse_deadline(body.deadline.as_deref())?,
        attachments: decode_attachments(body.attachments.as_deref())?,
        topic_name: body.topic.clone(),
        idempotency_key: body.idempotency_key.clone(),
    };
    let receipt = unwrap_ask(mailbox.send_mail(input).await)?;
    Ok(Json(serde_json::json!({
        "message_id": receipt.message_id,
        "thread_id": receipt.thread_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<String>,
    pub topic: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[post("/api/v1/mail/publish", format = "json", data = "<body>")]
pub async fn publish_message(
    mailbox: &State<MailboxHandle>,
    registry: &State<Arc<IdentityRegistry>>,
    body: Json<PublishBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sender_id = resolve_sender(registry, body.sender_id, body.sender.as_deref())?;
    let input = PublishInput {
        sender_id,
        topic_name: body.topic.clone(),
        subject: body.subject.trim().to_string(),
        body: body.body.clone(),
        priority: priority_or_default(body.priority.as_deref())?,
        idempotency_key: body.idempotency_key.clone(),
    };
    let receipt = unwrap_ask(mailbox.publish(input).await)?;
    Ok(Json(serde_json::json!({
        "message_id": receipt.message_id,
        "recipients_count": receipt.recipients_count,
    })))
}

#[get("/api/v1/agents/<agent_id>/inbox?<limit>&<unread_only>&<include_archived>")]
pub async fn inbox(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
    limit: Option<i64>,
    unread_only: Option<bool>,
    include_archived: Option<bool>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let envelopes = unwrap_ask(
        mailbox
            .fetch_inbox(
                agent_id,
                limit.unwrap_or(50),
                unread_only.unwrap_or(false),
                include_archived.unwrap_or(false),
            )
            .await,
    )?;
    Ok(Json(envelopes.iter().map(MessageDto::from_envelope).collect()))
}

#[get("/api/v1/agents/<agent_id>/messages/<message_id>")]
pub async fn read_message(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
    message_id: i64,
) -> Result<Json<MessageDto>, ApiError> {
    let envelope = unwrap_ask(mailbox.read_message(agent_id, message_id).await)?;
    Ok(Json(MessageDto::from_envelope(&envelope)))
}

#[post("/api/v1/agents/<agent_id>/messages/<message_id>/ack")]
pub async fn ack_message(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
    message_id: i64,
) -> Result<Json<serde_json::Value>, ApiError> {
    let at = unwrap_ask(mailbox.ack_message(agent_id, message_id).await)?;
    Ok(Json(serde_json::json!({"acknowledged_at": epoch_to_rfc3339(at)})))
}

#[derive(Debug, Deserialize)]
pub struct StateBody {
    pub state: String,
    #[serde(default)]
    pub snoozed_until: Option<String>,
}

#[post(
    "/api/v1/agents/<agent_id>/messages/<message_id>/state",
    format = "json",
    data = "<body>"
)]
pub async fn update_state(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
    message_id: i64,
    body: Json<StateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state = MessageState::from_wire(&body.state).map_err(|e| domain_error(&e))?;
    let snoozed_until = parse_deadline(body.snoozed_until.as_deref())?;
    let meta = unwrap_ask(mailbox.update_state(agent_id, message_id, state, snoozed_until).await)?;
    Ok(Json(state_json(message_id, agent_id, &meta)))
}

#[derive(Debug, Deserialize)]
pub struct NamedStateBody {
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<String>,
    pub message_id: i64,
    pub state: String,
    #[serde(default)]
    pub snoozed_until: Option<String>,
}

/// Name-addressed state update used by queued-op replay.
#[post("/api/v1/mail/state", format = "json", data = "<body>")]
pub async fn update_state_by_name(
    mailbox: &State<MailboxHandle>,
    registry: &State<Arc<IdentityRegistry>>,
    body: Json<NamedStateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent_id = resolve_sender(registry, body.sender_id, body.sender.as_deref())?;
    let state = MessageState::from_wire(&body.state).map_err(|e| domain_error(&e))?;
    let snoozed_until = parse_deadline(body.snoozed_until.as_deref())?;
    let meta = unwrap_ask(
        mailbox
            .update_state(agent_id, body.message_id, state, snoozed_until)
            .await,
    )?;
    Ok(Json(state_json(body.message_id, agent_id, &meta)))
}

fn state_json(message_id: i64, agent_id: i64, meta: &RecipientMeta) -> serde_json::Value {
    serde_json::json!({
        "message_id": message_id,
        "agent_id": agent_id,
        "state": meta.state.wire(),
        "is_starred": meta.is_starred,
        "is_archived": meta.is_archived,
        "snoozed_until": meta.snoozed_until.map(epoch_to_rfc3339),
        "read_at": meta.read_at.map(epoch_to_rfc3339),
    })
}

#[get("/api/v1/threads/<thread_id>")]
pub fn get_thread(
    service: &State<Arc<MailService>>,
    thread_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let thread = unwrap_service(service.get_thread(thread_id))?;
    let messages: Vec<MessageDto> = thread
        .messages
        .iter()
        .map(|m| MessageDto::from_message(m, ""))
        .collect();
    Ok(Json(serde_json::json!({
        "thread_id": thread.thread_id,
        "messages": messages,
    })))
}

#[get("/api/v1/agents/<agent_id>/status")]
pub async fn agent_status(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
) -> Result<Json<AgentStatus>, ApiError> {
    let status = unwrap_ask(mailbox.get_status(agent_id).await)?;
    Ok(Json(status))
}

#[get("/api/v1/agents/<sender_id>/unacked/<recipient_id>")]
pub async fn has_unacked(
    mailbox: &State<MailboxHandle>,
    sender_id: i64,
    recipient_id: i64,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = unwrap_ask(mailbox.has_unacked_status_to(sender_id, recipient_id).await)?;
    Ok(Json(serde_json::json!({"has_unacked": value})))
}
