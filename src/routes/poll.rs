use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::events::EventBus;
use crate::feed;
use crate::mail::MailService;
use crate::mail::actor::MailboxHandle;
use crate::models::PollResult;

use super::{ApiError, MessageDto, unwrap_ask, unwrap_service};

#[derive(Debug, Deserialize)]
pub struct OffsetCursorBody {
    pub topic_id: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct PollBody {
    #[serde(default)]
    pub since: Vec<OffsetCursorBody>,
}

fn poll_json(poll: &PollResult) -> serde_json::Value {
    let messages: Vec<MessageDto> = poll.messages.iter().map(MessageDto::from_envelope).collect();
    let mut offsets: Vec<serde_json::Value> = poll
        .offsets
        .iter()
        .map(|(&topic_id, &offset)| serde_json::json!({"topic_id": topic_id, "offset": offset}))
        .collect();
    offsets.sort_by_key(|v| v["topic_id"].as_i64());
    serde_json::json!({"messages": messages, "offsets": offsets})
}

#[post("/api/v1/agents/<agent_id>/poll", format = "json", data = "<body>")]
pub async fn poll_changes(
    mailbox: &State<MailboxHandle>,
    agent_id: i64,
    body: Json<PollBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since: HashMap<i64, i64> = body.since.iter().map(|c| (c.topic_id, c.offset)).collect();
    let poll = unwrap_ask(mailbox.poll_changes(agent_id, since).await)?;
    Ok(Json(poll_json(&poll)))
}

/// Blocking variant for hook scripts: parks until a message lands in one of
/// the agent's topics or the timeout elapses. With no explicit cursors the
/// stored consumer offsets are the baseline.
#[get("/api/v1/agents/<agent_id>/wait?<timeout_secs>")]
pub async fn wait_changes(
    service: &State<Arc<MailService>>,
    events: &State<Arc<EventBus>>,
    config: &State<Config>,
    agent_id: i64,
    timeout_secs: Option<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let wait = Duration::from_secs(timeout_secs.unwrap_or(30));
    let poll = unwrap_service(
        feed::wait_for_changes(
            service,
            events,
            agent_id,
            HashMap::new(),
            wait,
            config.long_poll_max,
        )
        .await,
    )?;
    Ok(Json(poll_json(&poll)))
}
