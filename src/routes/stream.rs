use rocket::response::stream::{Event, EventStream};
use rocket::{State, get};
use std::sync::Arc;
use tokio::time::{Duration, interval};

use crate::events::{EventBus, MailEvent};
use crate::models::epoch_to_rfc3339;

/// Server push channel for UI clients: `new_message` and `state_changed`
/// events scoped to one agent, with a periodic heartbeat to keep proxies
/// from reaping the connection.
#[get("/api/v1/stream?<agent_id>")]
pub fn event_stream(events: &State<Arc<EventBus>>, agent_id: i64) -> EventStream![] {
    let mut rx = events.subscribe();

    EventStream! {
        let mut heartbeat = interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(MailEvent::NewMessage {
                            message_id, topic_id, log_offset, ref thread_id, sender_id,
                            ref sender_name, ref subject, priority, ref recipient_ids, created_at,
                        }) if recipient_ids.contains(&agent_id) => {
                            yield Event::json(&serde_json::json!({
                                "message_id": message_id,
                                "topic_id": topic_id,
                                "log_offset": log_offset,
                                "thread_id": thread_id,
                                "sender_id": sender_id,
                                "sender_name": sender_name,
                                "subject": subject,
                                "priority": priority.wire(),
                                "created_at": epoch_to_rfc3339(created_at),
                            })).event("new_message");
                        }
                        Ok(MailEvent::StateChanged { message_id, agent_id: owner, state })
                            if owner == agent_id =>
                        {
                            yield Event::json(&serde_json::json!({
                                "message_id": message_id,
                                "agent_id": owner,
                                "state": state.wire(),
                            })).event("state_changed");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        _ => {} // other agent's traffic, or lagged
                    }
                }
                _ = heartbeat.tick() => {
                    yield Event::json(&serde_json::json!({
                        "time": epoch_to_rfc3339(crate::models::now_epoch()),
                    })).event("heartbeat");
                }
            }
        }
    }
}
