use rocket::serde::json::Json;
use rocket::{State, get};
use std::sync::Arc;

use crate::mail::MailService;
use crate::models::epoch_to_rfc3339;

use super::{ApiError, unwrap_service};

#[get("/api/v1/search?<q>&<agent_id>&<limit>")]
pub fn search_messages(
    service: &State<Arc<MailService>>,
    q: &str,
    agent_id: Option<i64>,
    limit: Option<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hits = unwrap_service(service.search(agent_id, q, limit.unwrap_or(50)))?;
    let results: Vec<serde_json::Value> = hits
        .iter()
        .map(|h| {
            serde_json::json!({
                "message_id": h.message_id,
                "topic_id": h.topic_id,
                "sender_id": h.sender_id,
                "sender_name": h.sender_name,
                "subject": h.subject,
                "body": h.body,
                "created_at": epoch_to_rfc3339(h.created_at),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "results": results,
        "count": results.len(),
        "query": q,
    })))
}
