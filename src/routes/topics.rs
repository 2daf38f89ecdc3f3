use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use serde::Deserialize;
use std::sync::Arc;

use crate::mail::MailService;
use crate::models::TopicType;

use super::{ApiError, TopicDto, domain_error, unwrap_service};

#[derive(Debug, Deserialize)]
pub struct CreateTopic {
    pub name: String,
    #[serde(default = "default_topic_type")]
    pub topic_type: String,
    #[serde(default)]
    pub retention_secs: Option<i64>,
}

fn default_topic_type() -> String {
    "broadcast".to_string()
}

#[post("/api/v1/topics", format = "json", data = "<body>")]
pub fn create_topic(
    service: &State<Arc<MailService>>,
    body: Json<CreateTopic>,
) -> Result<Json<TopicDto>, ApiError> {
    let topic_type = TopicType::parse(&body.topic_type).map_err(|e| domain_error(&e))?;
    let topic = unwrap_service(service.create_topic(&body.name, topic_type, body.retention_secs))?;
    Ok(Json(TopicDto::new(&topic)))
}

#[get("/api/v1/topics")]
pub fn list_topics(service: &State<Arc<MailService>>) -> Result<Json<Vec<TopicDto>>, ApiError> {
    let topics = unwrap_service(service.list_topics())?;
    Ok(Json(topics.iter().map(TopicDto::new).collect()))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    pub agent_id: i64,
}

#[post("/api/v1/topics/<topic_name>/subscribe", format = "json", data = "<body>")]
pub fn subscribe_topic(
    service: &State<Arc<MailService>>,
    topic_name: &str,
    body: Json<SubscribeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = unwrap_service(service.subscribe(body.agent_id, topic_name))?;
    Ok(Json(serde_json::json!({
        "agent_id": sub.agent_id,
        "topic_id": sub.topic_id,
        "subscribed": true,
    })))
}

#[delete("/api/v1/topics/<topic_name>/subscribe?<agent_id>")]
pub fn unsubscribe_topic(
    service: &State<Arc<MailService>>,
    topic_name: &str,
    agent_id: i64,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = unwrap_service(service.unsubscribe(agent_id, topic_name))?;
    Ok(Json(serde_json::json!({"removed": removed})))
}
