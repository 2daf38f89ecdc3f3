use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use serde::Deserialize;
use std::sync::Arc;

use crate::heartbeat::HeartbeatTracker;
use crate::identity::IdentityRegistry;
use crate::models::epoch_to_rfc3339;

use super::{AgentDto, ApiError, domain_error, unwrap_service};

#[derive(Debug, Deserialize)]
pub struct RegisterAgent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

#[post("/api/v1/agents", format = "json", data = "<body>")]
pub fn register_agent(
    registry: &State<Arc<IdentityRegistry>>,
    body: Json<RegisterAgent>,
) -> Result<Json<AgentDto>, ApiError> {
    let agent = unwrap_service(registry.register_agent(
        body.name.as_deref(),
        body.project_key.as_deref(),
        body.git_branch.as_deref(),
    ))?;
    Ok(Json(AgentDto::new(&agent, None)))
}

#[get("/api/v1/agents")]
pub fn list_agents(
    registry: &State<Arc<IdentityRegistry>>,
    tracker: &State<Arc<HeartbeatTracker>>,
) -> Result<Json<Vec<AgentDto>>, ApiError> {
    let now = crate::models::now_epoch();
    let agents = registry
        .list_agents()
        .map_err(|e| super::storage_error(&e))?;
    Ok(Json(
        agents
            .iter()
            .map(|agent| {
                let liveness = tracker.status_at(agent.id, agent.last_active_at, now);
                AgentDto::new(agent, Some(liveness))
            })
            .collect(),
    ))
}

#[get("/api/v1/agents/<agent_id>")]
pub fn get_agent(
    registry: &State<Arc<IdentityRegistry>>,
    tracker: &State<Arc<HeartbeatTracker>>,
    agent_id: i64,
) -> Result<Json<AgentDto>, ApiError> {
    let agent = unwrap_service(registry.get_agent(agent_id))?;
    let liveness = tracker.status_at(agent.id, agent.last_active_at, crate::models::now_epoch());
    Ok(Json(AgentDto::new(&agent, Some(liveness))))
}

#[delete("/api/v1/agents/<agent_id>")]
pub fn delete_agent(
    registry: &State<Arc<IdentityRegistry>>,
    agent_id: i64,
) -> Result<Json<serde_json::Value>, ApiError> {
    unwrap_service(registry.delete_agent(agent_id))?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub agent_id: Option<i64>,
    /// Name-addressed form used by queued-op replay.
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[post("/api/v1/agents/<agent_id>/heartbeat", format = "json", data = "<body>")]
pub fn heartbeat(
    tracker: &State<Arc<HeartbeatTracker>>,
    agent_id: i64,
    body: Json<HeartbeatBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let at = unwrap_service(tracker.heartbeat(agent_id, body.session_id.as_deref()))?;
    let liveness = unwrap_service(tracker.status_of(agent_id))?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "last_active_at": epoch_to_rfc3339(at),
        "liveness": liveness.as_str(),
    })))
}

#[post("/api/v1/heartbeat", format = "json", data = "<body>")]
pub fn heartbeat_by_name(
    registry: &State<Arc<IdentityRegistry>>,
    tracker: &State<Arc<HeartbeatTracker>>,
    body: Json<HeartbeatBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent_id = match (body.agent_id, body.sender.as_deref()) {
        (Some(id), _) => id,
        (None, Some(name)) => unwrap_service(registry.get_agent_by_name(name))?.id,
        (None, None) => {
            return Err(domain_error(&crate::error::MailError::InvalidArgument(
                "agent_id or sender is required".into(),
            )));
        }
    };
    let at = unwrap_service(tracker.heartbeat(agent_id, body.session_id.as_deref()))?;
    let liveness = unwrap_service(tracker.status_of(agent_id))?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "last_active_at": epoch_to_rfc3339(at),
        "liveness": liveness.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct EnsureIdentity {
    pub session_id: String,
    #[serde(default)]
    pub project_dir: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

#[post("/api/v1/identity/ensure", format = "json", data = "<body>")]
pub fn ensure_identity(
    registry: &State<Arc<IdentityRegistry>>,
    body: Json<EnsureIdentity>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (agent, source) = unwrap_service(registry.ensure_identity(
        &body.session_id,
        body.project_dir.as_deref(),
        body.git_branch.as_deref(),
    ))?;
    Ok(Json(serde_json::json!({
        "agent": AgentDto::new(&agent, None),
        "source": source.as_str(),
        "session_id": body.session_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StartSession {
    pub session_id: String,
}

#[post("/api/v1/agents/<agent_id>/session", format = "json", data = "<body>")]
pub fn start_session(
    registry: &State<Arc<IdentityRegistry>>,
    tracker: &State<Arc<HeartbeatTracker>>,
    agent_id: i64,
    body: Json<StartSession>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Unknown agents must not linger in the active-session map.
    unwrap_service(registry.get_agent(agent_id))?;
    tracker.start_session(agent_id, &body.session_id);
    Ok(Json(serde_json::json!({"agent_id": agent_id, "in_session": true})))
}

#[delete("/api/v1/agents/<agent_id>/session")]
pub fn end_session(
    tracker: &State<Arc<HeartbeatTracker>>,
    agent_id: i64,
) -> Json<serde_json::Value> {
    let was_active = tracker.end_session(agent_id);
    Json(serde_json::json!({"agent_id": agent_id, "in_session": false, "was_active": was_active}))
}
