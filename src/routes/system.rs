use rocket::serde::json::Json;
use rocket::{State, catch, get};
use std::sync::Arc;

use crate::store::Store;

use super::ApiError;

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[get("/api/v1/stats")]
pub fn stats(store: &State<Arc<Store>>) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = store.conn();
    let count = |sql: &str| -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap_or(0)
    };
    // Same effectively-unread accounting as the per-agent status endpoint:
    // a snoozed row past its wake time counts as unread.
    let now = crate::models::now_epoch();
    let unread_total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM message_recipients
             WHERE state = 'unread' OR (state = 'snoozed' AND snoozed_until <= ?1)",
            rusqlite::params![now],
            |r| r.get(0),
        )
        .unwrap_or(0);
    Ok(Json(serde_json::json!({
        "agents": count("SELECT COUNT(*) FROM agents"),
        "topics": count("SELECT COUNT(*) FROM topics"),
        "messages": count("SELECT COUNT(*) FROM messages"),
        "unread_total": unread_total,
        "sessions": count("SELECT COUNT(*) FROM sessions"),
    })))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}

#[catch(422)]
pub fn unprocessable() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Malformed request body"}))
}

#[catch(500)]
pub fn internal_error() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Internal server error"}))
}
