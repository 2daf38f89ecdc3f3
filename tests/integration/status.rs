use crate::common::{register_agent, send, test_client};
use rocket::http::{ContentType, Status};
use std::sync::Arc;

// Scenario: heartbeat -> active, start session -> busy, end session ->
// active, silence -> idle -> offline. The HTTP tests cover the live half;
// the clock-driven half walks thresholds through the tracker directly.

#[test]
fn test_session_flips_active_to_busy_and_back() {
    let client = test_client();
    let agent = register_agent(&client, "Dora");

    client
        .post(format!("/api/v1/agents/{agent}/heartbeat"))
        .header(ContentType::JSON)
        .body(r#"{}"#)
        .dispatch();
    let body: serde_json::Value = client
        .get(format!("/api/v1/agents/{agent}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body["liveness"], "active");

    let res = client
        .post(format!("/api/v1/agents/{agent}/session"))
        .header(ContentType::JSON)
        .body(r#"{"session_id": "sess-d"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = client
        .get(format!("/api/v1/agents/{agent}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body["liveness"], "busy");

    client.delete(format!("/api/v1/agents/{agent}/session")).dispatch();
    let body: serde_json::Value = client
        .get(format!("/api/v1/agents/{agent}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body["liveness"], "active");
}

#[test]
fn test_silence_walks_active_idle_offline() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(subtrate::store::Store::open(&dir.path().join("status.db"), true).unwrap());
    let tracker = subtrate::heartbeat::HeartbeatTracker::new(store, 300, 1800);

    let last = 100_000;
    use subtrate::models::Liveness;
    assert_eq!(tracker.status_at(1, last, last + 60), Liveness::Active);
    tracker.start_session(1, "sess-1");
    assert_eq!(tracker.status_at(1, last, last + 60), Liveness::Busy);
    tracker.end_session(1);
    assert_eq!(tracker.status_at(1, last, last + 60), Liveness::Active);
    // Advance past the active threshold: idle regardless of sessions.
    assert_eq!(tracker.status_at(1, last, last + 301), Liveness::Idle);
    // Advance past the offline threshold.
    assert_eq!(tracker.status_at(1, last, last + 1801), Liveness::Offline);
}

#[test]
fn test_mail_status_counts() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    send(&client, alice, &["Bob"], "one", "x");
    send(&client, alice, &["Bob"], "two", "y");
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "to": ["Bob"],
                "subject": "fire",
                "body": "now",
                "priority": "PRIORITY_URGENT",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let status: serde_json::Value = client
        .get(format!("/api/v1/agents/{bob}/status"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["agent_name"], "Bob");
    assert_eq!(status["unread"], 3);
    assert_eq!(status["urgent"], 1);
    assert_eq!(status["starred"], 0);
    assert_eq!(status["snoozed"], 0);
}

#[test]
fn test_status_tracks_star_and_snooze() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (starred, _) = send(&client, alice, &["Bob"], "star", "x");
    let (snoozed, _) = send(&client, alice, &["Bob"], "later", "y");

    client
        .post(format!("/api/v1/agents/{bob}/messages/{starred}/state"))
        .header(ContentType::JSON)
        .body(r#"{"state": "STATE_STARRED"}"#)
        .dispatch();
    let until = (chrono::Utc::now() + chrono::Duration::hours(4)).to_rfc3339();
    client
        .post(format!("/api/v1/agents/{bob}/messages/{snoozed}/state"))
        .header(ContentType::JSON)
        .body(serde_json::json!({"state": "STATE_SNOOZED", "snoozed_until": until}).to_string())
        .dispatch();

    let status: serde_json::Value = client
        .get(format!("/api/v1/agents/{bob}/status"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(status["unread"], 0);
    assert_eq!(status["starred"], 1);
    assert_eq!(status["snoozed"], 1);
}

#[test]
fn test_status_unknown_agent() {
    let client = test_client();
    let res = client.get("/api/v1/agents/404/status").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
