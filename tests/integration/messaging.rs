use crate::common::{inbox, register_agent, send, test_client};
use rocket::http::{ContentType, Status};

// Scenario: register Alice and Bob, Alice sends, Bob fetches, reads,
// re-fetches.

#[test]
fn test_create_send_fetch_read() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    let (message_id, _thread) = send(&client, alice, &["Bob"], "Hi", "there");

    let messages = inbox(&client, bob, 50);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["state"], "STATE_UNREAD");
    assert_eq!(messages[0]["subject"], "Hi");
    assert_eq!(messages[0]["sender_id"].as_i64().unwrap(), alice);

    // Read transitions unread -> read and sets read_at.
    let res = client
        .get(format!("/api/v1/agents/{bob}/messages/{message_id}"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let read: serde_json::Value = res.into_json().unwrap();
    assert_eq!(read["body"], "there");
    assert_eq!(read["state"], "STATE_READ");
    assert!(read["read_at"].is_string());

    let messages = inbox(&client, bob, 50);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["state"], "STATE_READ");
    assert_eq!(messages[0]["id"].as_i64().unwrap(), message_id);
}

#[test]
fn test_read_twice_is_stable() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (message_id, _) = send(&client, alice, &["Bob"], "Hi", "x");

    let first: serde_json::Value = client
        .get(format!("/api/v1/agents/{bob}/messages/{message_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    let second: serde_json::Value = client
        .get(format!("/api/v1/agents/{bob}/messages/{message_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(first["state"], "STATE_READ");
    assert_eq!(second["state"], "STATE_READ");
    assert_eq!(first["read_at"], second["read_at"]);
}

#[test]
fn test_ack_is_idempotent() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (message_id, _) = send(&client, alice, &["Bob"], "ping", "status?");

    let res = client
        .post(format!("/api/v1/agents/{bob}/messages/{message_id}/ack"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let first: serde_json::Value = res.into_json().unwrap();

    let res = client
        .post(format!("/api/v1/agents/{bob}/messages/{message_id}/ack"))
        .dispatch();
    let second: serde_json::Value = res.into_json().unwrap();
    assert_eq!(first["acknowledged_at"], second["acknowledged_at"]);
}

#[test]
fn test_has_unacked_flips_on_ack() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (message_id, _) = send(&client, alice, &["Bob"], "status", "update");

    let body: serde_json::Value = client
        .get(format!("/api/v1/agents/{alice}/unacked/{bob}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body["has_unacked"], true);

    client
        .post(format!("/api/v1/agents/{bob}/messages/{message_id}/ack"))
        .dispatch();

    let body: serde_json::Value = client
        .get(format!("/api/v1/agents/{alice}/unacked/{bob}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(body["has_unacked"], false);
}

#[test]
fn test_send_to_unknown_recipient() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "to": ["Nobody"],
                "subject": "void",
                "body": "x",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_inbox_orders_by_priority_then_recency() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    for (subject, priority) in [
        ("first-low", "PRIORITY_LOW"),
        ("then-normal", "PRIORITY_NORMAL"),
        ("then-urgent", "PRIORITY_URGENT"),
        ("late-normal", "PRIORITY_NORMAL"),
    ] {
        let res = client
            .post("/api/v1/mail/send")
            .header(ContentType::JSON)
            .body(
                serde_json::json!({
                    "sender_id": alice,
                    "to": ["Bob"],
                    "subject": subject,
                    "body": "x",
                    "priority": priority,
                })
                .to_string(),
            )
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }

    let messages = inbox(&client, bob, 50);
    let subjects: Vec<&str> = messages.iter().map(|m| m["subject"].as_str().unwrap()).collect();
    assert_eq!(subjects[0], "then-urgent");
    assert_eq!(subjects[3], "first-low");
    // Within the same priority, newest first.
    let normal_pos_late = subjects.iter().position(|s| *s == "late-normal").unwrap();
    let normal_pos_early = subjects.iter().position(|s| *s == "then-normal").unwrap();
    assert!(normal_pos_late < normal_pos_early);
}

#[test]
fn test_unread_only_filter() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (read_id, _) = send(&client, alice, &["Bob"], "seen", "x");
    send(&client, alice, &["Bob"], "fresh", "y");

    client
        .get(format!("/api/v1/agents/{bob}/messages/{read_id}"))
        .dispatch();

    let res = client
        .get(format!("/api/v1/agents/{bob}/inbox?limit=50&unread_only=true"))
        .dispatch();
    let messages: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["subject"], "fresh");
}

#[test]
fn test_multi_recipient_fan_out() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let carol = register_agent(&client, "Carol");

    send(&client, alice, &["Bob", "Carol"], "all hands", "meeting");

    assert_eq!(inbox(&client, bob, 50).len(), 1);
    assert_eq!(inbox(&client, carol, 50).len(), 1);
}

#[test]
fn test_deadline_in_past_is_rejected() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    register_agent(&client, "Bob");
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "to": ["Bob"],
                "subject": "late",
                "body": "x",
                "deadline": "2020-01-01T00:00:00Z",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_attachments_round_trip_base64() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    use base64::Engine;
    let blob = base64::engine::general_purpose::STANDARD.encode(b"tarball-bytes");
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "to": ["Bob"],
                "subject": "artifact",
                "body": "attached",
                "attachments": blob,
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let messages = inbox(&client, bob, 50);
    assert_eq!(messages[0]["attachments"].as_str().unwrap(), blob);
}
