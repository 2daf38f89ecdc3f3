use crate::common::test_client;
use rocket::http::{ContentType, Status};

// --- Health ---

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/api/v1/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
}

// --- Stats ---

#[test]
fn test_stats_empty_daemon() {
    let client = test_client();
    let res = client.get("/api/v1/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agents"], 0);
    assert_eq!(body["messages"], 0);
}

// --- Smoke: the register -> send -> fetch -> read loop ---

#[test]
fn test_smoke_mail_loop() {
    let client = test_client();

    let alice: serde_json::Value = client
        .post("/api/v1/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Alice"}"#)
        .dispatch()
        .into_json()
        .unwrap();
    let bob: serde_json::Value = client
        .post("/api/v1/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Bob"}"#)
        .dispatch()
        .into_json()
        .unwrap();
    let alice_id = alice["id"].as_i64().unwrap();
    let bob_id = bob["id"].as_i64().unwrap();

    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice_id,
                "to": ["Bob"],
                "subject": "Hi",
                "body": "there",
                "priority": "PRIORITY_NORMAL",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let receipt: serde_json::Value = res.into_json().unwrap();
    let message_id = receipt["message_id"].as_i64().unwrap();

    let inbox: Vec<serde_json::Value> = client
        .get(format!("/api/v1/agents/{bob_id}/inbox?limit=50"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0]["subject"], "Hi");
    assert_eq!(inbox[0]["state"], "STATE_UNREAD");

    let read: serde_json::Value = client
        .get(format!("/api/v1/agents/{bob_id}/messages/{message_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(read["state"], "STATE_READ");
}
