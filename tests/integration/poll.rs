use crate::common::{create_topic, register_agent, subscribe, test_client};
use rocket::http::{ContentType, Status};

fn publish(client: &rocket::local::blocking::Client, sender: i64, topic: &str, subject: &str) {
    let res = client
        .post("/api/v1/mail/publish")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": sender,
                "topic": topic,
                "subject": subject,
                "body": "x",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

fn poll(
    client: &rocket::local::blocking::Client,
    agent: i64,
    since: serde_json::Value,
) -> serde_json::Value {
    let res = client
        .post(format!("/api/v1/agents/{agent}/poll"))
        .header(ContentType::JSON)
        .body(serde_json::json!({ "since": since }).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    res.into_json().unwrap()
}

fn topic_id(client: &rocket::local::blocking::Client, name: &str) -> i64 {
    let topics: Vec<serde_json::Value> =
        client.get("/api/v1/topics").dispatch().into_json().unwrap();
    topics
        .iter()
        .find(|t| t["name"] == name)
        .unwrap()["id"]
        .as_i64()
        .unwrap()
}

// Scenario: Bob subscribes to news, Alice publishes three messages, Bob's
// poll returns all three ascending and {news: 3}; the next poll is empty.

#[test]
fn test_poll_changes_returns_delta_and_offsets() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    create_topic(&client, "news");
    subscribe(&client, bob, "news");
    let news = topic_id(&client, "news");

    for subject in ["one", "two", "three"] {
        publish(&client, alice, "news", subject);
    }

    let body = poll(&client, bob, serde_json::json!([{"topic_id": news, "offset": 0}]));
    let messages = body["messages"].as_array().unwrap();
    let news_messages: Vec<&serde_json::Value> = messages
        .iter()
        .filter(|m| m["topic_id"].as_i64().unwrap() == news)
        .collect();
    assert_eq!(news_messages.len(), 3);
    let offsets: Vec<i64> = news_messages
        .iter()
        .map(|m| m["log_offset"].as_i64().unwrap())
        .collect();
    assert_eq!(offsets, vec![1, 2, 3]);

    let news_cursor = body["offsets"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["topic_id"].as_i64().unwrap() == news)
        .unwrap();
    assert_eq!(news_cursor["offset"], 3);

    // Second poll from the returned head: empty, same offset.
    let body = poll(&client, bob, serde_json::json!([{"topic_id": news, "offset": 3}]));
    let news_messages: Vec<&serde_json::Value> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["topic_id"].as_i64().unwrap() == news)
        .collect();
    assert!(news_messages.is_empty());
    let news_cursor = body["offsets"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["topic_id"].as_i64().unwrap() == news)
        .unwrap();
    assert_eq!(news_cursor["offset"], 3);
}

#[test]
fn test_poll_ahead_of_head_is_empty() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    create_topic(&client, "news");
    subscribe(&client, bob, "news");
    let news = topic_id(&client, "news");
    publish(&client, alice, "news", "only");

    let body = poll(&client, bob, serde_json::json!([{"topic_id": news, "offset": 99}]));
    let news_messages: Vec<&serde_json::Value> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["topic_id"].as_i64().unwrap() == news)
        .collect();
    assert!(news_messages.is_empty());
}

#[test]
fn test_poll_includes_inbox_without_explicit_cursor() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    crate::common::send(&client, alice, &["Bob"], "direct", "hello");

    let body = poll(&client, bob, serde_json::json!([]));
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["subject"], "direct");

    // The consumer offset advanced; polling again with no cursors is empty.
    let body = poll(&client, bob, serde_json::json!([]));
    assert!(body["messages"].as_array().unwrap().is_empty());
}

#[test]
fn test_offsets_never_move_backward() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    create_topic(&client, "news");
    subscribe(&client, bob, "news");
    let news = topic_id(&client, "news");

    for subject in ["a", "b"] {
        publish(&client, alice, "news", subject);
    }
    poll(&client, bob, serde_json::json!([{"topic_id": news, "offset": 0}]));

    // Re-polling from 0 re-reads history but the stored cursor stays at 2.
    poll(&client, bob, serde_json::json!([{"topic_id": news, "offset": 0}]));
    let body = poll(&client, bob, serde_json::json!([]));
    let news_messages: Vec<&serde_json::Value> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["topic_id"].as_i64().unwrap() == news)
        .collect();
    assert!(news_messages.is_empty());
}

#[test]
fn test_wait_deadline_returns_empty() {
    let client = test_client();
    let bob = register_agent(&client, "Bob");
    let res = client
        .get(format!("/api/v1/agents/{bob}/wait?timeout_secs=1"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["messages"].as_array().unwrap().is_empty());
}
