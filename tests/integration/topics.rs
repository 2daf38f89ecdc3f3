use crate::common::{create_topic, register_agent, subscribe, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_create_and_list_topics() {
    let client = test_client();
    register_agent(&client, "Alice"); // registration creates inbox:Alice
    create_topic(&client, "announcements");

    let res = client.get("/api/v1/topics").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let topics: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(topics.iter().any(|t| t["name"] == "announcements" && t["topic_type"] == "broadcast"));
    assert!(topics.iter().any(|t| t["name"] == "inbox:Alice" && t["topic_type"] == "inbox"));
}

#[test]
fn test_duplicate_topic_conflicts() {
    let client = test_client();
    create_topic(&client, "news");
    let res = client
        .post("/api/v1/topics")
        .header(ContentType::JSON)
        .body(r#"{"name": "news", "topic_type": "broadcast"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn test_inbox_prefix_is_reserved() {
    let client = test_client();
    let res = client
        .post("/api/v1/topics")
        .header(ContentType::JSON)
        .body(r#"{"name": "inbox:impostor", "topic_type": "broadcast"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_bad_topic_type_is_rejected() {
    let client = test_client();
    let res = client
        .post("/api/v1/topics")
        .header(ContentType::JSON)
        .body(r#"{"name": "weird", "topic_type": "multicast"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_subscribe_and_unsubscribe() {
    let client = test_client();
    let bob = register_agent(&client, "Bob");
    create_topic(&client, "news");
    subscribe(&client, bob, "news");

    // Subscribing twice is a no-op, not an error.
    subscribe(&client, bob, "news");

    let res = client
        .delete(format!("/api/v1/topics/news/subscribe?agent_id={bob}"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["removed"], true);

    let res = client
        .delete(format!("/api/v1/topics/news/subscribe?agent_id={bob}"))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["removed"], false);
}

#[test]
fn test_subscribe_unknown_topic() {
    let client = test_client();
    let bob = register_agent(&client, "Bob");
    let res = client
        .post("/api/v1/topics/void/subscribe")
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id": {bob}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_send_into_explicit_topic() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    create_topic(&client, "ops");
    subscribe(&client, bob, "ops");

    // No named recipients: the topic's subscribers receive it.
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "to": [],
                "subject": "pager",
                "body": "disk is full",
                "topic": "ops",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let messages = crate::common::inbox(&client, bob, 50);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["subject"], "pager");
}
