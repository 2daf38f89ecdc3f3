use crate::common::{create_topic, inbox, register_agent, subscribe, test_client};
use rocket::http::{ContentType, Status};

// Scenario: create `announcements`, subscribe Bob and Carol, Alice
// publishes, both see exactly one unread copy.

#[test]
fn test_publish_fans_out_to_subscribers() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let carol = register_agent(&client, "Carol");

    create_topic(&client, "announcements");
    subscribe(&client, bob, "announcements");
    subscribe(&client, carol, "announcements");

    let res = client
        .post("/api/v1/mail/publish")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "topic": "announcements",
                "subject": "release",
                "body": "v1 shipped",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let receipt: serde_json::Value = res.into_json().unwrap();
    assert_eq!(receipt["recipients_count"], 2);

    for agent in [bob, carol] {
        let messages = inbox(&client, agent, 50);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["subject"], "release");
        assert_eq!(messages[0]["state"], "STATE_UNREAD");
    }
    // The publisher is not a subscriber; nothing lands in Alice's inbox.
    assert!(inbox(&client, alice, 50).is_empty());
}

#[test]
fn test_publish_to_unknown_topic() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let res = client
        .post("/api/v1/mail/publish")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "topic": "void",
                "subject": "x",
                "body": "y",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_publish_without_subscribers() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    create_topic(&client, "quiet");
    let res = client
        .post("/api/v1/mail/publish")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "topic": "quiet",
                "subject": "anyone?",
                "body": "x",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let receipt: serde_json::Value = res.into_json().unwrap();
    assert_eq!(receipt["recipients_count"], 0);
}

#[test]
fn test_unsubscribed_agent_sees_nothing() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let dave = register_agent(&client, "Dave");

    create_topic(&client, "announcements");
    subscribe(&client, bob, "announcements");

    client
        .post("/api/v1/mail/publish")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": alice,
                "topic": "announcements",
                "subject": "release",
                "body": "x",
            })
            .to_string(),
        )
        .dispatch();

    assert_eq!(inbox(&client, bob, 50).len(), 1);
    assert!(inbox(&client, dave, 50).is_empty());
}
