use crate::common::{register_agent, send, test_client};
use rocket::http::{ContentType, Status};

// Scenario: Alice sends to Bob, Bob replies on the thread token, the thread
// view returns both ordered by log offset.

#[test]
fn test_reply_inherits_thread() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");

    let (_first_id, thread) = send(&client, alice, &["Bob"], "Hi", "there");

    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": bob,
                "to": ["Alice"],
                "subject": "Re: Hi",
                "body": "hello back",
                "thread_id": thread,
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let reply: serde_json::Value = res.into_json().unwrap();
    assert_eq!(reply["thread_id"].as_str().unwrap(), thread);

    let res = client.get(format!("/api/v1/threads/{thread}")).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let view: serde_json::Value = res.into_json().unwrap();
    let messages = view["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["subject"], "Hi");
    assert_eq!(messages[1]["subject"], "Re: Hi");
    // Ascending log offsets.
    let offsets: Vec<i64> = messages
        .iter()
        .map(|m| m["log_offset"].as_i64().unwrap())
        .collect();
    let mut sorted = offsets.clone();
    sorted.sort();
    assert_eq!(offsets, sorted);
}

#[test]
fn test_every_thread_member_shares_the_token() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let (_, thread) = send(&client, alice, &["Bob"], "root", "x");

    for i in 0..3 {
        let res = client
            .post("/api/v1/mail/send")
            .header(ContentType::JSON)
            .body(
                serde_json::json!({
                    "sender_id": bob,
                    "to": ["Alice"],
                    "subject": format!("reply {i}"),
                    "body": "x",
                    "thread_id": thread,
                })
                .to_string(),
            )
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let receipt: serde_json::Value = res.into_json().unwrap();
        assert_eq!(receipt["thread_id"].as_str().unwrap(), thread);
    }

    let view: serde_json::Value = client
        .get(format!("/api/v1/threads/{thread}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(view["messages"].as_array().unwrap().len(), 4);
}

#[test]
fn test_reply_to_unknown_thread() {
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
                "subject": "ghost reply",
                "body": "x",
                "thread_id": "no-such-thread",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_thread_view_unknown_token() {
    let client = test_client();
    let res = client.get("/api/v1/threads/missing").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_fresh_sends_get_distinct_threads() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    register_agent(&client, "Bob");
    let (_, t1) = send(&client, alice, &["Bob"], "one", "x");
    let (_, t2) = send(&client, alice, &["Bob"], "two", "y");
    assert_ne!(t1, t2);
}
