use crate::common::{register_agent, send, test_client};
use rocket::http::Status;

#[test]
fn test_global_search_finds_subject_and_body() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    register_agent(&client, "Bob");

    send(&client, alice, &["Bob"], "deploy failed", "the canary is unhappy");
    send(&client, alice, &["Bob"], "lunch", "tacos?");

    let res = client.get("/api/v1/search?q=canary").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["subject"], "deploy failed");

    let res = client.get("/api/v1/search?q=deploy").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 1);
}

#[test]
fn test_agent_scoped_search_sees_only_own_mail() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    let bob = register_agent(&client, "Bob");
    let carol = register_agent(&client, "Carol");

    send(&client, alice, &["Bob"], "secret plans", "for bob only");

    let res = client.get(format!("/api/v1/search?q=secret&agent_id={bob}")).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 1);

    let res = client.get(format!("/api/v1/search?q=secret&agent_id={carol}")).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 0);
}

#[test]
fn test_empty_query_returns_empty() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    register_agent(&client, "Bob");
    send(&client, alice, &["Bob"], "anything", "at all");

    let res = client.get("/api/v1/search?q=").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 0);
}

#[test]
fn test_search_respects_limit() {
    let client = test_client();
    let alice = register_agent(&client, "Alice");
    register_agent(&client, "Bob");
    for i in 0..5 {
        send(&client, alice, &["Bob"], &format!("beacon {i}"), "ping");
    }

    let res = client.get("/api/v1/search?q=beacon&limit=2").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 2);
}
