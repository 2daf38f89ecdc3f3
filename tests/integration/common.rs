use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;
use std::path::PathBuf;

/// Wrapper around Client that auto-deletes the temp data dir on drop.
/// Uses Option<Client> so the store connection is released (WAL mode holds
/// the file) before the directory is removed.
pub struct TestClient {
    client: Option<Client>,
    data_dir: PathBuf,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

pub fn test_client() -> TestClient {
    // Unique temp dir per test (avoids parallel test contention)
    let data_dir = PathBuf::from(format!(
        "/tmp/subtrate_test_{}",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    ));
    let rocket = subtrate::rocket_with_data_dir(&data_dir);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        data_dir,
    }
}

/// Helper: register an agent and return its ID.
pub fn register_agent(client: &Client, name: &str) -> i64 {
    let res = client
        .post("/api/v1/agents")
        .header(ContentType::JSON)
        .body(format!(r#"{{"name": "{name}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["id"].as_i64().unwrap()
}

/// Helper: direct send, returning (message_id, thread_id).
pub fn send(
    client: &Client,
    sender_id: i64,
    to: &[&str],
    subject: &str,
    body: &str,
) -> (i64, String) {
    let res = client
        .post("/api/v1/mail/send")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_id": sender_id,
                "to": to,
                "subject": subject,
                "body": body,
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let receipt: serde_json::Value = res.into_json().unwrap();
    (
        receipt["message_id"].as_i64().unwrap(),
        receipt["thread_id"].as_str().unwrap().to_string(),
    )
}

/// Helper: create a broadcast topic.
pub fn create_topic(client: &Client, name: &str) {
    let res = client
        .post("/api/v1/topics")
        .header(ContentType::JSON)
        .body(format!(r#"{{"name": "{name}", "topic_type": "broadcast"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

/// Helper: subscribe an agent to a topic.
pub fn subscribe(client: &Client, agent_id: i64, topic: &str) {
    let res = client
        .post(format!("/api/v1/topics/{topic}/subscribe"))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id": {agent_id}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

/// Helper: fetch an agent's inbox.
pub fn inbox(client: &Client, agent_id: i64, limit: i64) -> Vec<serde_json::Value> {
    let res = client
        .get(format!("/api/v1/agents/{agent_id}/inbox?limit={limit}"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    res.into_json().unwrap()
}
