// Live round trip through the framed binary protocol: bind an ephemeral
// listener, speak newline-delimited JSON frames over TCP, check wire-form
// enum spellings and i64 timestamps.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use subtrate::events::EventBus;
use subtrate::heartbeat::HeartbeatTracker;
use subtrate::identity::IdentityRegistry;
use subtrate::mail::{MailService, actor};
use subtrate::store::Store;
use subtrate::wire::{WireContext, serve_on};

async fn start_daemon(dir: &std::path::Path) -> std::net::SocketAddr {
    let store = Arc::new(Store::open(&dir.join("wire.db"), true).unwrap());
    let events = Arc::new(EventBus::new());
    let service = Arc::new(MailService::new(Arc::clone(&store), events));
    let registry = Arc::new(IdentityRegistry::new(Arc::clone(&store), dir.join("identity")));
    let tracker = Arc::new(HeartbeatTracker::new(store, 300, 1800));
    let mailbox = actor::spawn(Arc::clone(&service));

    let ctx = WireContext { mailbox, service, registry, tracker };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_on(ctx, listener));
    addr
}

async fn roundtrip(stream: &mut TcpStream, frame: serde_json::Value) -> serde_json::Value {
    let (read_half, mut write_half) = stream.split();
    let mut line = frame.to_string();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
async fn test_wire_send_and_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let alice = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "register_agent", "name": "Alice"}),
    )
    .await;
    assert_eq!(alice["kind"], "agent");
    let alice_id = alice["agent"]["id"].as_i64().unwrap();

    let bob = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "register_agent", "name": "Bob"}),
    )
    .await;
    let bob_id = bob["agent"]["id"].as_i64().unwrap();

    let receipt = roundtrip(
        &mut stream,
        serde_json::json!({
            "kind": "send",
            "sender_id": alice_id,
            "to": ["Bob"],
            "subject": "Hi",
            "body": "there",
            "priority": "PRIORITY_URGENT",
        }),
    )
    .await;
    assert_eq!(receipt["kind"], "send_receipt");
    assert!(receipt["message_id"].as_i64().unwrap() > 0);

    let inbox = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "fetch_inbox", "agent_id": bob_id}),
    )
    .await;
    assert_eq!(inbox["kind"], "inbox");
    let messages = inbox["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["priority"], "PRIORITY_URGENT");
    assert_eq!(messages[0]["state"], "STATE_UNREAD");
    // Binary boundary: 64-bit epoch seconds, not strings.
    assert!(messages[0]["created_at"].is_i64());
}

#[tokio::test]
async fn test_wire_domain_errors_are_frames() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let response = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "get_agent", "agent_id": 404}),
    )
    .await;
    assert_eq!(response["kind"], "error");
    assert_eq!(response["code"], "not_found");
}

#[tokio::test]
async fn test_wire_bad_frame() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (read_half, mut write_half) = stream.split();
    write_half.write_all(b"{\"kind\": \"quantum_post\"}\n").await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(value["kind"], "error");
    assert_eq!(value["code"], "bad_frame");
}

#[tokio::test]
async fn test_wire_poll_with_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_daemon(dir.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(&mut stream, serde_json::json!({"kind": "register_agent", "name": "Alice"})).await;
    let bob = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "register_agent", "name": "Bob"}),
    )
    .await;
    let bob_id = bob["agent"]["id"].as_i64().unwrap();

    roundtrip(
        &mut stream,
        serde_json::json!({"kind": "create_topic", "name": "news", "topic_type": "broadcast"}),
    )
    .await;
    roundtrip(
        &mut stream,
        serde_json::json!({"kind": "subscribe", "agent_id": bob_id, "topic": "news"}),
    )
    .await;

    let alice = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "get_agent", "agent_id": 1}),
    )
    .await;
    let alice_id = alice["agent"]["id"].as_i64().unwrap();
    roundtrip(
        &mut stream,
        serde_json::json!({
            "kind": "publish",
            "sender_id": alice_id,
            "topic": "news",
            "subject": "release",
            "body": "v1",
        }),
    )
    .await;

    let changes = roundtrip(
        &mut stream,
        serde_json::json!({"kind": "poll_changes", "agent_id": bob_id, "since": []}),
    )
    .await;
    assert_eq!(changes["kind"], "changes");
    assert_eq!(changes["messages"].as_array().unwrap().len(), 1);
    let offsets = changes["offsets"].as_array().unwrap();
    assert!(offsets.iter().any(|c| c["offset"].as_i64().unwrap() == 1));
}
