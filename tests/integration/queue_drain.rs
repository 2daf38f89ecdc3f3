// Offline queue drain, end to end against the in-process (direct) client.
// The daemon-down half is the queue itself: ops persist with v7 keys and
// survive until a connected mode replays them.

use subtrate::client::{ClientMode, DirectClient, drain_queue};
use subtrate::config::Config;
use subtrate::queue::{OfflineQueue, OpKind, queue_path};

fn fixture() -> (DirectClient, OfflineQueue, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_data_dir(dir.path().join("daemon"));
    let direct = DirectClient::open(&config).unwrap();

    let project_root = dir.path().join("project");
    std::fs::create_dir_all(&project_root).unwrap();
    let queue = OfflineQueue::open(&queue_path(&project_root)).unwrap();
    (direct, queue, dir)
}

#[test]
fn test_offline_send_drains_on_reconnect() {
    let (direct, queue, _dir) = fixture();
    direct.registry.register_agent(Some("Alice"), None, None).unwrap().unwrap();
    let bob = direct.registry.register_agent(Some("Bob"), None, None).unwrap().unwrap();

    // Daemon "down": the CLI enqueues instead of sending.
    let op = queue
        .enqueue(
            OpKind::Send,
            serde_json::json!({"to": ["Bob"], "subject": "later", "body": "queued while down"}),
            "Alice",
            Some("sess-cli"),
            None,
        )
        .unwrap();
    assert_eq!(uuid::Uuid::parse_str(&op.id).unwrap().get_version_num(), 7);
    assert_eq!(queue.pending_count().unwrap(), 1);

    // Daemon "up": any CLI command drains first.
    let mode = ClientMode::Direct(direct);
    let report = drain_queue(&queue, &mode).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);

    let ClientMode::Direct(direct) = mode else { unreachable!() };
    let messages = direct.service.fetch_inbox(bob.id, 50, false, false).unwrap().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.subject, "later");
}

#[test]
fn test_same_key_replay_produces_no_duplicate() {
    let (direct, queue, _dir) = fixture();
    direct.registry.register_agent(Some("Alice"), None, None).unwrap().unwrap();
    let bob = direct.registry.register_agent(Some("Bob"), None, None).unwrap().unwrap();

    let op = queue
        .enqueue(
            OpKind::Send,
            serde_json::json!({"to": ["Bob"], "subject": "later", "body": "x"}),
            "Alice",
            None,
            None,
        )
        .unwrap();

    let mode = ClientMode::Direct(direct);
    drain_queue(&queue, &mode).unwrap();

    // Crash between deliver and mark_delivered: the op comes back on the
    // next drain and replays with the same key.
    queue.mark_failed(&op.id, "simulated crash before ack").unwrap();
    let report = drain_queue(&queue, &mode).unwrap();
    assert_eq!(report.delivered, 1);

    let ClientMode::Direct(direct) = mode else { unreachable!() };
    let messages = direct.service.fetch_inbox(bob.id, 50, false, false).unwrap().unwrap();
    assert_eq!(messages.len(), 1);
}

#[test]
fn test_heartbeat_ops_replay() {
    let (direct, queue, _dir) = fixture();
    let alice = direct.registry.register_agent(Some("Alice"), None, None).unwrap().unwrap();
    let before = alice.last_active_at;

    std::thread::sleep(std::time::Duration::from_millis(1100));
    queue
        .enqueue(OpKind::Heartbeat, serde_json::json!({}), "Alice", Some("sess-1"), None)
        .unwrap();

    let mode = ClientMode::Direct(direct);
    let report = drain_queue(&queue, &mode).unwrap();
    assert_eq!(report.delivered, 1);

    let ClientMode::Direct(direct) = mode else { unreachable!() };
    let after = direct.registry.get_agent(alice.id).unwrap().unwrap().last_active_at;
    assert!(after > before);
}

#[test]
fn test_expired_ops_are_purged_not_delivered() {
    let (direct, queue, _dir) = fixture();
    direct.registry.register_agent(Some("Alice"), None, None).unwrap().unwrap();
    direct.registry.register_agent(Some("Bob"), None, None).unwrap().unwrap();

    queue
        .enqueue(
            OpKind::Send,
            serde_json::json!({"to": ["Bob"], "subject": "stale", "body": "x"}),
            "Alice",
            None,
            Some(-5), // already expired
        )
        .unwrap();

    let mode = ClientMode::Direct(direct);
    let report = drain_queue(&queue, &mode).unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(report.delivered, 0);
}

#[test]
fn test_queue_only_mode_leaves_ops_pending() {
    let (_direct, queue, _dir) = fixture();
    queue
        .enqueue(OpKind::Heartbeat, serde_json::json!({}), "Alice", None, None)
        .unwrap();
    let report = drain_queue(&queue, &ClientMode::QueueOnly).unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(queue.pending_count().unwrap(), 1);
}
