use tokio::sync::broadcast;

use crate::models::{MessageState, Priority};

/// Side effects broadcast after a mail transaction commits. Drives the SSE
/// push channel and wakes parked long-poll waiters.
#[derive(Debug, Clone)]
pub enum MailEvent {
    NewMessage {
        message_id: i64,
        topic_id: i64,
        log_offset: i64,
        thread_id: String,
        sender_id: i64,
        sender_name: String,
        subject: String,
        priority: Priority,
        recipient_ids: Vec<i64>,
        created_at: i64,
    },
    StateChanged {
        message_id: i64,
        agent_id: i64,
        state: MessageState,
    },
}

pub struct EventBus {
    pub sender: broadcast::Sender<MailEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: MailEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailEvent> {
        self.sender.subscribe()
    }
}
