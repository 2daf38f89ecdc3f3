//! Blocking change feed for hook scripts: park until a message lands in one
//! of the agent's subscribed topics (or its inbox), or a deadline passes.
//!
//! There are no per-waiter background tasks. Each waiter holds a broadcast
//! receiver; every committed fan-out is one broadcast, and only waiters
//! whose topic set intersects the event re-run the change query.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};

use crate::error::ServiceResult;
use crate::events::{EventBus, MailEvent};
use crate::mail::MailService;
use crate::models::PollResult;

/// Long-poll for changes since `since`. Returns as soon as the poll query
/// yields messages, or with an empty result at the deadline. `max_wait`
/// bounds caller-supplied deadlines server-side.
pub async fn wait_for_changes(
    service: &Arc<MailService>,
    events: &EventBus,
    agent_id: i64,
    since: HashMap<i64, i64>,
    wait: Duration,
    max_wait: Duration,
) -> ServiceResult<PollResult> {
    let deadline = Instant::now() + wait.min(max_wait);
    // Subscribe before the first query so a publish committing between the
    // query and the park is not lost.
    let mut rx = events.subscribe();

    loop {
        let service = Arc::clone(service);
        let cursor = since.clone();
        let result = tokio::task::spawn_blocking(move || service.poll_changes(agent_id, &cursor))
            .await
            .expect("poll task panicked")?;
        match result {
            Ok(poll) if !poll.messages.is_empty() => return Ok(Ok(poll)),
            Ok(empty_poll) => {
                // Park until something lands in a topic this agent can see,
                // carrying the cursor forward between rounds.
                loop {
                    match timeout_at(deadline, rx.recv()).await {
                        Err(_) => return Ok(Ok(empty_poll)), // deadline
                        Ok(Ok(MailEvent::NewMessage { topic_id, recipient_ids, .. })) => {
                            let relevant = empty_poll.offsets.contains_key(&topic_id)
                                || recipient_ids.contains(&agent_id);
                            if relevant {
                                break;
                            }
                        }
                        Ok(Ok(_)) => continue,
                        // Lagged or closed: re-run the query to be safe.
                        Ok(Err(_)) => break,
                    }
                }
            }
            Err(domain) => return Ok(Err(domain)),
        }
    }
}
