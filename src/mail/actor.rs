//! The mail actor: a dedicated OS thread draining a bounded mailbox, one
//! request at a time. This is the serialization point for every mutating
//! mail operation; reads ride the same queue so callers observe a single
//! total order.
//!
//! Callers submit asynchronously and await a typed reply. Dropping the
//! caller's future abandons the reply without cancelling the in-flight
//! operation; whatever committed stays committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MailError, StoreError};
use crate::models::*;

use super::MailService;

const MAILBOX_DEPTH: usize = 256;

/// Infrastructure failure of the ask itself, distinct from domain errors.
#[derive(Debug, Error)]
pub enum AskError {
    #[error("mail actor terminated")]
    ActorTerminated,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// One reply slot per request shape keeps the envelope sealed and the
/// replies typed; no downcasting at either end.
enum Envelope {
    Send(SendInput, Reply<SendReceipt>),
    Publish(PublishInput, Reply<PublishReceipt>),
    FetchInbox {
        agent_id: i64,
        limit: i64,
        unread_only: bool,
        include_archived: bool,
        reply: Reply<Vec<MessageEnvelope>>,
    },
    Read {
        agent_id: i64,
        message_id: i64,
        reply: Reply<MessageEnvelope>,
    },
    Ack {
        agent_id: i64,
        message_id: i64,
        reply: Reply<i64>,
    },
    UpdateState {
        agent_id: i64,
        message_id: i64,
        new_state: MessageState,
        snoozed_until: Option<i64>,
        reply: Reply<RecipientMeta>,
    },
    PollChanges {
        agent_id: i64,
        since: HashMap<i64, i64>,
        reply: Reply<PollResult>,
    },
    GetStatus {
        agent_id: i64,
        reply: Reply<AgentStatus>,
    },
    HasUnackedStatusTo {
        sender_id: i64,
        recipient_id: i64,
        reply: Reply<bool>,
    },
}

type Reply<T> = oneshot::Sender<Result<Result<T, MailError>, StoreError>>;

/// Cloneable handle for submitting requests to the actor.
#[derive(Clone)]
pub struct MailboxHandle {
    tx: mpsc::Sender<Envelope>,
}

/// Spawn the actor thread. The thread exits when every handle is dropped.
pub fn spawn(service: Arc<MailService>) -> MailboxHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(MAILBOX_DEPTH);
    thread::Builder::new()
        .name("mail-actor".into())
        .spawn(move || {
            tracing::info!("mail actor started");
            while let Some(envelope) = rx.blocking_recv() {
                dispatch(&service, envelope);
            }
            // Remaining senders are gone; parked waiters see the dropped
            // oneshot as ActorTerminated.
            tracing::info!("mail actor stopped: mailbox closed");
        })
        .expect("failed to spawn mail actor thread");
    MailboxHandle { tx }
}

fn dispatch(service: &MailService, envelope: Envelope) {
    match envelope {
        Envelope::Send(input, reply) => {
            let _ = reply.send(service.send(&input));
        }
        Envelope::Publish(input, reply) => {
            let _ = reply.send(service.publish(&input));
        }
        Envelope::FetchInbox { agent_id, limit, unread_only, include_archived, reply } => {
            let _ = reply.send(service.fetch_inbox(agent_id, limit, unread_only, include_archived));
        }
        Envelope::Read { agent_id, message_id, reply } => {
            let _ = reply.send(service.read_message(agent_id, message_id));
        }
        Envelope::Ack { agent_id, message_id, reply } => {
            let _ = reply.send(service.ack_message(agent_id, message_id));
        }
        Envelope::UpdateState { agent_id, message_id, new_state, snoozed_until, reply } => {
            let _ = reply.send(service.update_state(agent_id, message_id, new_state, snoozed_until));
        }
        Envelope::PollChanges { agent_id, since, reply } => {
            let _ = reply.send(service.poll_changes(agent_id, &since));
        }
        Envelope::GetStatus { agent_id, reply } => {
            let _ = reply.send(service.get_status(agent_id));
        }
        Envelope::HasUnackedStatusTo { sender_id, recipient_id, reply } => {
            let _ = reply.send(service.has_unacked_status_to(sender_id, recipient_id));
        }
    }
}

impl MailboxHandle {
    async fn ask<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Envelope,
    ) -> Result<Result<T, MailError>, AskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| AskError::ActorTerminated)?;
        match reply_rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(store_err)) => Err(AskError::Storage(store_err)),
            Err(_) => Err(AskError::ActorTerminated),
        }
    }

    pub async fn send_mail(
        &self,
        input: SendInput,
    ) -> Result<Result<SendReceipt, MailError>, AskError> {
        self.ask(|reply| Envelope::Send(input, reply)).await
    }

    pub async fn publish(
        &self,
        input: PublishInput,
    ) -> Result<Result<PublishReceipt, MailError>, AskError> {
        self.ask(|reply| Envelope::Publish(input, reply)).await
    }

    pub async fn fetch_inbox(
        &self,
        agent_id: i64,
        limit: i64,
        unread_only: bool,
        include_archived: bool,
    ) -> Result<Result<Vec<MessageEnvelope>, MailError>, AskError> {
        self.ask(|reply| Envelope::FetchInbox { agent_id, limit, unread_only, include_archived, reply })
            .await
    }

    pub async fn read_message(
        &self,
        agent_id: i64,
        message_id: i64,
    ) -> Result<Result<MessageEnvelope, MailError>, AskError> {
        self.ask(|reply| Envelope::Read { agent_id, message_id, reply }).await
    }

    pub async fn ack_message(
        &self,
        agent_id: i64,
        message_id: i64,
    ) -> Result<Result<i64, MailError>, AskError> {
        self.ask(|reply| Envelope::Ack { agent_id, message_id, reply }).await
    }

    pub async fn update_state(
        &self,
        agent_id: i64,
        message_id: i64,
        new_state: MessageState,
        snoozed_until: Option<i64>,
    ) -> Result<Result<RecipientMeta, MailError>, AskError> {
        self.ask(|reply| Envelope::UpdateState { agent_id, message_id, new_state, snoozed_until, reply })
            .await
    }

    pub async fn poll_changes(
        &self,
        agent_id: i64,
        since: HashMap<i64, i64>,
    ) -> Result<Result<PollResult, MailError>, AskError> {
        self.ask(|reply| Envelope::PollChanges { agent_id, since, reply }).await
    }

    pub async fn get_status(
        &self,
        agent_id: i64,
    ) -> Result<Result<AgentStatus, MailError>, AskError> {
        self.ask(|reply| Envelope::GetStatus { agent_id, reply }).await
    }

    pub async fn has_unacked_status_to(
        &self,
        sender_id: i64,
        recipient_id: i64,
    ) -> Result<Result<bool, MailError>, AskError> {
        self.ask(|reply| Envelope::HasUnackedStatusTo { sender_id, recipient_id, reply })
            .await
    }
}
