//! The mail service: send, publish, fetch, read, acknowledge, state
//! transitions, threading, topic subscriptions, change polling, search.
//!
//! Every mutating operation runs inside the retrying transaction executor;
//! committed side effects are broadcast on the event bus afterwards. Domain
//! failures are returned inside the response value (`ServiceResult`), so the
//! actor's reply channel always carries a value.

pub mod actor;
pub mod fsm;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{MailError, ServiceResult, StoreError};
use crate::events::{EventBus, MailEvent};
use crate::models::*;
use crate::store::{Store, TxExecutor};

pub struct MailService {
    store: Arc<Store>,
    executor: TxExecutor,
    events: Arc<EventBus>,
}

impl MailService {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>) -> Self {
        MailService {
            store,
            executor: TxExecutor::default(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // --- Send / Publish ---

    pub fn send(&self, input: &SendInput) -> ServiceResult<SendReceipt> {
        let now = now_epoch();
        let outcome = self.executor.execute(&self.store, |tx| {
            if let Some(key) = &input.idempotency_key
                && let Some(prior) = lookup_idempotency(tx, key)?
            {
                return Ok(Ok((
                    SendReceipt {
                        message_id: prior.0,
                        thread_id: prior.1.unwrap_or_default(),
                    },
                    None,
                )));
            }

            if input.subject.trim().is_empty() {
                return Ok(Err(MailError::InvalidArgument("subject must not be empty".into())));
            }
            if let Some(deadline) = input.deadline
                && deadline <= now
            {
                return Ok(Err(MailError::InvalidArgument("deadline is in the past".into())));
            }

            let Some(sender) = agent_by_id(tx, input.sender_id)? else {
                return Ok(Err(MailError::NotFound(format!("agent {}", input.sender_id))));
            };

            let mut recipients: Vec<Agent> = Vec::with_capacity(input.recipient_names.len());
            for name in &input.recipient_names {
                match agent_by_name(tx, name)? {
                    Some(agent) => recipients.push(agent),
                    None => return Ok(Err(MailError::NotFound(format!("agent {name}")))),
                }
            }

            // Target topic: explicit topic, the single recipient's inbox, or
            // the sender's own inbox for multi-recipient direct sends.
            let topic = if let Some(topic_name) = &input.topic_name {
                match topic_by_name(tx, topic_name)? {
                    Some(topic) => topic,
                    None => return Ok(Err(MailError::NotFound(format!("topic {topic_name}")))),
                }
            } else if recipients.is_empty() {
                return Ok(Err(MailError::InvalidArgument(
                    "at least one recipient or a topic is required".into(),
                )));
            } else if recipients.len() == 1 {
                match topic_by_name(tx, &inbox_topic_name(&recipients[0].name))? {
                    Some(topic) => topic,
                    None => {
                        return Ok(Err(MailError::NotFound(format!(
                            "inbox topic for {}",
                            recipients[0].name
                        ))));
                    }
                }
            } else {
                match topic_by_name(tx, &inbox_topic_name(&sender.name))? {
                    Some(topic) => topic,
                    None => {
                        return Ok(Err(MailError::NotFound(format!("inbox topic for {}", sender.name))));
                    }
                }
            };

            // A send into a topic with no named recipients fans out to the
            // topic's subscribers instead. Duplicate names collapse to one
            // recipient row.
            let recipient_ids: Vec<i64> = if recipients.is_empty() {
                subscriber_ids(tx, topic.id)?
            } else {
                let mut seen = HashSet::new();
                recipients
                    .iter()
                    .map(|a| a.id)
                    .filter(|id| seen.insert(*id))
                    .collect()
            };

            let thread_id = match &input.thread_id {
                Some(existing) => {
                    let root_topic: Option<i64> = tx
                        .query_row(
                            "SELECT topic_id FROM messages WHERE thread_id = ?1 ORDER BY id LIMIT 1",
                            params![existing],
                            |r| r.get(0),
                        )
                        .optional()
                        .map_err(StoreError::from_sqlite)?;
                    match root_topic {
                        None => return Ok(Err(MailError::NotFound(format!("thread {existing}")))),
                        // Replies within an explicit topic must stay in it;
                        // direct replies may cross inbox topics.
                        Some(root) if input.topic_name.is_some() && root != topic.id => {
                            return Ok(Err(MailError::InvalidArgument(
                                "thread belongs to a different topic".into(),
                            )));
                        }
                        Some(_) => existing.clone(),
                    }
                }
                None => uuid::Uuid::new_v4().to_string(),
            };

            let (message_id, log_offset) = insert_message(
                tx,
                &thread_id,
                topic.id,
                input.sender_id,
                &input.subject,
                &input.body,
                input.priority,
                input.deadline,
                input.attachments.as_deref(),
                now,
            )?;
            insert_recipients(tx, message_id, &recipient_ids)?;

            if let Some(key) = &input.idempotency_key {
                record_idempotency(tx, key, "send", message_id, Some(&thread_id), None, now)?;
            }

            let event = MailEvent::NewMessage {
                message_id,
                topic_id: topic.id,
                log_offset,
                thread_id: thread_id.clone(),
                sender_id: sender.id,
                sender_name: sender.name.clone(),
                subject: input.subject.clone(),
                priority: input.priority,
                recipient_ids: recipient_ids.clone(),
                created_at: now,
            };
            Ok(Ok((SendReceipt { message_id, thread_id }, Some(event))))
        })?;

        Ok(outcome.map(|(receipt, event)| {
            if let Some(event) = event {
                self.events.publish(event);
            }
            receipt
        }))
    }

    pub fn publish(&self, input: &PublishInput) -> ServiceResult<PublishReceipt> {
        let now = now_epoch();
        let outcome = self.executor.execute(&self.store, |tx| {
            if let Some(key) = &input.idempotency_key
                && let Some(prior) = lookup_idempotency(tx, key)?
            {
                return Ok(Ok((
                    PublishReceipt {
                        message_id: prior.0,
                        recipients_count: prior.2.unwrap_or(0),
                    },
                    None,
                )));
            }

            if input.subject.trim().is_empty() {
                return Ok(Err(MailError::InvalidArgument("subject must not be empty".into())));
            }
            let Some(sender) = agent_by_id(tx, input.sender_id)? else {
                return Ok(Err(MailError::NotFound(format!("agent {}", input.sender_id))));
            };
            let Some(topic) = topic_by_name(tx, &input.topic_name)? else {
                return Ok(Err(MailError::NotFound(format!("topic {}", input.topic_name))));
            };

            let recipient_ids = subscriber_ids(tx, topic.id)?;
            let thread_id = uuid::Uuid::new_v4().to_string();
            let (message_id, log_offset) = insert_message(
                tx,
                &thread_id,
                topic.id,
                sender.id,
                &input.subject,
                &input.body,
                input.priority,
                None,
                None,
                now,
            )?;
            insert_recipients(tx, message_id, &recipient_ids)?;

            let count = recipient_ids.len() as i64;
            if let Some(key) = &input.idempotency_key {
                record_idempotency(tx, key, "publish", message_id, Some(&thread_id), Some(count), now)?;
            }

            let event = MailEvent::NewMessage {
                message_id,
                topic_id: topic.id,
                log_offset,
                thread_id,
                sender_id: sender.id,
                sender_name: sender.name.clone(),
                subject: input.subject.clone(),
                priority: input.priority,
                recipient_ids: recipient_ids.clone(),
                created_at: now,
            };
            Ok(Ok((PublishReceipt { message_id, recipients_count: count }, Some(event))))
        })?;

        Ok(outcome.map(|(receipt, event)| {
            if let Some(event) = event {
                self.events.publish(event);
            }
            receipt
        }))
    }

    // --- Inbox / read / ack / state ---

    pub fn fetch_inbox(
        &self,
        agent_id: i64,
        limit: i64,
        unread_only: bool,
        include_archived: bool,
    ) -> ServiceResult<Vec<MessageEnvelope>> {
        let now = now_epoch();
        let limit = limit.clamp(1, 500);
        let conn = self.store.conn();
        if agent_by_conn(&conn, agent_id)?.is_none() {
            return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
        }

        let mut sql = String::from(
            "SELECT m.id, m.thread_id, m.topic_id, m.log_offset, m.sender_id, m.subject, m.body,
                    m.priority, m.deadline, m.attachments, m.created_at, a.name,
                    r.state, r.is_starred, r.is_archived, r.snoozed_until, r.read_at, r.acknowledged_at
             FROM message_recipients r
             JOIN messages m ON m.id = r.message_id
             JOIN agents a ON a.id = m.sender_id
             WHERE r.agent_id = ?1",
        );
        if !include_archived {
            sql.push_str(" AND r.state NOT IN ('archived','trash')");
        }
        if unread_only {
            sql.push_str(" AND (r.state = 'unread' OR (r.state = 'snoozed' AND r.snoozed_until <= ?3))");
        }
        sql.push_str(
            " ORDER BY CASE m.priority WHEN 'urgent' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                       m.created_at DESC, m.id DESC
              LIMIT ?2",
        );

        let mut stmt = conn.prepare(&sql).map_err(StoreError::from_sqlite)?;
        let rows = if unread_only {
            stmt.query_map(params![agent_id, limit, now], envelope_row)
        } else {
            stmt.query_map(params![agent_id, limit], envelope_row)
        }
        .map_err(StoreError::from_sqlite)?;
        let mut envelopes = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        for env in &mut envelopes {
            env.recipient.state = env.recipient.effective_state(now);
        }
        Ok(Ok(envelopes))
    }

    /// Returns the message plus the caller's envelope, transitioning
    /// unread -> read (setting `read_at`) when applicable.
    pub fn read_message(&self, agent_id: i64, message_id: i64) -> ServiceResult<MessageEnvelope> {
        let now = now_epoch();
        let outcome = self.executor.execute(&self.store, |tx| {
            let Some(mut envelope) = envelope_for(tx, agent_id, message_id)? else {
                return Ok(Err(MailError::NotFound(format!("message {message_id}"))));
            };
            let was_unread = matches!(
                envelope.recipient.effective_state(now),
                MessageState::Unread
            );
            if was_unread {
                tx.execute(
                    "UPDATE message_recipients
                     SET state = 'read', read_at = COALESCE(read_at, ?3), snoozed_until = NULL
                     WHERE message_id = ?1 AND agent_id = ?2",
                    params![message_id, agent_id, now],
                )
                .map_err(StoreError::from_sqlite)?;
                envelope.recipient.state = MessageState::Read;
                envelope.recipient.read_at = Some(envelope.recipient.read_at.unwrap_or(now));
                envelope.recipient.snoozed_until = None;
            } else {
                envelope.recipient.state = envelope.recipient.effective_state(now);
            }
            Ok(Ok((envelope, was_unread)))
        })?;

        Ok(outcome.map(|(envelope, transitioned)| {
            if transitioned {
                self.events.publish(MailEvent::StateChanged {
                    message_id,
                    agent_id,
                    state: MessageState::Read,
                });
            }
            envelope
        }))
    }

    /// Sets `acknowledged_at` once; acknowledging twice is a no-op.
    pub fn ack_message(&self, agent_id: i64, message_id: i64) -> ServiceResult<i64> {
        let now = now_epoch();
        self.executor.execute(&self.store, |tx| {
            let existing: Option<Option<i64>> = tx
                .query_row(
                    "SELECT acknowledged_at FROM message_recipients
                     WHERE message_id = ?1 AND agent_id = ?2",
                    params![message_id, agent_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(StoreError::from_sqlite)?;
            match existing {
                None => Ok(Err(MailError::NotFound(format!("message {message_id}")))),
                Some(Some(at)) => Ok(Ok(at)),
                Some(None) => {
                    tx.execute(
                        "UPDATE message_recipients SET acknowledged_at = ?3
                         WHERE message_id = ?1 AND agent_id = ?2",
                        params![message_id, agent_id, now],
                    )
                    .map_err(StoreError::from_sqlite)?;
                    Ok(Ok(now))
                }
            }
        })
    }

    pub fn update_state(
        &self,
        agent_id: i64,
        message_id: i64,
        new_state: MessageState,
        snoozed_until: Option<i64>,
    ) -> ServiceResult<RecipientMeta> {
        let now = now_epoch();
        let outcome = self.executor.execute(&self.store, |tx| {
            let Some(envelope) = envelope_for(tx, agent_id, message_id)? else {
                return Ok(Err(MailError::NotFound(format!("message {message_id}"))));
            };
            // The FSM is defined over stored states; snooze expiry is a
            // read-time view, not a stored transition.
            let effects = match fsm::step(envelope.recipient.state, new_state, snoozed_until, now) {
                Ok(fx) => fx,
                Err(err) => return Ok(Err(err)),
            };

            let mut meta = envelope.recipient;
            meta.state = effects.new_state;
            if effects.clear_read_at {
                meta.read_at = None;
            }
            if effects.set_read_at_if_null && meta.read_at.is_none() {
                meta.read_at = Some(now);
            }
            if let Some(starred) = effects.set_starred {
                meta.is_starred = starred;
            }
            if let Some(archived) = effects.set_archived {
                meta.is_archived = archived;
            }
            if effects.clear_snooze {
                meta.snoozed_until = None;
            }
            if let Some(until) = effects.set_snoozed_until {
                meta.snoozed_until = Some(until);
            }

            tx.execute(
                "UPDATE message_recipients
                 SET state = ?3, is_starred = ?4, is_archived = ?5,
                     snoozed_until = ?6, read_at = ?7
                 WHERE message_id = ?1 AND agent_id = ?2",
                params![
                    message_id,
                    agent_id,
                    meta.state.as_str(),
                    meta.is_starred,
                    meta.is_archived,
                    meta.snoozed_until,
                    meta.read_at,
                ],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(Ok(meta))
        })?;

        Ok(outcome.map(|meta| {
            self.events.publish(MailEvent::StateChanged {
                message_id,
                agent_id,
                state: meta.state,
            });
            meta
        }))
    }

    // --- Threads ---

    pub fn get_thread(&self, thread_id: &str) -> ServiceResult<ThreadView> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, thread_id, topic_id, log_offset, sender_id, subject, body,
                        priority, deadline, attachments, created_at
                 FROM messages WHERE thread_id = ?1 ORDER BY log_offset ASC, id ASC",
            )
            .map_err(StoreError::from_sqlite)?;
        let messages = stmt
            .query_map(params![thread_id], message_row)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        if messages.is_empty() {
            return Ok(Err(MailError::NotFound(format!("thread {thread_id}"))));
        }
        Ok(Ok(ThreadView {
            thread_id: thread_id.to_string(),
            messages,
        }))
    }

    // --- Topics / subscriptions ---

    pub fn create_topic(
        &self,
        name: &str,
        topic_type: TopicType,
        retention_secs: Option<i64>,
    ) -> ServiceResult<Topic> {
        let name = name.trim();
        if name.is_empty() || name.len() > 200 {
            return Ok(Err(MailError::InvalidArgument("topic name must be 1-200 characters".into())));
        }
        if name.starts_with("inbox:") && topic_type != TopicType::Inbox {
            return Ok(Err(MailError::InvalidArgument("the inbox: prefix is reserved".into())));
        }
        let now = now_epoch();
        let result = self.executor.execute(&self.store, |tx| {
            tx.execute(
                "INSERT INTO topics (name, topic_type, retention_secs, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, topic_type.as_str(), retention_secs, now],
            )
            .map_err(StoreError::from_sqlite)?;
            let id = tx.last_insert_rowid();
            Ok(Topic {
                id,
                name: name.to_string(),
                topic_type,
                retention_secs,
                created_at: now,
            })
        });
        match result {
            Ok(topic) => Ok(Ok(topic)),
            Err(StoreError::UniqueConstraint) => {
                Ok(Err(MailError::Conflict(format!("topic {name} already exists"))))
            }
            Err(err) => Err(err),
        }
    }

    pub fn list_topics(&self) -> ServiceResult<Vec<Topic>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, topic_type, retention_secs, created_at
                 FROM topics ORDER BY name",
            )
            .map_err(StoreError::from_sqlite)?;
        let topics = stmt
            .query_map([], topic_row)
            .map_err(StoreError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_sqlite)?;
        Ok(Ok(topics))
    }

    pub fn subscribe(&self, agent_id: i64, topic_name: &str) -> ServiceResult<Subscription> {
        let now = now_epoch();
        self.executor.execute(&self.store, |tx| {
            if agent_by_id(tx, agent_id)?.is_none() {
                return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
            }
            let Some(topic) = topic_by_name(tx, topic_name)? else {
                return Ok(Err(MailError::NotFound(format!("topic {topic_name}"))));
            };
            tx.execute(
                "INSERT OR IGNORE INTO subscriptions (agent_id, topic_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![agent_id, topic.id, now],
            )
            .map_err(StoreError::from_sqlite)?;
            tx.execute(
                "INSERT OR IGNORE INTO consumer_offsets (agent_id, topic_id, last_offset)
                 VALUES (?1, ?2, 0)",
                params![agent_id, topic.id],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(Ok(Subscription {
                agent_id,
                topic_id: topic.id,
                created_at: now,
            }))
        })
    }

    pub fn unsubscribe(&self, agent_id: i64, topic_name: &str) -> ServiceResult<bool> {
        self.executor.execute(&self.store, |tx| {
            let Some(topic) = topic_by_name(tx, topic_name)? else {
                return Ok(Err(MailError::NotFound(format!("topic {topic_name}"))));
            };
            let removed = tx
                .execute(
                    "DELETE FROM subscriptions WHERE agent_id = ?1 AND topic_id = ?2",
                    params![agent_id, topic.id],
                )
                .map_err(StoreError::from_sqlite)?;
            Ok(Ok(removed > 0))
        })
    }

    // --- Change feed ---

    /// Delta since a per-topic offset vector. Considers the supplied topics
    /// the agent may see (subscriptions plus its own inbox); the inbox is
    /// always included, defaulting to the stored consumer offset. Stored
    /// offsets advance to the returned head and never move backward.
    pub fn poll_changes(
        &self,
        agent_id: i64,
        since: &HashMap<i64, i64>,
    ) -> ServiceResult<PollResult> {
        let now = now_epoch();
        self.executor.execute(&self.store, |tx| {
            let Some(agent) = agent_by_id(tx, agent_id)? else {
                return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
            };

            let mut visible: HashSet<i64> = subscription_topic_ids(tx, agent_id)?;
            if let Some(inbox) = topic_by_name(tx, &inbox_topic_name(&agent.name))? {
                visible.insert(inbox.id);
            }

            // BTreeMap keeps the response ordered by (topic, offset).
            let mut cursors: BTreeMap<i64, i64> = BTreeMap::new();
            for topic_id in &visible {
                let from = match since.get(topic_id) {
                    Some(offset) => *offset,
                    None => stored_offset(tx, agent_id, *topic_id)?,
                };
                cursors.insert(*topic_id, from);
            }
            // Topics the caller asked about but cannot see are ignored.

            let mut messages: Vec<MessageEnvelope> = Vec::new();
            let mut offsets: HashMap<i64, i64> = HashMap::new();
            for (&topic_id, &from) in &cursors {
                let mut stmt = tx
                    .prepare(
                        "SELECT m.id, m.thread_id, m.topic_id, m.log_offset, m.sender_id,
                                m.subject, m.body, m.priority, m.deadline, m.attachments,
                                m.created_at, a.name,
                                r.state, r.is_starred, r.is_archived, r.snoozed_until,
                                r.read_at, r.acknowledged_at
                         FROM messages m
                         JOIN agents a ON a.id = m.sender_id
                         LEFT JOIN message_recipients r
                             ON r.message_id = m.id AND r.agent_id = ?2
                         WHERE m.topic_id = ?1 AND m.log_offset > ?3
                         ORDER BY m.log_offset ASC",
                    )
                    .map_err(StoreError::from_sqlite)?;
                let rows = stmt
                    .query_map(params![topic_id, agent_id, from], envelope_row_optional)
                    .map_err(StoreError::from_sqlite)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from_sqlite)?;

                let head = rows.last().map(|env| env.message.log_offset).unwrap_or(from);
                offsets.insert(topic_id, head);
                for mut env in rows {
                    env.recipient.state = env.recipient.effective_state(now);
                    messages.push(env);
                }

                // The stored cursor advances to what was actually delivered
                // and never past the topic head, whatever cursor the caller
                // supplied.
                let topic_head: i64 = tx
                    .query_row(
                        "SELECT next_offset - 1 FROM topics WHERE id = ?1",
                        params![topic_id],
                        |r| r.get(0),
                    )
                    .map_err(StoreError::from_sqlite)?;
                tx.execute(
                    "INSERT INTO consumer_offsets (agent_id, topic_id, last_offset)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(agent_id, topic_id)
                     DO UPDATE SET last_offset = MAX(last_offset, excluded.last_offset)",
                    params![agent_id, topic_id, head.min(topic_head)],
                )
                .map_err(StoreError::from_sqlite)?;
            }

            Ok(Ok(PollResult { messages, offsets }))
        })
    }

    // --- Status ---

    pub fn get_status(&self, agent_id: i64) -> ServiceResult<AgentStatus> {
        let now = now_epoch();
        let conn = self.store.conn();
        let Some(agent) = agent_by_conn(&conn, agent_id)? else {
            return Ok(Err(MailError::NotFound(format!("agent {agent_id}"))));
        };

        let unread: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM message_recipients
                 WHERE agent_id = ?1
                   AND (state = 'unread' OR (state = 'snoozed' AND snoozed_until <= ?2))",
                params![agent_id, now],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        let urgent: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM message_recipients r
                 JOIN messages m ON m.id = r.message_id
                 WHERE r.agent_id = ?1 AND m.priority = 'urgent'
                   AND (r.state = 'unread' OR (r.state = 'snoozed' AND r.snoozed_until <= ?2))",
                params![agent_id, now],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        let starred: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM message_recipients
                 WHERE agent_id = ?1 AND is_starred = 1 AND state != 'trash'",
                params![agent_id],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        let snoozed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM message_recipients
                 WHERE agent_id = ?1 AND state = 'snoozed' AND snoozed_until > ?2",
                params![agent_id, now],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;

        Ok(Ok(AgentStatus {
            agent_id,
            agent_name: agent.name,
            unread,
            urgent,
            starred,
            snoozed,
        }))
    }

    /// Whether any message from `sender_id` to `recipient_id` is still
    /// unacknowledged. Clients use this to suppress duplicate status pings.
    pub fn has_unacked_status_to(&self, sender_id: i64, recipient_id: i64) -> ServiceResult<bool> {
        let conn = self.store.conn();
        let exists: i64 = conn
            .query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM messages m
                     JOIN message_recipients r ON r.message_id = m.id
                     WHERE m.sender_id = ?1 AND r.agent_id = ?2
                       AND r.acknowledged_at IS NULL
                 )",
                params![sender_id, recipient_id],
                |r| r.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(Ok(exists != 0))
    }

    // --- Search ---

    pub fn search(
        &self,
        agent_id: Option<i64>,
        query: &str,
        limit: i64,
    ) -> ServiceResult<Vec<SearchHit>> {
        let limit = limit.clamp(1, 200);
        let result = match agent_id {
            Some(agent) => self.store.search_for_agent(agent, query, limit),
            None => self.store.search_global(query, limit),
        };
        match result {
            Ok(hits) => Ok(Ok(hits)),
            // The only caller-controlled input reaching the statement is the
            // FTS query itself, so a statement failure is a bad query.
            Err(StoreError::Sqlite(err)) => {
                Ok(Err(MailError::InvalidArgument(format!("bad search query: {err}"))))
            }
            Err(err) => Err(err),
        }
    }
}

// --- Row helpers shared by the service and identity registry ---

pub(crate) fn agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        project_key: row.get(2)?,
        git_branch: row.get(3)?,
        created_at: row.get(4)?,
        last_active_at: row.get(5)?,
    })
}

pub(crate) fn topic_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Topic> {
    let type_str: String = row.get(2)?;
    Ok(Topic {
        id: row.get(0)?,
        name: row.get(1)?,
        topic_type: TopicType::parse(&type_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        retention_secs: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let priority: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        topic_id: row.get(2)?,
        log_offset: row.get(3)?,
        sender_id: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        priority: Priority::parse(&priority).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        deadline: row.get(8)?,
        attachments: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Columns 0-10 message, 11 sender name, 12-17 recipient row.
fn envelope_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageEnvelope> {
    let state: String = row.get(12)?;
    Ok(MessageEnvelope {
        message: message_row(row)?,
        sender_name: row.get(11)?,
        recipient: RecipientMeta {
            state: MessageState::parse(&state).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
            })?,
            is_starred: row.get(13)?,
            is_archived: row.get(14)?,
            snoozed_until: row.get(15)?,
            read_at: row.get(16)?,
            acknowledged_at: row.get(17)?,
        },
    })
}

/// As `envelope_row` but tolerates a missing recipient row (LEFT JOIN):
/// subscribers polling a topic see messages they hold no envelope for.
fn envelope_row_optional(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageEnvelope> {
    let state: Option<String> = row.get(12)?;
    let recipient = match state {
        Some(state) => RecipientMeta {
            state: MessageState::parse(&state).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
            })?,
            is_starred: row.get(13)?,
            is_archived: row.get(14)?,
            snoozed_until: row.get(15)?,
            read_at: row.get(16)?,
            acknowledged_at: row.get(17)?,
        },
        None => RecipientMeta {
            state: MessageState::Unread,
            is_starred: false,
            is_archived: false,
            snoozed_until: None,
            read_at: None,
            acknowledged_at: None,
        },
    };
    Ok(MessageEnvelope {
        message: message_row(row)?,
        sender_name: row.get(11)?,
        recipient,
    })
}

pub(crate) fn agent_by_id(tx: &Transaction, id: i64) -> Result<Option<Agent>, StoreError> {
    tx.query_row(
        "SELECT id, name, project_key, git_branch, created_at, last_active_at
         FROM agents WHERE id = ?1",
        params![id],
        agent_row,
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

pub(crate) fn agent_by_conn(conn: &Connection, id: i64) -> Result<Option<Agent>, StoreError> {
    conn.query_row(
        "SELECT id, name, project_key, git_branch, created_at, last_active_at
         FROM agents WHERE id = ?1",
        params![id],
        agent_row,
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

pub(crate) fn agent_by_name(tx: &Transaction, name: &str) -> Result<Option<Agent>, StoreError> {
    tx.query_row(
        "SELECT id, name, project_key, git_branch, created_at, last_active_at
         FROM agents WHERE name = ?1",
        params![name],
        agent_row,
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

pub(crate) fn topic_by_name(tx: &Transaction, name: &str) -> Result<Option<Topic>, StoreError> {
    tx.query_row(
        "SELECT id, name, topic_type, retention_secs, created_at FROM topics WHERE name = ?1",
        params![name],
        topic_row,
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

fn subscriber_ids(tx: &Transaction, topic_id: i64) -> Result<Vec<i64>, StoreError> {
    let mut stmt = tx
        .prepare("SELECT agent_id FROM subscriptions WHERE topic_id = ?1 ORDER BY agent_id")
        .map_err(StoreError::from_sqlite)?;
    let ids = stmt
        .query_map(params![topic_id], |r| r.get(0))
        .map_err(StoreError::from_sqlite)?
        .collect::<Result<Vec<i64>, _>>()
        .map_err(StoreError::from_sqlite)?;
    Ok(ids)
}

fn subscription_topic_ids(tx: &Transaction, agent_id: i64) -> Result<HashSet<i64>, StoreError> {
    let mut stmt = tx
        .prepare("SELECT topic_id FROM subscriptions WHERE agent_id = ?1")
        .map_err(StoreError::from_sqlite)?;
    let ids = stmt
        .query_map(params![agent_id], |r| r.get(0))
        .map_err(StoreError::from_sqlite)?
        .collect::<Result<HashSet<i64>, _>>()
        .map_err(StoreError::from_sqlite)?;
    Ok(ids)
}

fn stored_offset(tx: &Transaction, agent_id: i64, topic_id: i64) -> Result<i64, StoreError> {
    let offset: Option<i64> = tx
        .query_row(
            "SELECT last_offset FROM consumer_offsets WHERE agent_id = ?1 AND topic_id = ?2",
            params![agent_id, topic_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(StoreError::from_sqlite)?;
    Ok(offset.unwrap_or(0))
}

/// Claim the next dense log offset for a topic. The high-water column makes
/// allocation immune to retention pruning of old rows.
fn allocate_offset(tx: &Transaction, topic_id: i64) -> Result<i64, StoreError> {
    let offset: i64 = tx
        .query_row(
            "SELECT next_offset FROM topics WHERE id = ?1",
            params![topic_id],
            |r| r.get(0),
        )
        .map_err(StoreError::from_sqlite)?;
    tx.execute(
        "UPDATE topics SET next_offset = next_offset + 1 WHERE id = ?1",
        params![topic_id],
    )
    .map_err(StoreError::from_sqlite)?;
    Ok(offset)
}

#[allow(clippy::too_many_arguments)]
fn insert_message(
    tx: &Transaction,
    thread_id: &str,
    topic_id: i64,
    sender_id: i64,
    subject: &str,
    body: &str,
    priority: Priority,
    deadline: Option<i64>,
    attachments: Option<&[u8]>,
    now: i64,
) -> Result<(i64, i64), StoreError> {
    let log_offset = allocate_offset(tx, topic_id)?;
    tx.execute(
        "INSERT INTO messages
             (thread_id, topic_id, log_offset, sender_id, subject, body, priority,
              deadline, attachments, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![thread_id, topic_id, log_offset, sender_id, subject, body,
                priority.as_str(), deadline, attachments, now],
    )
    .map_err(StoreError::from_sqlite)?;
    Ok((tx.last_insert_rowid(), log_offset))
}

fn insert_recipients(tx: &Transaction, message_id: i64, agent_ids: &[i64]) -> Result<(), StoreError> {
    let mut stmt = tx
        .prepare(
            "INSERT INTO message_recipients (message_id, agent_id, state) VALUES (?1, ?2, 'unread')",
        )
        .map_err(StoreError::from_sqlite)?;
    for agent_id in agent_ids {
        stmt.execute(params![message_id, agent_id])
            .map_err(StoreError::from_sqlite)?;
    }
    Ok(())
}

fn envelope_for(
    tx: &Transaction,
    agent_id: i64,
    message_id: i64,
) -> Result<Option<MessageEnvelope>, StoreError> {
    tx.query_row(
        "SELECT m.id, m.thread_id, m.topic_id, m.log_offset, m.sender_id, m.subject, m.body,
                m.priority, m.deadline, m.attachments, m.created_at, a.name,
                r.state, r.is_starred, r.is_archived, r.snoozed_until, r.read_at, r.acknowledged_at
         FROM message_recipients r
         JOIN messages m ON m.id = r.message_id
         JOIN agents a ON a.id = m.sender_id
         WHERE r.message_id = ?1 AND r.agent_id = ?2",
        params![message_id, agent_id],
        envelope_row,
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

type IdempotencyRow = (i64, Option<String>, Option<i64>);

fn lookup_idempotency(tx: &Transaction, key: &str) -> Result<Option<IdempotencyRow>, StoreError> {
    tx.query_row(
        "SELECT message_id, thread_id, recipients_count FROM idempotency WHERE key = ?1",
        params![key],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

fn record_idempotency(
    tx: &Transaction,
    key: &str,
    kind: &str,
    message_id: i64,
    thread_id: Option<&str>,
    recipients_count: Option<i64>,
    now: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO idempotency (key, kind, message_id, thread_id, recipients_count, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![key, kind, message_id, thread_id, recipients_count, now],
    )
    .map_err(StoreError::from_sqlite)?;
    Ok(())
}
