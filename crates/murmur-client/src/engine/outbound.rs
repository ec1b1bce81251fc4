// Outgoing lifecycle: send, attempt, acknowledgement aggregation, retries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use murmur_shared::constants::MAX_CONTENT_SIZE;
use murmur_shared::event::{TAG_ATTACHMENT, TAG_EVENT, TAG_GROUP, TAG_PUBKEY};
use murmur_shared::{
    ClientMessage, Event, EventId, EventKind, LocalMessageId, PublicKey, UnsignedEvent,
};
use murmur_store::{Message, MessageStatus, OutboxEntry, RelayResult};

use super::{lock, DeliveryEngine, RelayAck, SendReceipt, SendRequest, Target};
use crate::error::{ErrorKind, MessageError};
use crate::tracer::{FlowRecord, FlowStage};

/// What started an attempt. Decides which statuses may be (re)sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Initial,
    Automatic,
    Manual,
}

impl Trigger {
    fn eligible(self) -> &'static [MessageStatus] {
        match self {
            Self::Initial => &[MessageStatus::Sending],
            Self::Automatic => &[MessageStatus::Queued, MessageStatus::Rejected],
            Self::Manual => &[MessageStatus::Rejected, MessageStatus::Failed],
        }
    }
}

/// Marks a message as in flight for as long as it lives.
pub(crate) struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<LocalMessageId>>,
    id: LocalMessageId,
}

impl<'a> InFlightGuard<'a> {
    /// `None` if another attempt holds the marker. A losing call must never
    /// build a guard, or its drop would clear the holder's marker.
    pub(crate) fn acquire(set: &'a Mutex<HashSet<LocalMessageId>>, id: LocalMessageId) -> Option<Self> {
        let inserted = lock(set).insert(id);
        inserted.then(|| Self { set, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

/// Routes `OK` frames for one event to the attempt waiting on them.
struct AckRegistration<'a> {
    acks: &'a Mutex<HashMap<EventId, mpsc::UnboundedSender<RelayAck>>>,
    event_id: EventId,
}

impl<'a> AckRegistration<'a> {
    fn register(
        acks: &'a Mutex<HashMap<EventId, mpsc::UnboundedSender<RelayAck>>>,
        event_id: EventId,
    ) -> (Self, mpsc::UnboundedReceiver<RelayAck>) {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(acks).insert(event_id, tx);
        (Self { acks, event_id }, rx)
    }
}

impl Drop for AckRegistration<'_> {
    fn drop(&mut self) {
        lock(self.acks).remove(&self.event_id);
    }
}

struct ProcessingFlag<'a>(&'a AtomicBool);

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Acknowledgements collected for one publish.
#[derive(Debug, Default)]
struct AckOutcome {
    attempted: usize,
    accepted: usize,
    rejected: usize,
    /// Relays that never answered before the deadline.
    silent: usize,
    /// Set when nothing could be sent at all.
    send_error: Option<ErrorKind>,
}

impl DeliveryEngine {
    /// Persist a new outgoing message and make the first delivery attempt.
    ///
    /// The message is durable before any network activity. Offline sends
    /// succeed with status `queued`.
    pub async fn send(&self, request: SendRequest) -> Result<SendReceipt, MessageError> {
        validate_content(&request.content)?;

        let me = self.public_key();
        let mut message = match &request.target {
            Target::Direct(recipient) => {
                Message::outgoing_direct(me, *recipient, request.content.clone())
            }
            Target::Group(group_id) => {
                if self.db().group_key(group_id)?.is_none() {
                    return Err(MessageError::invalid_input(format!(
                        "unknown group {group_id}"
                    )));
                }
                Message::outgoing_group(me, group_id.clone(), request.content.clone())
            }
        };
        message.reply_to = request.reply_to;
        message.attachments = request.attachments;

        self.db().insert_outgoing(&message)?;
        self.with_log(&message.conversation_id, |log| {
            log.insert(message.local_id, None, message.timestamp)
        })?;
        self.inner.tracer.record(
            FlowRecord::new(FlowStage::Created, message.conversation_id.as_str())
                .message(message.local_id),
        );
        self.emit_status(&message, MessageStatus::Sending, None);

        self.attempt(message.local_id, Trigger::Initial).await
    }

    /// Convenience for a plain direct message to a hex public key.
    pub async fn send_text(&self, recipient_hex: &str, content: &str) -> Result<SendReceipt, MessageError> {
        let recipient = PublicKey::from_hex(recipient_hex)
            .map_err(|e| MessageError::invalid_input(e.to_string()))?;
        self.send(SendRequest::direct(recipient, content)).await
    }

    /// Retry a `rejected` or `failed` message now. The attempt counter starts
    /// over. A message that is already being sent is left alone.
    pub async fn retry_failed_message(
        &self,
        local_id: &LocalMessageId,
    ) -> Result<SendReceipt, MessageError> {
        let message = self.db().get_message(local_id)?;
        match message.status {
            MessageStatus::Rejected | MessageStatus::Failed => {}
            MessageStatus::Sending => return Ok(SendReceipt::of(&message)),
            other => {
                return Err(MessageError::invalid_input(format!(
                    "cannot retry a message in status {other}"
                ))
                .for_message(*local_id))
            }
        }
        info!(local_id = %local_id, "Manual retry");
        self.attempt(*local_id, Trigger::Manual).await
    }

    /// Cancel a `queued` or `rejected` message. Returns `false` if the
    /// message is in flight or already past the point of cancelling.
    pub fn cancel(&self, local_id: &LocalMessageId) -> Result<bool, MessageError> {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, *local_id) else {
            return Ok(false);
        };
        let cancelled = self.db().transition_status(
            local_id,
            &[MessageStatus::Queued, MessageStatus::Rejected],
            MessageStatus::Cancelled,
            None,
        )?;
        if cancelled {
            self.db().remove_outbox_entry(local_id)?;
            lock(&self.inner.scheduler).cancel(local_id);
            let message = self.db().get_message(local_id)?;
            self.trace_status(&message, MessageStatus::Cancelled);
            self.emit_status(&message, MessageStatus::Cancelled, None);
        }
        Ok(cancelled)
    }

    /// Resend every `queued` or `rejected` outbox entry. Does nothing while
    /// another pass is running or the network is unavailable. Returns how
    /// many messages were attempted.
    pub async fn process_offline_queue(&self) -> Result<usize, MessageError> {
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            debug!("Outbox pass already running");
            return Ok(0);
        }
        let _flag = ProcessingFlag(&self.inner.processing);

        let availability = self.inner.monitor.can_attempt_operation();
        if !availability.allowed {
            debug!(reason = %availability.reason, "Skipping outbox pass");
            return Ok(0);
        }

        let entries = self.db().outbox_entries()?;
        let mut attempted = 0;
        for entry in entries {
            let status = self.db().get_message(&entry.local_id)?.status;
            if !Trigger::Automatic.eligible().contains(&status) {
                continue;
            }
            lock(&self.inner.scheduler).cancel(&entry.local_id);
            match self.attempt(entry.local_id, Trigger::Automatic).await {
                Ok(_) => attempted += 1,
                Err(e) => warn!(local_id = %entry.local_id, error = %e, "Queued send failed"),
            }
        }
        Ok(attempted)
    }

    /// Attempt every scheduled retry whose time has come.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> usize {
        if !self.inner.monitor.can_attempt_operation().allowed {
            return 0;
        }
        let due = lock(&self.inner.scheduler).pop_due(now);
        let mut attempted = 0;
        for local_id in due {
            match self.attempt(local_id, Trigger::Automatic).await {
                Ok(_) => attempted += 1,
                Err(e) => warn!(local_id = %local_id, error = %e, "Scheduled retry failed"),
            }
        }
        attempted
    }

    /// Upgrade `accepted` to `delivered` once the recipient confirmed.
    pub fn mark_delivered(&self, event_id: &EventId) -> Result<bool, MessageError> {
        let Some(message) = self.db().get_message_by_event_id(event_id)? else {
            return Ok(false);
        };
        let changed = self.db().transition_status(
            &message.local_id,
            &[MessageStatus::Accepted],
            MessageStatus::Delivered,
            None,
        )?;
        if changed {
            self.trace_status(&message, MessageStatus::Delivered);
            self.emit_status(&message, MessageStatus::Delivered, None);
        }
        Ok(changed)
    }

    /// React to a message locally and publish the reaction best-effort.
    pub fn react(&self, local_id: &LocalMessageId, emoji: &str) -> Result<bool, MessageError> {
        if emoji.trim().is_empty() {
            return Err(MessageError::invalid_input("reaction is empty"));
        }
        let message = self.db().get_message(local_id)?;
        let added = self.db().add_reaction(local_id, &self.public_key(), emoji)?;

        if let Some(event_id) = message.event_id {
            let mut unsigned = UnsignedEvent::new(
                self.public_key(),
                Utc::now().timestamp(),
                EventKind::Reaction,
                emoji.to_string(),
            )
            .tag(&[TAG_EVENT, &event_id.to_hex()]);
            if message.sender != self.public_key() {
                unsigned = unsigned.tag(&[TAG_PUBKEY, &message.sender.to_hex()]);
            }
            self.publish_best_effort(unsigned);
        }
        Ok(added)
    }

    /// Soft-delete a message locally and ask relays to drop it if it is ours.
    pub fn delete_message(&self, local_id: &LocalMessageId) -> Result<bool, MessageError> {
        let message = self.db().get_message(local_id)?;
        let deleted = self.db().soft_delete_message(local_id)?;

        if let (true, Some(event_id)) = (message.sender == self.public_key(), message.event_id) {
            let unsigned = UnsignedEvent::new(
                self.public_key(),
                Utc::now().timestamp(),
                EventKind::Deletion,
                String::new(),
            )
            .tag(&[TAG_EVENT, &event_id.to_hex()]);
            self.publish_best_effort(unsigned);
        }
        Ok(deleted)
    }

    /// One delivery attempt for a persisted message.
    pub(crate) async fn attempt(
        &self,
        local_id: LocalMessageId,
        trigger: Trigger,
    ) -> Result<SendReceipt, MessageError> {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, local_id) else {
            debug!(local_id = %local_id, "Already in flight");
            let message = self.db().get_message(&local_id)?;
            return Ok(SendReceipt::of(&message));
        };

        let mut message = self.db().get_message(&local_id)?;
        if !trigger.eligible().contains(&message.status) {
            debug!(local_id = %local_id, status = %message.status, "Not eligible for sending");
            return Ok(SendReceipt::of(&message));
        }

        if trigger == Trigger::Manual {
            self.db().upsert_outbox_entry(&OutboxEntry::new(local_id))?;
            self.db().set_retry_count(&local_id, 0)?;
        }
        if message.status != MessageStatus::Sending {
            self.db()
                .update_status(&local_id, MessageStatus::Sending, None)?;
            message.status = MessageStatus::Sending;
            self.trace_status(&message, MessageStatus::Sending);
            self.emit_status(&message, MessageStatus::Sending, None);
        }

        let availability = self.inner.monitor.can_attempt_operation();
        if !availability.allowed {
            let kind = availability.kind.unwrap_or(ErrorKind::NetworkOffline);
            self.db()
                .update_status(&local_id, MessageStatus::Queued, Some(kind.as_str()))?;
            // The connectivity flush may already have run; the scheduled
            // retry picks the message up if it did.
            lock(&self.inner.scheduler).schedule_after_failure(local_id, 1, Utc::now());
            message.status = MessageStatus::Queued;
            message.error_kind = Some(kind.as_str().to_string());
            self.inner.tracer.record(
                FlowRecord::new(FlowStage::Queued, availability.reason).message(local_id),
            );
            self.emit_status(&message, MessageStatus::Queued, Some(kind));
            return Ok(SendReceipt::of(&message));
        }

        let result = self.deliver(&mut message).await;
        if let Err(e) = &result {
            self.requeue_after_error(&message, e);
        }
        result.map_err(|e| e.for_message(local_id))
    }

    /// Encrypt and sign on the first attempt, then publish and settle. A
    /// message still in `sending` after an error is requeued by the caller.
    async fn deliver(&self, message: &mut Message) -> Result<SendReceipt, MessageError> {
        let local_id = message.local_id;
        let event = match message.signed_event.clone() {
            Some(event) => event,
            None => match self.build_event(message) {
                Ok(event) => {
                    self.db().set_signed_event(&local_id, &event)?;
                    self.with_log(&message.conversation_id, |log| {
                        log.set_event_id(&local_id, event.id)
                    })?;
                    message.event_id = Some(event.id);
                    event
                }
                Err(e) => {
                    self.db()
                        .finish_outgoing(&local_id, MessageStatus::Failed, Some(e.kind.as_str()))?;
                    lock(&self.inner.scheduler).cancel(&local_id);
                    self.trace_status(message, MessageStatus::Failed);
                    self.emit_status(message, MessageStatus::Failed, Some(e.kind));
                    return Err(e);
                }
            },
        };

        let outcome = self.publish(message, &event).await?;
        self.settle(message.clone(), outcome)
    }

    /// Put a message left in `sending` by a failed attempt back in the queue.
    fn requeue_after_error(&self, message: &Message, error: &MessageError) {
        let local_id = message.local_id;
        let requeued = self.db().transition_status(
            &local_id,
            &[MessageStatus::Sending],
            MessageStatus::Queued,
            Some(error.kind.as_str()),
        );
        match requeued {
            Ok(true) => {
                lock(&self.inner.scheduler).schedule_after_failure(local_id, 1, Utc::now());
                warn!(local_id = %local_id, error = %error, "Attempt aborted, message requeued");
                self.trace_status(message, MessageStatus::Queued);
                self.emit_status(message, MessageStatus::Queued, Some(error.kind));
            }
            Ok(false) => {}
            Err(e) => warn!(local_id = %local_id, error = %e, "Could not requeue message"),
        }
    }

    fn build_event(&self, message: &Message) -> Result<Event, MessageError> {
        let codec = &self.inner.codec;
        let identity = &self.inner.identity;

        let mut unsigned = match (&message.recipient, &message.group_id) {
            (_, Some(group_id)) => {
                let key = self.db().group_key(group_id)?.ok_or_else(|| {
                    MessageError::new(ErrorKind::EncryptionFailed, format!("no key for group {group_id}"))
                })?;
                let envelope = codec
                    .seal_group(&key, &message.content)
                    .map_err(|e| MessageError::new(ErrorKind::EncryptionFailed, e.to_string()))?;
                UnsignedEvent::new(
                    message.sender,
                    message.timestamp.timestamp(),
                    EventKind::GroupMessage,
                    envelope,
                )
                .tag(&[TAG_GROUP, group_id.as_str()])
            }
            (Some(recipient), None) => {
                let envelope = codec
                    .encrypt(identity, &message.content, recipient)
                    .map_err(|e| MessageError::new(ErrorKind::EncryptionFailed, e.to_string()))?;
                UnsignedEvent::new(
                    message.sender,
                    message.timestamp.timestamp(),
                    EventKind::DirectMessage,
                    envelope,
                )
                .tag(&[TAG_PUBKEY, &recipient.to_hex()])
            }
            (None, None) => {
                return Err(MessageError::invalid_input("message has no recipient"));
            }
        };
        self.inner
            .tracer
            .record(FlowRecord::new(FlowStage::Encrypted, "").message(message.local_id));

        if let Some(reply_to) = message.reply_to {
            unsigned = unsigned.tag(&[TAG_EVENT, &reply_to.to_hex(), "", "reply"]);
        }
        for attachment in &message.attachments {
            unsigned = unsigned.tag(&[TAG_ATTACHMENT, attachment]);
        }

        let event = self
            .inner
            .signer
            .sign(unsigned, identity)
            .map_err(|e| MessageError::new(ErrorKind::SignatureFailed, e.to_string()))?;
        self.inner.tracer.record(
            FlowRecord::new(FlowStage::Signed, "")
                .message(message.local_id)
                .event(event.id),
        );
        Ok(event)
    }

    /// Fan the event out to every open relay and collect `OK` frames until
    /// the quorum is met, every relay answered, or the deadline passed.
    async fn publish(&self, message: &Message, event: &Event) -> Result<AckOutcome, MessageError> {
        let config = &self.inner.config;
        let (registration, mut acks) = AckRegistration::register(&self.inner.acks, event.id);
        let started = Instant::now();

        let attempted = match self.inner.pool.send_to_open(&ClientMessage::event(event.clone())) {
            Ok(urls) => urls,
            Err(e) => {
                let kind = self.inner.monitor.classify(&e);
                warn!(local_id = %message.local_id, error = %e, "Publish failed");
                return Ok(AckOutcome {
                    send_error: Some(kind),
                    ..AckOutcome::default()
                });
            }
        };
        self.inner.tracer.record(
            FlowRecord::new(FlowStage::Published, format!("{} relays", attempted.len()))
                .message(message.local_id)
                .event(event.id),
        );

        let mut outcome = AckOutcome {
            attempted: attempted.len(),
            ..AckOutcome::default()
        };
        if attempted.is_empty() {
            outcome.send_error = Some(ErrorKind::AllRelaysFailed);
            return Ok(outcome);
        }

        let mut waiting: HashSet<String> = attempted.into_iter().collect();
        let deadline = started + config.ack_timeout;
        let quorum = config.acceptance_quorum.max(1);
        let mut timed_out = false;

        while !waiting.is_empty() && outcome.accepted < quorum {
            let ack = match tokio::time::timeout_at(deadline, acks.recv()).await {
                Ok(Some(ack)) => ack,
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            };
            self.note_ack(message, event, started, &mut waiting, &mut outcome, ack)?;
        }

        // Frames already queued are recorded here. Once the channel is
        // closed, later ones take the late acknowledgement path.
        drop(registration);
        acks.close();
        while let Ok(ack) = acks.try_recv() {
            self.note_ack(message, event, started, &mut waiting, &mut outcome, ack)?;
        }

        if timed_out {
            outcome.silent = waiting.len();
            for url in &waiting {
                self.inner.monitor.record_relay_failure(
                    url,
                    ErrorKind::RelayTimeout,
                    "no acknowledgement before deadline",
                );
            }
        }
        Ok(outcome)
    }

    fn note_ack(
        &self,
        message: &Message,
        event: &Event,
        started: Instant,
        waiting: &mut HashSet<String>,
        outcome: &mut AckOutcome,
        ack: RelayAck,
    ) -> Result<(), MessageError> {
        if !waiting.remove(&ack.relay_url) {
            return Ok(());
        }

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.db().record_relay_result(
            &message.local_id,
            &RelayResult {
                relay_url: ack.relay_url.clone(),
                success: ack.accepted,
                error: (!ack.accepted).then(|| ack.message.clone()),
                latency_ms: Some(latency_ms),
                recorded_at: Utc::now(),
            },
        )?;

        let stage = if ack.accepted {
            outcome.accepted += 1;
            FlowStage::RelayAccepted
        } else {
            outcome.rejected += 1;
            FlowStage::RelayRejected
        };
        self.inner.tracer.record(
            FlowRecord::new(stage, ack.message)
                .message(message.local_id)
                .event(event.id)
                .relay(&ack.relay_url),
        );
        Ok(())
    }

    /// Turn collected acknowledgements into the message's next status.
    fn settle(&self, message: Message, outcome: AckOutcome) -> Result<SendReceipt, MessageError> {
        let local_id = message.local_id;
        debug!(
            local_id = %local_id,
            attempted = outcome.attempted,
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            silent = outcome.silent,
            "Attempt finished"
        );

        if outcome.accepted >= self.inner.config.acceptance_quorum.max(1) {
            self.db()
                .finish_outgoing(&local_id, MessageStatus::Accepted, None)?;
            lock(&self.inner.scheduler).cancel(&local_id);
            self.trace_status(&message, MessageStatus::Accepted);
            self.emit_status(&message, MessageStatus::Accepted, None);
            return Ok(SendReceipt {
                status: MessageStatus::Accepted,
                error_kind: None,
                ..SendReceipt::of(&message)
            });
        }

        let (status, kind) = if let Some(kind) = outcome.send_error {
            (MessageStatus::Queued, kind)
        } else if outcome.rejected > 0 && outcome.accepted == 0 {
            (MessageStatus::Rejected, ErrorKind::AllRelaysFailed)
        } else {
            (MessageStatus::Queued, ErrorKind::RelayTimeout)
        };
        self.record_failure(message, status, kind)
    }

    fn record_failure(
        &self,
        message: Message,
        status: MessageStatus,
        kind: ErrorKind,
    ) -> Result<SendReceipt, MessageError> {
        let local_id = message.local_id;
        let attempts = self
            .db()
            .get_outbox_entry(&local_id)?
            .map(|entry| entry.attempts)
            .unwrap_or(0)
            + 1;

        let final_status = if attempts >= self.inner.config.max_attempts {
            self.db()
                .record_failed_attempt(&local_id, MessageStatus::Failed, kind.as_str(), attempts, None)?;
            self.db().remove_outbox_entry(&local_id)?;
            lock(&self.inner.scheduler).cancel(&local_id);
            warn!(local_id = %local_id, attempts, kind = %kind, "Giving up on message");
            MessageStatus::Failed
        } else {
            let next_attempt_at =
                lock(&self.inner.scheduler).schedule_after_failure(local_id, attempts, Utc::now());
            self.db().record_failed_attempt(
                &local_id,
                status,
                kind.as_str(),
                attempts,
                Some(next_attempt_at),
            )?;
            debug!(local_id = %local_id, attempts, next = %next_attempt_at, "Retry scheduled");
            status
        };

        self.trace_status(&message, final_status);
        self.emit_status(&message, final_status, Some(kind));
        Ok(SendReceipt {
            status: final_status,
            error_kind: Some(kind),
            ..SendReceipt::of(&message)
        })
    }

    /// Sign and send without tracking acknowledgements.
    fn publish_best_effort(&self, unsigned: UnsignedEvent) {
        if !self.inner.monitor.can_attempt_operation().allowed {
            debug!(kind = ?unsigned.kind, "Offline, not publishing");
            return;
        }
        let event = match self.inner.signer.sign(unsigned, &self.inner.identity) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to sign event");
                return;
            }
        };
        if let Err(e) = self.inner.pool.send_to_open(&ClientMessage::event(event)) {
            warn!(error = %e, "Failed to publish event");
        }
    }

    pub(crate) fn trace_status(&self, message: &Message, status: MessageStatus) {
        self.inner.tracer.record(
            FlowRecord::new(FlowStage::StatusChanged, status.as_str()).message(message.local_id),
        );
    }
}

fn validate_content(content: &str) -> Result<(), MessageError> {
    if content.trim().is_empty() {
        return Err(MessageError::invalid_input("message is empty"));
    }
    if content.len() > MAX_CONTENT_SIZE {
        return Err(MessageError::invalid_input(format!(
            "message is {} bytes, limit is {MAX_CONTENT_SIZE}",
            content.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_blank_and_oversized_content() {
        assert_eq!(
            validate_content("   \n").unwrap_err().kind,
            ErrorKind::InvalidInput
        );
        assert!(validate_content(&"x".repeat(MAX_CONTENT_SIZE + 1)).is_err());
        assert!(validate_content("hello").is_ok());
    }

    #[test]
    fn test_trigger_eligibility() {
        assert!(Trigger::Automatic
            .eligible()
            .contains(&MessageStatus::Rejected));
        assert!(!Trigger::Automatic.eligible().contains(&MessageStatus::Failed));
        assert!(Trigger::Manual.eligible().contains(&MessageStatus::Failed));
        assert!(!Trigger::Manual.eligible().contains(&MessageStatus::Accepted));
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let set = Mutex::new(HashSet::new());
        let id = LocalMessageId::new();

        let guard = InFlightGuard::acquire(&set, id);
        assert!(guard.is_some());
        assert!(InFlightGuard::acquire(&set, id).is_none());
        assert!(lock(&set).contains(&id));
        drop(guard);
        assert!(lock(&set).is_empty());
        assert!(InFlightGuard::acquire(&set, id).is_some());
    }
}
