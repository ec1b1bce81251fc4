// Inbound frames: acknowledgements, events, end-of-stored-events.

use chrono::Utc;
use tracing::{debug, trace, warn};

use murmur_net::InboundFrame;
use murmur_shared::event::TAG_EVENT;
use murmur_shared::{
    ConversationId, Event, EventId, EventKind, GroupId, LocalMessageId, PublicKey, RelayMessage,
};
use murmur_store::{Direction, Message, MessageStatus, RelayResult};

use super::outbound::InFlightGuard;
use super::{lock, unix_to_datetime, DeliveryEngine, RelayAck};
use crate::error::MessageError;
use crate::tracer::{FlowRecord, FlowStage};

/// Emoji recorded for a reaction event with empty content.
const DEFAULT_REACTION: &str = "+";

impl DeliveryEngine {
    pub(crate) fn handle_frame(&self, frame: InboundFrame) {
        let relay_url = frame.relay_url;
        match frame.message {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.handle_ack(
                event_id,
                RelayAck {
                    relay_url,
                    accepted,
                    message,
                },
            ),
            RelayMessage::Event {
                subscription_id,
                event,
            } => match self.handle_event(&relay_url, *event) {
                Ok(true) => self.count_sync_message(&subscription_id),
                Ok(false) => {}
                Err(e) => warn!(relay = %relay_url, error = %e, "Failed to store incoming event"),
            },
            RelayMessage::Eose(subscription_id) => self.note_eose(&subscription_id, &relay_url),
            RelayMessage::Notice(notice) => debug!(relay = %relay_url, notice = %notice, "Relay notice"),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => warn!(
                relay = %relay_url,
                subscription_id = %subscription_id,
                reason = %message,
                "Subscription closed by relay"
            ),
        }
    }

    fn handle_ack(&self, event_id: EventId, ack: RelayAck) {
        let waiting = lock(&self.inner.acks).get(&event_id).cloned();
        let ack = match waiting {
            Some(tx) => match tx.send(ack) {
                Ok(()) => return,
                Err(returned) => returned.0,
            },
            None => ack,
        };
        if let Err(e) = self.record_late_ack(&event_id, ack) {
            warn!(event_id = %event_id.short(), error = %e, "Failed to record late acknowledgement");
        }
    }

    /// An `OK` that arrived after its attempt stopped listening. The result is
    /// recorded; a success also rescues a message still waiting for a retry.
    fn record_late_ack(&self, event_id: &EventId, ack: RelayAck) -> Result<(), MessageError> {
        let Some(message) = self.db().get_message_by_event_id(event_id)? else {
            trace!(event_id = %event_id.short(), "Acknowledgement for unknown event");
            return Ok(());
        };
        if message.direction != Direction::Outgoing {
            return Ok(());
        }

        self.db().record_relay_result(
            &message.local_id,
            &RelayResult {
                relay_url: ack.relay_url.clone(),
                success: ack.accepted,
                error: (!ack.accepted).then(|| ack.message.clone()),
                latency_ms: None,
                recorded_at: Utc::now(),
            },
        )?;
        debug!(
            local_id = %message.local_id,
            relay = %ack.relay_url,
            accepted = ack.accepted,
            "Late relay acknowledgement"
        );
        if !ack.accepted {
            return Ok(());
        }

        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, message.local_id) else {
            return Ok(());
        };
        let upgraded = self.db().transition_status(
            &message.local_id,
            &[MessageStatus::Queued, MessageStatus::Rejected],
            MessageStatus::Accepted,
            None,
        )?;
        if upgraded {
            self.db().remove_outbox_entry(&message.local_id)?;
            lock(&self.inner.scheduler).cancel(&message.local_id);
            self.trace_status(&message, MessageStatus::Accepted);
            self.emit_status(&message, MessageStatus::Accepted, None);
        }
        Ok(())
    }

    /// Returns `true` if the event added a new message.
    pub(crate) fn handle_event(&self, relay_url: &str, event: Event) -> Result<bool, MessageError> {
        if let Err(e) = event.verify() {
            self.discard(relay_url, &event, &format!("verification failed: {e}"));
            return Ok(false);
        }
        match event.kind {
            EventKind::DirectMessage => self.receive_direct(relay_url, event),
            EventKind::GroupMessage => self.receive_group(relay_url, event),
            EventKind::Reaction => {
                self.receive_reaction(&event)?;
                Ok(false)
            }
            EventKind::Deletion => {
                self.receive_deletion(&event)?;
                Ok(false)
            }
            other => {
                self.discard(relay_url, &event, &format!("unhandled kind {}", other.as_u16()));
                Ok(false)
            }
        }
    }

    fn receive_direct(&self, relay_url: &str, event: Event) -> Result<bool, MessageError> {
        let me = self.public_key();
        if !event.is_addressed_to(&me) {
            self.discard(relay_url, &event, "not addressed to us");
            return Ok(false);
        }
        if self.is_duplicate(relay_url, &event)? {
            return Ok(false);
        }

        let content = match self.inner.codec.decrypt(&self.inner.identity, &event.content, &event.pubkey) {
            Ok(content) => content,
            Err(e) => {
                debug!(relay = %relay_url, event_id = %event.id.short(), error = %e, "Could not decrypt");
                self.inner.tracer.record(
                    FlowRecord::new(FlowStage::DecryptFailed, e.to_string())
                        .event(event.id)
                        .relay(relay_url),
                );
                return Ok(false);
            }
        };

        let message = incoming_message(
            ConversationId::direct(&me, &event.pubkey),
            Some(me),
            None,
            content,
            &event,
        );
        self.store_incoming(relay_url, message)
    }

    fn receive_group(&self, relay_url: &str, event: Event) -> Result<bool, MessageError> {
        let Some(group_id) = event.group_id() else {
            self.discard(relay_url, &event, "group message without group tag");
            return Ok(false);
        };
        let Some(key) = self.db().group_key(&group_id)? else {
            self.discard(relay_url, &event, "unknown group");
            return Ok(false);
        };
        if self.is_duplicate(relay_url, &event)? {
            return Ok(false);
        }

        let content = match self.inner.codec.open_group(&key, &event.content) {
            Ok(content) => content,
            Err(e) => {
                self.inner.tracer.record(
                    FlowRecord::new(FlowStage::DecryptFailed, e.to_string())
                        .event(event.id)
                        .relay(relay_url),
                );
                return Ok(false);
            }
        };

        let mut message = incoming_message(
            ConversationId::group(&group_id),
            None,
            Some(group_id),
            content,
            &event,
        );
        // Our own message sent from another device.
        if event.pubkey == self.public_key() {
            message.direction = Direction::Outgoing;
            message.status = MessageStatus::Accepted;
        }
        self.store_incoming(relay_url, message)
    }

    fn receive_reaction(&self, event: &Event) -> Result<(), MessageError> {
        let Some(target) = event.referenced_event() else {
            return Ok(());
        };
        let Some(message) = self.db().get_message_by_event_id(&target)? else {
            trace!(target = %target.short(), "Reaction to unknown message");
            return Ok(());
        };
        let emoji = if event.content.trim().is_empty() {
            DEFAULT_REACTION
        } else {
            event.content.as_str()
        };
        self.db().add_reaction(&message.local_id, &event.pubkey, emoji)?;
        Ok(())
    }

    fn receive_deletion(&self, event: &Event) -> Result<(), MessageError> {
        for hex in event.tag_values(TAG_EVENT) {
            let Ok(target) = EventId::from_hex(hex) else {
                continue;
            };
            let Some(message) = self.db().get_message_by_event_id(&target)? else {
                continue;
            };
            // Only the author may delete.
            if message.sender == event.pubkey {
                self.db().soft_delete_message(&message.local_id)?;
            }
        }
        Ok(())
    }

    fn is_duplicate(&self, relay_url: &str, event: &Event) -> Result<bool, MessageError> {
        if self.db().has_event(&event.id)? {
            self.inner.tracer.record(
                FlowRecord::new(FlowStage::Duplicate, "")
                    .event(event.id)
                    .relay(relay_url),
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn store_incoming(&self, relay_url: &str, message: Message) -> Result<bool, MessageError> {
        if !self.db().insert_message(&message)? {
            return Ok(false);
        }
        let inserted = self.with_log(&message.conversation_id, |log| {
            log.insert(message.local_id, message.event_id, message.timestamp)
        })?;
        if !inserted {
            trace!(local_id = %message.local_id, "Already in conversation log");
        }

        let mut record = FlowRecord::new(FlowStage::Received, message.conversation_id.as_str())
            .message(message.local_id)
            .relay(relay_url);
        if let Some(event_id) = message.event_id {
            record = record.event(event_id);
        }
        self.inner.tracer.record(record);
        debug!(
            conversation = %message.conversation_id,
            from = %message.sender.short(),
            "Message received"
        );

        let _ = self.inner.incoming_tx.send(message);
        Ok(true)
    }

    fn discard(&self, relay_url: &str, event: &Event, reason: &str) {
        trace!(relay = %relay_url, event_id = %event.id.short(), reason, "Discarding event");
        self.inner.tracer.record(
            FlowRecord::new(FlowStage::Discarded, reason)
                .event(event.id)
                .relay(relay_url),
        );
    }
}

fn incoming_message(
    conversation_id: ConversationId,
    recipient: Option<PublicKey>,
    group_id: Option<GroupId>,
    content: String,
    event: &Event,
) -> Message {
    Message {
        local_id: LocalMessageId::new(),
        event_id: Some(event.id),
        conversation_id,
        sender: event.pubkey,
        recipient,
        group_id,
        content,
        timestamp: unix_to_datetime(event.created_at),
        direction: Direction::Incoming,
        status: MessageStatus::Delivered,
        reply_to: event.referenced_event(),
        attachments: event.attachments(),
        deleted_at: None,
        retry_count: 0,
        error_kind: None,
        signed_event: Some(event.clone()),
    }
}
