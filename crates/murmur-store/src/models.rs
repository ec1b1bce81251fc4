//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_shared::{ConversationId, Event, EventId, GroupId, LocalMessageId, PublicKey};

// ---------------------------------------------------------------------------
// Message status
// ---------------------------------------------------------------------------

/// Delivery status of a message.
///
/// Outgoing messages move through the lifecycle below; incoming messages are
/// stored as `Delivered`.
///
/// ```text
/// sending  -> queued | accepted | rejected | failed
/// queued   -> sending | cancelled
/// rejected -> sending | cancelled
/// accepted -> delivered
/// failed   -> sending            (manual retry only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Queued,
    Accepted,
    Delivered,
    Rejected,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Queued => "queued",
            Self::Accepted => "accepted",
            Self::Delivered => "delivered",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal for the outbox: the entry is removed once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Delivered | Self::Failed | Self::Cancelled
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Queued | Accepted | Rejected | Failed)
                | (Queued, Sending | Cancelled | Failed)
                | (Rejected, Sending | Cancelled | Failed)
                | (Accepted, Delivered)
                | (Failed, Sending)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sending" => Self::Sending,
            "queued" => Self::Queued,
            "accepted" => Self::Accepted,
            "delivered" => Self::Delivered,
            "rejected" => Self::Rejected,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(UnknownVariant(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outgoing" => Ok(Self::Outgoing),
            "incoming" => Ok(Self::Incoming),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message in the local-intent log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub local_id: LocalMessageId,
    /// Set once the event is signed, never changed afterwards.
    pub event_id: Option<EventId>,
    pub conversation_id: ConversationId,
    pub sender: PublicKey,
    pub recipient: Option<PublicKey>,
    pub group_id: Option<GroupId>,
    /// Plaintext. Only the encrypted envelope ever leaves the device.
    pub content: String,
    /// Creation time; the ordering key.
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub status: MessageStatus,
    pub reply_to: Option<EventId>,
    pub attachments: Vec<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Error kind of the last failure, if any.
    pub error_kind: Option<String>,
    pub signed_event: Option<Event>,
}

impl Message {
    /// A new outgoing direct message in `sending` state.
    pub fn outgoing_direct(sender: PublicKey, recipient: PublicKey, content: String) -> Self {
        Self {
            local_id: LocalMessageId::new(),
            event_id: None,
            conversation_id: ConversationId::direct(&sender, &recipient),
            sender,
            recipient: Some(recipient),
            group_id: None,
            content,
            timestamp: Utc::now(),
            direction: Direction::Outgoing,
            status: MessageStatus::Sending,
            reply_to: None,
            attachments: Vec::new(),
            deleted_at: None,
            retry_count: 0,
            error_kind: None,
            signed_event: None,
        }
    }

    /// A new outgoing group message in `sending` state.
    pub fn outgoing_group(sender: PublicKey, group_id: GroupId, content: String) -> Self {
        Self {
            conversation_id: ConversationId::group(&group_id),
            recipient: None,
            group_id: Some(group_id),
            ..Self::outgoing_direct(sender, sender, content)
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Relay result
// ---------------------------------------------------------------------------

/// Outcome reported by one relay for one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayResult {
    pub relay_url: String,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Pending work for an outgoing message that has not reached a terminal
/// status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub local_id: LocalMessageId,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(local_id: LocalMessageId) -> Self {
        Self {
            local_id,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}
