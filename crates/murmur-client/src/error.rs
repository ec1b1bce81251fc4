//! Delivery error taxonomy.
//!
//! Every failure the engine surfaces is a [`MessageError`]: a fixed
//! [`ErrorKind`], technical detail for logs, and the user-facing text and
//! recovery actions derived from the kind.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use murmur_net::NetError;
use murmur_shared::LocalMessageId;
use murmur_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkOffline,
    AllRelaysFailed,
    EncryptionFailed,
    DecryptionFailed,
    SignatureFailed,
    StorageFailed,
    InvalidInput,
    RelayTimeout,
    Unknown,
}

/// What a user can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    ViewQueue,
    Reconnect,
    ClearCache,
    Dismiss,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkOffline => "network_offline",
            Self::AllRelaysFailed => "all_relays_failed",
            Self::EncryptionFailed => "encryption_failed",
            Self::DecryptionFailed => "decryption_failed",
            Self::SignatureFailed => "signature_failed",
            Self::StorageFailed => "storage_failed",
            Self::InvalidInput => "invalid_input",
            Self::RelayTimeout => "relay_timeout",
            Self::Unknown => "unknown",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::NetworkOffline => {
                "You're offline. Your message is saved and will be sent when you reconnect."
            }
            Self::AllRelaysFailed => "No relay accepted the message. It will be retried.",
            Self::EncryptionFailed => "The message could not be encrypted and was not sent.",
            Self::DecryptionFailed => "A message could not be decrypted.",
            Self::SignatureFailed => "The message could not be signed and was not sent.",
            Self::StorageFailed => "Local storage failed. Try again or clear the cache.",
            Self::InvalidInput => "The message or recipient is invalid.",
            Self::RelayTimeout => "Relays did not respond in time. The message is queued.",
            Self::Unknown => "Something went wrong.",
        }
    }

    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::NetworkOffline
                | Self::AllRelaysFailed
                | Self::RelayTimeout
                | Self::StorageFailed
                | Self::Unknown
        )
    }

    /// Transient kinds retried automatically up to the attempt ceiling.
    pub fn is_auto_retried(self) -> bool {
        matches!(
            self,
            Self::NetworkOffline | Self::AllRelaysFailed | Self::RelayTimeout
        )
    }

    pub fn recovery_actions(self) -> &'static [RecoveryAction] {
        use RecoveryAction::*;
        match self {
            Self::NetworkOffline => &[ViewQueue, Dismiss],
            Self::AllRelaysFailed => &[Retry, Reconnect, Dismiss],
            Self::RelayTimeout => &[Retry, Reconnect, ViewQueue],
            Self::StorageFailed => &[ClearCache, Retry, Dismiss],
            Self::Unknown => &[Retry, Dismiss],
            Self::EncryptionFailed
            | Self::DecryptionFailed
            | Self::SignatureFailed
            | Self::InvalidInput => &[Dismiss],
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "network_offline" => Self::NetworkOffline,
            "all_relays_failed" => Self::AllRelaysFailed,
            "encryption_failed" => Self::EncryptionFailed,
            "decryption_failed" => Self::DecryptionFailed,
            "signature_failed" => Self::SignatureFailed,
            "storage_failed" => Self::StorageFailed,
            "invalid_input" => Self::InvalidInput,
            "relay_timeout" => Self::RelayTimeout,
            "unknown" => Self::Unknown,
            _ => return Err(()),
        })
    }
}

/// A structured delivery error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct MessageError {
    pub kind: ErrorKind,
    pub detail: String,
    pub message_id: Option<LocalMessageId>,
}

impl MessageError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            message_id: None,
        }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, detail)
    }

    pub fn for_message(mut self, local_id: LocalMessageId) -> Self {
        self.message_id = Some(local_id);
        self
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    pub fn recovery_actions(&self) -> &'static [RecoveryAction] {
        self.kind.recovery_actions()
    }
}

impl From<StoreError> for MessageError {
    fn from(e: StoreError) -> Self {
        Self::new(ErrorKind::StorageFailed, e.to_string())
    }
}

impl From<NetError> for MessageError {
    fn from(e: NetError) -> Self {
        let kind = match &e {
            NetError::ConnectionTimeout(_) => ErrorKind::RelayTimeout,
            NetError::RelayUnavailable(_) | NetError::PoolClosed => ErrorKind::AllRelaysFailed,
            NetError::InvalidUrl(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, e.to_string())
    }
}
