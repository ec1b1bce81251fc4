use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{EVENT_ID_SIZE, PUBKEY_SIZE};
use crate::error::{IdentityError, ProtocolError};

// User identity = Ed25519 public key (32 bytes), hex on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(pub [u8; PUBKEY_SIZE]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex key and check that it is a valid curve point.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
        if bytes.len() != PUBKEY_SIZE {
            return Err(IdentityError::InvalidHex(format!(
                "expected {} bytes, got {}",
                PUBKEY_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; PUBKEY_SIZE];
        arr.copy_from_slice(&bytes);
        VerifyingKey::from_bytes(&arr).map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<PublicKey> for String {
    fn from(pk: PublicKey) -> Self {
        pk.to_hex()
    }
}

/// Network event id: BLAKE3 digest of the canonical event serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(pub [u8; EVENT_ID_SIZE]);

impl EventId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes =
            hex::decode(s).map_err(|e| ProtocolError::Malformed(format!("event id: {e}")))?;
        if bytes.len() != EVENT_ID_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "event id must be {} bytes",
                EVENT_ID_SIZE
            )));
        }
        let mut arr = [0u8; EVENT_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for EventId {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.to_hex()
    }
}

/// Locally generated message id, assigned before any event exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(pub Uuid);

impl LocalMessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for LocalMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversation key. DMs use the sorted participant pair so both sides
/// derive the same id; groups use the group identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn direct(a: &PublicKey, b: &PublicKey) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{}:{}", lo.to_hex(), hi.to_hex()))
    }

    pub fn group(group_id: &GroupId) -> Self {
        Self(format!("group:{}", group_id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
