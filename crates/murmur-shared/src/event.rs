//! Signed relay events.
//!
//! An event id is the BLAKE3 digest of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`, so the same input always
//! yields the same id. The signature is Ed25519 over the id bytes.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::constants::SIGNATURE_SIZE;
use crate::error::{ProtocolError, SigningError};
use crate::identity::{verify_signature, Identity};
use crate::types::{EventId, GroupId, PublicKey};

/// Event kinds this client understands. Anything else is carried as
/// `Other` and ignored by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum EventKind {
    Metadata,
    DirectMessage,
    Deletion,
    Reaction,
    GroupMessage,
    JoinRequest,
    Other(u16),
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Metadata => 0,
            Self::DirectMessage => 4,
            Self::Deletion => 5,
            Self::Reaction => 7,
            Self::GroupMessage => 9,
            Self::JoinRequest => 9021,
            Self::Other(k) => k,
        }
    }
}

impl From<u16> for EventKind {
    fn from(k: u16) -> Self {
        match k {
            0 => Self::Metadata,
            4 => Self::DirectMessage,
            5 => Self::Deletion,
            7 => Self::Reaction,
            9 => Self::GroupMessage,
            9021 => Self::JoinRequest,
            other => Self::Other(other),
        }
    }
}

impl From<EventKind> for u16 {
    fn from(k: EventKind) -> Self {
        k.as_u16()
    }
}

pub const TAG_PUBKEY: &str = "p";
pub const TAG_EVENT: &str = "e";
pub const TAG_GROUP: &str = "g";
pub const TAG_ATTACHMENT: &str = "attachment";

/// An event before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: EventKind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: PublicKey, created_at: i64, kind: EventKind, content: String) -> Self {
        Self {
            pubkey,
            created_at,
            kind,
            tags: Vec::new(),
            content,
        }
    }

    pub fn tag(mut self, values: &[&str]) -> Self {
        self.tags
            .push(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn id(&self) -> Result<EventId, SigningError> {
        canonical_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
        .map_err(|e| SigningError::Serialization(e.to_string()))
    }
}

/// A signed event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: EventKind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Iterate the first value of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn first_tag<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// The `p`-tagged recipient, if any.
    pub fn recipient(&self) -> Option<PublicKey> {
        self.first_tag(TAG_PUBKEY)
            .and_then(|hex| PublicKey::from_hex(hex).ok())
    }

    pub fn is_addressed_to(&self, key: &PublicKey) -> bool {
        let hex = key.to_hex();
        self.tag_values(TAG_PUBKEY).any(|v| v == hex)
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.first_tag(TAG_GROUP).map(GroupId::new)
    }

    /// The referenced event (reply target or reaction target).
    pub fn referenced_event(&self) -> Option<EventId> {
        self.first_tag(TAG_EVENT)
            .and_then(|hex| EventId::from_hex(hex).ok())
    }

    pub fn attachments(&self) -> Vec<String> {
        self.tag_values(TAG_ATTACHMENT).map(str::to_string).collect()
    }

    /// Check that the id matches the content and the signature matches the id.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let expected = canonical_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(ProtocolError::InvalidEventId);
        }

        let sig_bytes = hex::decode(&self.sig).map_err(|_| ProtocolError::InvalidSignature)?;
        let sig_arr: [u8; SIGNATURE_SIZE] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_arr);
        verify_signature(&self.pubkey, &self.id.0, &signature)
            .map_err(|_| ProtocolError::InvalidSignature)
    }
}

fn canonical_id(
    pubkey: &PublicKey,
    created_at: i64,
    kind: EventKind,
    tags: &[Vec<String>],
    content: &str,
) -> Result<EventId, serde_json::Error> {
    let canonical = serde_json::to_string(&serde_json::json!([
        0,
        pubkey.to_hex(),
        created_at,
        kind.as_u16(),
        tags,
        content,
    ]))?;
    Ok(EventId(*blake3::hash(canonical.as_bytes()).as_bytes()))
}

/// Signing capability consumed by the delivery engine.
pub trait EventSigner: Send + Sync {
    fn sign(&self, unsigned: UnsignedEvent, identity: &Identity) -> Result<Event, SigningError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Signer;

impl EventSigner for Ed25519Signer {
    fn sign(&self, unsigned: UnsignedEvent, identity: &Identity) -> Result<Event, SigningError> {
        if unsigned.pubkey != identity.public_key() {
            return Err(SigningError::AuthorMismatch);
        }
        let id = unsigned.id()?;
        let sig = identity.sign(&id.0);

        Ok(Event {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &Identity, to: &PublicKey) -> UnsignedEvent {
        UnsignedEvent::new(
            identity.public_key(),
            1_700_000_000,
            EventKind::DirectMessage,
            "ciphertext?iv=nonce".into(),
        )
        .tag(&[TAG_PUBKEY, &to.to_hex()])
    }

    #[test]
    fn test_event_id_is_stable() {
        let alice = Identity::generate();
        let bob = Identity::generate().public_key();

        let a = Ed25519Signer.sign(sample(&alice, &bob), &alice).unwrap();
        let b = Ed25519Signer.sign(sample(&alice, &bob), &alice).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.verify().is_ok());
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let alice = Identity::generate();
        let bob = Identity::generate().public_key();
        let mut event = Ed25519Signer.sign(sample(&alice, &bob), &alice).unwrap();

        event.content.push('x');
        assert_eq!(event.verify(), Err(ProtocolError::InvalidEventId));
    }

    #[test]
    fn test_signer_rejects_foreign_author() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let bob = Identity::generate().public_key();

        assert_eq!(
            Ed25519Signer.sign(sample(&alice, &bob), &mallory),
            Err(SigningError::AuthorMismatch)
        );
    }

    #[test]
    fn test_addressing_tags() {
        let alice = Identity::generate();
        let bob = Identity::generate().public_key();
        let event = Ed25519Signer.sign(sample(&alice, &bob), &alice).unwrap();

        assert!(event.is_addressed_to(&bob));
        assert!(!event.is_addressed_to(&alice.public_key()));
        assert_eq!(event.recipient(), Some(bob));
    }

    #[test]
    fn test_first_tag_with_borrowed_name() {
        let alice = Identity::generate();
        let bob = Identity::generate().public_key();
        let unsigned = sample(&alice, &bob)
            .tag(&[TAG_GROUP, "book-club"])
            .tag(&[TAG_GROUP, "later"]);
        let event = Ed25519Signer.sign(unsigned, &alice).unwrap();

        let name = String::from(TAG_GROUP);
        assert_eq!(event.first_tag(&name), Some("book-club"));
        assert_eq!(event.first_tag("missing"), None);
        assert_eq!(event.group_id(), Some(GroupId::new("book-club")));
    }

    #[test]
    fn test_unknown_kind_decodes_as_other() {
        assert_eq!(EventKind::from(30023), EventKind::Other(30023));
        assert_eq!(EventKind::from(4), EventKind::DirectMessage);
        assert_eq!(u16::from(EventKind::GroupMessage), 9);
    }
}
