//! Shared building blocks for the murmur client: identifiers, identity keys,
//! the direct-message codec, event signing and the relay wire protocol.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod types;

pub use codec::{DirectMessageCodec, MessageCodec};
pub use error::{CryptoError, IdentityError, MurmurError, ProtocolError, SigningError};
pub use event::{Ed25519Signer, Event, EventKind, EventSigner, UnsignedEvent};
pub use identity::Identity;
pub use protocol::{ClientMessage, Filter, RelayMessage};
pub use types::{ConversationId, EventId, GroupId, LocalMessageId, PublicKey};
