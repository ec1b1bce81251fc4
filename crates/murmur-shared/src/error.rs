use thiserror::Error;

#[derive(Error, Debug)]
pub enum MurmurError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid hex key: {0}")]
    InvalidHex(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Event serialization failed: {0}")]
    Serialization(String),

    #[error("Event author does not match the signing identity")]
    AuthorMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown frame type: {0}")]
    UnknownFrame(String),

    #[error("Event id does not match event content")]
    InvalidEventId,

    #[error("Event signature is invalid")]
    InvalidSignature,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
