//! Message codec: plaintext <-> encrypted envelope.
//!
//! Envelopes use the NIP-04 text layout `base64(ciphertext)?iv=base64(nonce)`
//! so they can travel as the `content` field of an event. The cipher is
//! XChaCha20-Poly1305 keyed from the X25519 agreement between the two
//! participants (direct messages) or a shared group key.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::constants::{MAX_CONTENT_SIZE, NONCE_SIZE};
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::types::PublicKey;

const IV_SEPARATOR: &str = "?iv=";

/// Encrypt/decrypt capability consumed by the delivery engine.
///
/// Implementations must be pure: no I/O, no state between calls. Malformed
/// input is reported through [`CryptoError`], never by panicking.
pub trait MessageCodec: Send + Sync {
    fn encrypt(
        &self,
        identity: &Identity,
        plaintext: &str,
        recipient: &PublicKey,
    ) -> Result<String, CryptoError>;

    fn decrypt(
        &self,
        identity: &Identity,
        envelope: &str,
        sender: &PublicKey,
    ) -> Result<String, CryptoError>;

    fn seal_group(&self, key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError>;

    fn open_group(&self, key: &SymmetricKey, envelope: &str) -> Result<String, CryptoError>;
}

/// Default codec used by the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMessageCodec;

impl MessageCodec for DirectMessageCodec {
    fn encrypt(
        &self,
        identity: &Identity,
        plaintext: &str,
        recipient: &PublicKey,
    ) -> Result<String, CryptoError> {
        let key = crypto::derive_dm_key(identity, recipient)?;
        seal(&key, plaintext)
    }

    fn decrypt(
        &self,
        identity: &Identity,
        envelope: &str,
        sender: &PublicKey,
    ) -> Result<String, CryptoError> {
        let key = crypto::derive_dm_key(identity, sender)?;
        open(&key, envelope)
    }

    fn seal_group(&self, key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
        seal(key, plaintext)
    }

    fn open_group(&self, key: &SymmetricKey, envelope: &str) -> Result<String, CryptoError> {
        open(key, envelope)
    }
}

fn seal(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    if plaintext.len() > MAX_CONTENT_SIZE {
        return Err(CryptoError::EncryptionFailed);
    }
    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::encrypt_with_nonce(key, &nonce, plaintext.as_bytes())?;
    Ok(format!(
        "{}{}{}",
        B64.encode(ciphertext),
        IV_SEPARATOR,
        B64.encode(nonce)
    ))
}

fn open(key: &SymmetricKey, envelope: &str) -> Result<String, CryptoError> {
    let (ct_b64, iv_b64) = envelope
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| CryptoError::MalformedEnvelope("missing iv".into()))?;

    let ciphertext = B64
        .decode(ct_b64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {e}")))?;
    let nonce = B64
        .decode(iv_b64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("iv: {e}")))?;
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "iv must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }

    let plaintext = crypto::decrypt_with_nonce(key, &nonce, &ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_envelope_opens_for_recipient_only() {
        let codec = DirectMessageCodec;
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();

        let envelope = codec.encrypt(&alice, "hi", &bob.public_key()).unwrap();
        assert!(envelope.contains(IV_SEPARATOR));

        assert_eq!(
            codec.decrypt(&bob, &envelope, &alice.public_key()).unwrap(),
            "hi"
        );
        assert_eq!(
            codec.decrypt(&eve, &envelope, &alice.public_key()),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_malformed_envelopes_are_errors() {
        let codec = DirectMessageCodec;
        let alice = Identity::generate();
        let bob = Identity::generate();

        for bad in ["", "no-iv-here", "!!!?iv=AAAA", "AAAA?iv=AAAA"] {
            assert!(matches!(
                codec.decrypt(&bob, bad, &alice.public_key()),
                Err(CryptoError::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn test_group_seal_open() {
        let codec = DirectMessageCodec;
        let key = crypto::generate_symmetric_key();

        let envelope = codec.seal_group(&key, "hello group").unwrap();
        assert_eq!(codec.open_group(&key, &envelope).unwrap(), "hello group");
        assert!(codec
            .open_group(&crypto::generate_symmetric_key(), &envelope)
            .is_err());
    }
}
