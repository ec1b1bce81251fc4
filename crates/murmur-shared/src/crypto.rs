//! Symmetric primitives behind the message codec: XChaCha20-Poly1305 with
//! detached nonces, and BLAKE3 key derivation for direct and group keys.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_DM_KEY, KDF_CONTEXT_GROUP_KEY, NONCE_SIZE};
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::types::{GroupId, PublicKey};

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under `key`. The nonce travels separately in the envelope.
pub fn encrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(key.into())
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn decrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Pairwise DM key over the X25519 shared secret. Both sides derive the same key.
pub fn derive_dm_key(identity: &Identity, peer: &PublicKey) -> Result<SymmetricKey, CryptoError> {
    let shared = identity.shared_secret(peer)?;
    Ok(blake3::derive_key(KDF_CONTEXT_DM_KEY, &shared))
}

pub fn derive_group_key(shared_secret: &[u8], group_id: &GroupId) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_GROUP_KEY);
    hasher.update(shared_secret);
    hasher.update(group_id.as_str().as_bytes());
    *hasher.finalize().as_bytes()
}
