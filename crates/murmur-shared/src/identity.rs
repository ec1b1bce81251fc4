use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

use crate::error::{CryptoError, IdentityError};
use crate::types::PublicKey;

/// A user's cryptographic identity based on Ed25519.
/// The public key is the address other users send to.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore identity from a 64-char hex secret
    pub fn from_secret_hex(hex_key: &str) -> Result<Self, IdentityError> {
        let bytes =
            hex::decode(hex_key.trim()).map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 agreement between this identity and a peer's Ed25519 key,
    /// using the birational map to Montgomery form.
    pub fn shared_secret(&self, peer: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let peer_key = VerifyingKey::from_bytes(&peer.0)
            .map_err(|_| CryptoError::KeyAgreement("peer key is not a curve point".into()))?;
        let peer_x = x25519_dalek::PublicKey::from(peer_key.to_montgomery().to_bytes());
        let own_x = StaticSecret::from(self.signing_key.to_scalar_bytes());
        let shared = own_x.diffie_hellman(&peer_x);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement("low-order peer key".into()));
        }
        Ok(*shared.as_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidKeyBytes)
}
