/// Application name
pub const APP_NAME: &str = "murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Event id size in bytes (BLAKE3 digest)
pub const EVENT_ID_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum plaintext size of a single message in bytes (64 KiB)
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DM_KEY: &str = "murmur-dm-key-v1";
pub const KDF_CONTEXT_GROUP_KEY: &str = "murmur-group-key-v1";

/// Attempts (initial send included) before an outgoing message is failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How long to wait for relay `OK` frames after publishing
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// How long `wait_for_connection` waits by default
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Reconnect backoff bounds for a single relay connection
pub const RECONNECT_BASE_MS: u64 = 1_000;
pub const RECONNECT_MAX_MS: u64 = 60_000;

/// Retry backoff bounds for outbox entries
pub const RETRY_BASE_MS: u64 = 2_000;
pub const RETRY_MAX_MS: u64 = 60_000;

/// Per-listener inbound frame queue depth
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Subscription id used for the live direct-message feed
pub const LIVE_SUBSCRIPTION_ID: &str = "murmur-live";

/// Relays used when nothing is configured
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.nostr.band"];
