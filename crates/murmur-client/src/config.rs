//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts with zero configuration.
//! Invalid values are logged and replaced by the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_net::PoolConfig;
use murmur_shared::constants::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_LISTENER_CAPACITY,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RELAYS, RECONNECT_BASE_MS, RECONNECT_MAX_MS, RETRY_BASE_MS,
    RETRY_MAX_MS,
};

use crate::engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URLs.
    /// Env: `MURMUR_RELAYS` (comma-separated)
    pub relays: Vec<String>,

    /// Database file. `None` uses the platform data directory.
    /// Env: `MURMUR_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Per-relay acknowledgement deadline.
    /// Env: `MURMUR_ACK_TIMEOUT_MS`
    /// Default: 5000
    pub ack_timeout: Duration,

    /// Automatic attempts before a message is marked failed.
    /// Env: `MURMUR_MAX_ATTEMPTS`
    /// Default: 5
    pub max_attempts: u32,

    /// Env: `MURMUR_CONNECT_TIMEOUT_MS`
    /// Default: 10000
    pub connect_timeout: Duration,

    /// Scheduled retry backoff.
    /// Env: `MURMUR_RETRY_BASE_MS` / `MURMUR_RETRY_MAX_MS`
    /// Default: 2000 / 60000
    pub retry_base: Duration,
    pub retry_max: Duration,

    /// Relay reconnect backoff.
    /// Env: `MURMUR_RECONNECT_BASE_MS` / `MURMUR_RECONNECT_MAX_MS`
    /// Default: 1000 / 60000
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,

    /// Queue depth of each relay-frame listener.
    /// Env: `MURMUR_LISTENER_CAPACITY`
    /// Default: 256
    pub listener_capacity: usize,

    /// Successful relay acknowledgements needed for `accepted`.
    /// Env: `MURMUR_ACCEPTANCE_QUORUM`
    /// Default: 1
    pub acceptance_quorum: usize,

    /// Deadline for a historical sync to collect `EOSE` from every relay.
    /// Env: `MURMUR_SYNC_TIMEOUT_MS`
    /// Default: 10000
    pub sync_timeout: Duration,

    /// Hex secret key, used by the CLI only.
    /// Env: `MURMUR_SECRET_KEY`
    pub secret_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            db_path: None,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            retry_base: Duration::from_millis(RETRY_BASE_MS),
            retry_max: Duration::from_millis(RETRY_MAX_MS),
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            acceptance_quorum: 1,
            sync_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            secret_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(relays) = lookup("MURMUR_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if relays.is_empty() {
                tracing::warn!("MURMUR_RELAYS is empty, using default relays");
            } else {
                config.relays = relays;
            }
        }

        if let Some(path) = lookup("MURMUR_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "MURMUR_MAX_ATTEMPTS") {
            if n == 0 {
                tracing::warn!("MURMUR_MAX_ATTEMPTS must be at least 1, using default");
            } else {
                config.max_attempts = n;
            }
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_RETRY_BASE_MS") {
            config.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_RETRY_MAX_MS") {
            config.retry_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_RECONNECT_BASE_MS") {
            config.reconnect_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_RECONNECT_MAX_MS") {
            config.reconnect_max = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MURMUR_LISTENER_CAPACITY") {
            config.listener_capacity = n.max(1);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MURMUR_ACCEPTANCE_QUORUM") {
            config.acceptance_quorum = n.max(1);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "MURMUR_SYNC_TIMEOUT_MS") {
            config.sync_timeout = Duration::from_millis(ms);
        }

        config.secret_key = lookup("MURMUR_SECRET_KEY");

        config
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
            listener_capacity: self.listener_capacity,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ack_timeout: self.ack_timeout,
            max_attempts: self.max_attempts,
            acceptance_quorum: self.acceptance_quorum,
            retry_base: self.retry_base,
            retry_max: self.retry_max,
            sync_timeout: self.sync_timeout,
            ..EngineConfig::default()
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.acceptance_quorum, 1);
        assert!(!config.relays.is_empty());
    }

    #[test]
    fn test_reads_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_RELAYS", "wss://a.test, wss://b.test,"),
            ("MURMUR_ACK_TIMEOUT_MS", "250"),
            ("MURMUR_MAX_ATTEMPTS", "3"),
            ("MURMUR_DB_PATH", "/tmp/murmur.db"),
        ]));
        assert_eq!(config.relays, vec!["wss://a.test", "wss://b.test"]);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/murmur.db")));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_ACK_TIMEOUT_MS", "soon"),
            ("MURMUR_MAX_ATTEMPTS", "0"),
        ]));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 5);
    }
}
