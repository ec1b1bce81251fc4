//! Connectivity monitor.
//!
//! Tracks two independent signals: whether the device is online and whether
//! at least one relay connection is open. The engine consults it before every
//! network operation and feeds it relay-level failures.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use murmur_net::NetError;

use crate::error::ErrorKind;

const RECENT_FAILURES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    pub is_online: bool,
    pub has_relay_connection: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

impl NetworkState {
    pub fn is_available(&self) -> bool {
        self.is_online && self.has_relay_connection
    }
}

/// Answer to "may I touch the network now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub allowed: bool,
    pub reason: String,
    /// Set when `allowed` is false.
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayFailure {
    pub relay_url: String,
    pub kind: ErrorKind,
    pub detail: String,
    pub at: DateTime<Utc>,
}

pub struct NetworkMonitor {
    state: watch::Sender<NetworkState>,
    failures: Mutex<VecDeque<RelayFailure>>,
}

impl NetworkMonitor {
    /// Start online without relay connections.
    pub fn new() -> Self {
        let (state, _) = watch::channel(NetworkState {
            is_online: true,
            has_relay_connection: false,
            last_online_at: Some(Utc::now()),
            last_offline_at: None,
        });
        Self {
            state,
            failures: Mutex::new(VecDeque::with_capacity(RECENT_FAILURES)),
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            state.is_online = online;
            if online {
                state.last_online_at = Some(Utc::now());
            } else {
                state.last_offline_at = Some(Utc::now());
            }
            true
        });
        info!(online, "Network state changed");
    }

    pub fn set_relay_connection(&self, connected: bool) {
        let changed = self.state.send_if_modified(|state| {
            if state.has_relay_connection == connected {
                return false;
            }
            state.has_relay_connection = connected;
            true
        });
        if changed {
            debug!(connected, "Relay connectivity changed");
        }
    }

    pub fn can_attempt_operation(&self) -> Availability {
        let state = self.state.borrow();
        if !state.is_online {
            Availability {
                allowed: false,
                reason: "Device is offline".into(),
                kind: Some(ErrorKind::NetworkOffline),
            }
        } else if !state.has_relay_connection {
            Availability {
                allowed: false,
                reason: "No relay connection is open".into(),
                kind: Some(ErrorKind::AllRelaysFailed),
            }
        } else {
            Availability {
                allowed: true,
                reason: "Ready".into(),
                kind: None,
            }
        }
    }

    /// Map a transport failure onto the error taxonomy.
    pub fn classify(&self, error: &NetError) -> ErrorKind {
        if !self.state.borrow().is_online {
            return ErrorKind::NetworkOffline;
        }
        match error {
            NetError::ConnectionTimeout(_) => ErrorKind::RelayTimeout,
            NetError::RelayUnavailable(_)
            | NetError::Connect(_)
            | NetError::Transport(_)
            | NetError::Closed
            | NetError::PoolClosed => ErrorKind::AllRelaysFailed,
            NetError::InvalidUrl(_) => ErrorKind::InvalidInput,
            NetError::Protocol(_) => ErrorKind::Unknown,
        }
    }

    pub fn record_relay_failure(&self, relay_url: &str, kind: ErrorKind, detail: &str) {
        warn!(relay = %relay_url, kind = %kind, detail, "Relay failure");
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failures.len() == RECENT_FAILURES {
            failures.pop_front();
        }
        failures.push_back(RelayFailure {
            relay_url: relay_url.to_string(),
            kind,
            detail: detail.to_string(),
            at: Utc::now(),
        });
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self) -> Vec<RelayFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
