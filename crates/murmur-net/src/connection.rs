//! A single relay session and its reconnect loop.
//!
//! Each relay gets one long-lived tokio task. The task owns the sink/stream
//! pair, replays the pool's persistent subscriptions after every successful
//! open, and reconnects with capped exponential backoff. Backoff state lives
//! only in the task and resets after a successful open.

use std::sync::Weak;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::pool::PoolShared;

/// Health of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayHealth {
    Connecting,
    Open,
    Error,
}

/// Snapshot of one relay for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub health: RelayHealth,
    /// Ephemeral connections (discovery) are not reconnected.
    pub transient: bool,
}

pub(crate) struct ConnectionHandle {
    pub(crate) transient: bool,
    pub(crate) health: watch::Receiver<RelayHealth>,
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) task: tokio::task::JoinHandle<()>,
}

impl ConnectionHandle {
    pub(crate) fn is_open(&self) -> bool {
        *self.health.borrow() == RelayHealth::Open
    }
}

pub(crate) async fn run_connection(
    url: String,
    transient: bool,
    shared: Weak<PoolShared>,
    health_tx: watch::Sender<RelayHealth>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let (connector, mut backoff) = match shared.upgrade() {
        Some(pool) => (
            pool.connector.clone(),
            Backoff::new(pool.config.reconnect_base, pool.config.reconnect_max),
        ),
        None => return,
    };

    loop {
        if shared.strong_count() == 0 {
            return;
        }
        set_health(&shared, &url, &health_tx, RelayHealth::Connecting);

        match connector.connect(&url).await {
            Ok((mut sink, mut stream)) => {
                backoff.reset();

                let replay = match shared.upgrade() {
                    Some(pool) => pool.subscription_frames(),
                    None => return,
                };
                let mut replayed = true;
                for frame in replay {
                    if let Err(e) = sink.send(frame).await {
                        warn!(relay = %url, error = %e, "Failed to replay subscription");
                        replayed = false;
                        break;
                    }
                }

                if replayed {
                    set_health(&shared, &url, &health_tx, RelayHealth::Open);
                    info!(relay = %url, "Relay connection open");

                    loop {
                        tokio::select! {
                            frame = outbound_rx.recv() => match frame {
                                Some(frame) => {
                                    if let Err(e) = sink.send(frame).await {
                                        warn!(relay = %url, error = %e, "Relay write failed");
                                        break;
                                    }
                                }
                                None => {
                                    debug!(relay = %url, "Outbound channel closed, ending session");
                                    return;
                                }
                            },
                            incoming = stream.next() => match incoming {
                                Some(Ok(text)) => match shared.upgrade() {
                                    Some(pool) => pool.dispatch(&url, &text),
                                    None => return,
                                },
                                Some(Err(e)) => {
                                    warn!(relay = %url, error = %e, "Relay read failed");
                                    break;
                                }
                                None => {
                                    info!(relay = %url, "Relay closed the connection");
                                    break;
                                }
                            },
                        }
                    }
                }

                set_health(&shared, &url, &health_tx, RelayHealth::Error);
            }
            Err(e) => {
                warn!(relay = %url, error = %e, "Relay connection failed");
                set_health(&shared, &url, &health_tx, RelayHealth::Error);
            }
        }

        if transient {
            debug!(relay = %url, "Transient relay connection is not retried");
            return;
        }

        let delay = backoff.next_delay();
        debug!(
            relay = %url,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}

fn set_health(
    shared: &Weak<PoolShared>,
    url: &str,
    health_tx: &watch::Sender<RelayHealth>,
    health: RelayHealth,
) {
    health_tx.send_replace(health);
    if let Some(pool) = shared.upgrade() {
        pool.on_health_change(url, health);
    }
}
