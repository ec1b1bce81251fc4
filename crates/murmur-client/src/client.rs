//! Composition root.
//!
//! A [`Client`] wires the relay pool, the connectivity monitor, the store
//! and the delivery engine together and keeps the monitor's relay signal in
//! step with the pool's open-connection count.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use murmur_net::{
    Connector, HealthChange, RelayHealth, RelayPool, RelayStatus, WebSocketConnector,
};
use murmur_shared::Identity;
use murmur_store::Database;

use crate::config::ClientConfig;
use crate::engine::DeliveryEngine;
use crate::error::{ErrorKind, MessageError};
use crate::monitor::NetworkMonitor;
use crate::tracer::FlowTracer;

pub struct Client {
    config: ClientConfig,
    engine: DeliveryEngine,
    pool: RelayPool,
    monitor: Arc<NetworkMonitor>,
    relay_watch: JoinHandle<()>,
}

impl Client {
    /// Start a client over an arbitrary transport and store.
    pub fn start(
        config: ClientConfig,
        identity: Identity,
        connector: Arc<dyn Connector>,
        store: Database,
    ) -> Result<Self, MessageError> {
        let monitor = Arc::new(NetworkMonitor::new());
        let pool = RelayPool::new(connector, config.pool_config());
        let relay_watch = tokio::spawn(watch_relays(
            pool.watch_open_count(),
            pool.health_events(),
            monitor.clone(),
        ));

        let engine = DeliveryEngine::builder(identity, pool.clone(), store)
            .monitor(monitor.clone())
            .tracer(FlowTracer::new())
            .config(config.engine_config())
            .build()?;
        engine.start();

        for url in &config.relays {
            if let Err(e) = pool.add_relay(url) {
                warn!(relay = %url, error = %e, "Skipping relay");
            }
        }
        info!(relays = pool.relay_urls().len(), "Client started");

        Ok(Self {
            config,
            engine,
            pool,
            monitor,
            relay_watch,
        })
    }

    /// Start a client on WebSockets with the configured (or default) database.
    pub fn open(config: ClientConfig, identity: Identity) -> Result<Self, MessageError> {
        let store = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Self::start(config, identity, Arc::new(WebSocketConnector), store)
    }

    /// Wait until a relay is open and the monitor reports the network usable.
    pub async fn wait_until_ready(&self) -> Result<(), MessageError> {
        self.pool
            .wait_for_connection(self.config.connect_timeout)
            .await?;

        let mut state = self.monitor.subscribe();
        let ready = tokio::time::timeout(
            self.config.connect_timeout,
            state.wait_for(|s| s.is_available()),
        )
        .await;
        match ready {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MessageError::new(ErrorKind::Unknown, "monitor closed")),
            Err(_) => Err(MessageError::new(
                ErrorKind::RelayTimeout,
                "relay connection did not become usable in time",
            )),
        }
    }

    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn relay_health(&self) -> Vec<RelayStatus> {
        self.pool.health()
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.pool.shutdown();
        self.relay_watch.abort();
        info!("Client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.relay_watch.abort();
    }
}

async fn watch_relays(
    mut open: watch::Receiver<usize>,
    mut health: broadcast::Receiver<HealthChange>,
    monitor: Arc<NetworkMonitor>,
) {
    monitor.set_relay_connection(*open.borrow_and_update() > 0);
    loop {
        tokio::select! {
            changed = open.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *open.borrow_and_update();
                monitor.set_relay_connection(count > 0);
            }
            event = health.recv() => match event {
                Ok(HealthChange { url, health: RelayHealth::Error, .. }) => {
                    monitor.record_relay_failure(&url, ErrorKind::AllRelaysFailed, "connection lost");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay health events lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
