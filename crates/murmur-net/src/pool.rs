//! Relay connection pool.
//!
//! Owns one [`run_connection`] task per relay URL and fans every inbound
//! frame out to the registered listeners. Each listener has its own bounded
//! queue; a slow listener loses frames (logged) instead of stalling the read
//! loops of the connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use murmur_shared::constants::{DEFAULT_LISTENER_CAPACITY, RECONNECT_BASE_MS, RECONNECT_MAX_MS};
use murmur_shared::protocol::{ClientMessage, Filter, RelayMessage};

use crate::connection::{run_connection, ConnectionHandle, RelayHealth, RelayStatus};
use crate::error::NetError;
use crate::transport::{normalize_relay_url, Connector};

const OUTBOUND_CAPACITY: usize = 256;
const HEALTH_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Queue depth of each message listener.
    pub listener_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }
}

/// A decoded frame tagged with the relay it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub relay_url: String,
    pub message: RelayMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub url: String,
    pub health: RelayHealth,
    pub open_relays: usize,
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<InboundFrame>,
}

pub(crate) struct PoolShared {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) config: PoolConfig,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    listeners: Mutex<Vec<Listener>>,
    subscriptions: Mutex<BTreeMap<String, Vec<Filter>>>,
    open_count: watch::Sender<usize>,
    health_tx: broadcast::Sender<HealthChange>,
    next_listener_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolShared {
    pub(crate) fn subscription_frames(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .filter_map(|(id, filters)| {
                ClientMessage::req(id.clone(), filters.clone())
                    .to_json()
                    .map_err(|e| warn!(subscription = %id, error = %e, "Unserializable subscription"))
                    .ok()
            })
            .collect()
    }

    pub(crate) fn on_health_change(&self, url: &str, health: RelayHealth) {
        let open_relays = {
            let connections = lock(&self.connections);
            if !connections.contains_key(url) {
                // Late update from a removed connection.
                return;
            }
            connections.values().filter(|c| c.is_open()).count()
        };

        self.open_count.send_if_modified(|current| {
            if *current != open_relays {
                *current = open_relays;
                true
            } else {
                false
            }
        });

        // No receivers is fine.
        let _ = self.health_tx.send(HealthChange {
            url: url.to_string(),
            health,
            open_relays,
        });
    }

    pub(crate) fn dispatch(&self, url: &str, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                trace!(relay = %url, error = %e, "Discarding malformed relay frame");
                return;
            }
        };

        let frame = InboundFrame {
            relay_url: url.to_string(),
            message,
        };

        let mut listeners = lock(&self.listeners);
        listeners.retain(|listener| match listener.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(listener = listener.id, relay = %url, "Listener queue full, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|l| l.id != id);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.connections).drain() {
            handle.task.abort();
        }
    }
}

/// Handle to the relay pool. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl RelayPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let (open_count, _) = watch::channel(0usize);
        let (health_tx, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                connections: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(BTreeMap::new()),
                open_count,
                health_tx,
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Add a persistent relay. Returns `false` if it was already present.
    pub fn add_relay(&self, url: &str) -> Result<bool, NetError> {
        self.insert_relay(url, false)
    }

    /// Add a discovery relay that is not reconnected after it drops.
    pub fn add_transient_relay(&self, url: &str) -> Result<bool, NetError> {
        self.insert_relay(url, true)
    }

    fn insert_relay(&self, url: &str, transient: bool) -> Result<bool, NetError> {
        let url = normalize_relay_url(url)?;
        let mut connections = lock(&self.shared.connections);
        if connections.contains_key(&url) {
            return Ok(false);
        }

        let (health_tx, health_rx) = watch::channel(RelayHealth::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(run_connection(
            url.clone(),
            transient,
            Arc::downgrade(&self.shared),
            health_tx,
            outbound_rx,
        ));

        connections.insert(
            url.clone(),
            ConnectionHandle {
                transient,
                health: health_rx,
                outbound: outbound_tx,
                task,
            },
        );
        info!(relay = %url, transient, "Relay added");
        Ok(true)
    }

    /// Close and forget a relay. Returns `false` if it was unknown.
    pub fn remove_relay(&self, url: &str) -> bool {
        let url = match normalize_relay_url(url) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let (removed, open_relays) = {
            let mut connections = lock(&self.shared.connections);
            let removed = connections.remove(&url);
            (removed, connections.values().filter(|c| c.is_open()).count())
        };

        match removed {
            Some(handle) => {
                handle.task.abort();
                self.shared.open_count.send_replace(open_relays);
                let _ = self.shared.health_tx.send(HealthChange {
                    url: url.clone(),
                    health: RelayHealth::Error,
                    open_relays,
                });
                info!(relay = %url, "Relay removed");
                true
            }
            None => false,
        }
    }

    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = lock(&self.shared.connections).keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn health(&self) -> Vec<RelayStatus> {
        let mut statuses: Vec<RelayStatus> = lock(&self.shared.connections)
            .iter()
            .map(|(url, handle)| RelayStatus {
                url: url.clone(),
                health: *handle.health.borrow(),
                transient: handle.transient,
            })
            .collect();
        statuses.sort_by(|a, b| a.url.cmp(&b.url));
        statuses
    }

    pub fn open_count(&self) -> usize {
        *self.shared.open_count.borrow()
    }

    pub fn watch_open_count(&self) -> watch::Receiver<usize> {
        self.shared.open_count.subscribe()
    }

    pub fn health_events(&self) -> broadcast::Receiver<HealthChange> {
        self.shared.health_tx.subscribe()
    }

    /// Queue `message` on every open connection and return the relays it was
    /// handed to. Being attempted is not being delivered.
    pub fn send_to_open(&self, message: &ClientMessage) -> Result<Vec<String>, NetError> {
        let frame = message.to_json()?;
        let connections = lock(&self.shared.connections);

        let mut attempted = Vec::new();
        for (url, handle) in connections.iter().filter(|(_, h)| h.is_open()) {
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => attempted.push(url.clone()),
                Err(e) => warn!(relay = %url, error = %e, "Skipping relay, outbound queue unavailable"),
            }
        }
        attempted.sort();
        debug!(attempted = attempted.len(), "Frame sent to open relays");
        Ok(attempted)
    }

    pub fn send_to_one(&self, url: &str, message: &ClientMessage) -> Result<(), NetError> {
        let url = normalize_relay_url(url)?;
        let frame = message.to_json()?;
        let connections = lock(&self.shared.connections);

        let handle = connections
            .get(&url)
            .filter(|h| h.is_open())
            .ok_or_else(|| NetError::RelayUnavailable(url.clone()))?;
        handle
            .outbound
            .try_send(frame)
            .map_err(|e| NetError::Transport(format!("{url}: {e}")))
    }

    /// Register a listener for every inbound frame on every connection.
    /// Dropping the returned handle unsubscribes.
    pub fn subscribe_to_messages(&self) -> FrameSubscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.listener_capacity.max(1));
        lock(&self.shared.listeners).push(Listener { id, tx });
        debug!(listener = id, "Message listener registered");

        FrameSubscription {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Resolve once at least one connection is open.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), NetError> {
        let mut open = self.shared.open_count.subscribe();
        let result = match tokio::time::timeout(timeout, open.wait_for(|n| *n > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(NetError::PoolClosed),
            Err(_) => Err(NetError::ConnectionTimeout(timeout)),
        };
        result
    }

    /// Open a persistent subscription. It is sent to every open relay now
    /// and replayed whenever a connection (re)opens.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<Vec<String>, NetError> {
        lock(&self.shared.subscriptions).insert(subscription_id.to_string(), filters.clone());
        self.send_to_open(&ClientMessage::req(subscription_id, filters))
    }

    /// Forget a persistent subscription and send `CLOSE` to the open relays.
    pub fn close_subscription(&self, subscription_id: &str) -> Result<Vec<String>, NetError> {
        lock(&self.shared.subscriptions).remove(subscription_id);
        self.send_to_open(&ClientMessage::Close(subscription_id.to_string()))
    }

    /// Abort every connection task.
    pub fn shutdown(&self) {
        let drained: Vec<(String, ConnectionHandle)> =
            lock(&self.shared.connections).drain().collect();
        for (url, handle) in drained {
            handle.task.abort();
            debug!(relay = %url, "Relay connection aborted");
        }
        self.shared.open_count.send_replace(0);
        info!("Relay pool shut down");
    }
}

/// Receiving half of a message listener.
pub struct FrameSubscription {
    id: u64,
    rx: mpsc::Receiver<InboundFrame>,
    shared: Weak<PoolShared>,
}

impl FrameSubscription {
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(self.id);
            debug!(listener = self.id, "Message listener removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AckPolicy, MemoryNetwork};
    use murmur_shared::event::{Ed25519Signer, EventKind, EventSigner, UnsignedEvent};
    use murmur_shared::protocol::direct_message_filter;
    use murmur_shared::Identity;

    fn fast_config() -> PoolConfig {
        PoolConfig {
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
            listener_capacity: 16,
        }
    }

    fn dm(from: &Identity, to: &Identity) -> murmur_shared::Event {
        let unsigned = UnsignedEvent::new(
            from.public_key(),
            1_700_000_000,
            EventKind::DirectMessage,
            "envelope".into(),
        )
        .tag(&["p", &to.public_key().to_hex()]);
        Ed25519Signer.sign(unsigned, from).unwrap()
    }

    #[tokio::test]
    async fn test_add_relay_is_idempotent() {
        let network = MemoryNetwork::new();
        network.relay("wss://one.test");
        let pool = RelayPool::new(Arc::new(network.clone()), fast_config());

        assert!(pool.add_relay("wss://one.test").unwrap());
        assert!(!pool.add_relay("wss://one.test/").unwrap());
        assert_eq!(pool.relay_urls(), vec!["wss://one.test".to_string()]);

        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        assert_eq!(network.relay("wss://one.test").connection_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_open_skips_unreachable() {
        let network = MemoryNetwork::new();
        let up = network.relay("wss://up.test");
        network.relay("wss://down.test").set_reachable(false);
        let pool = RelayPool::new(Arc::new(network.clone()), fast_config());
        pool.add_relay("wss://up.test").unwrap();
        pool.add_relay("wss://down.test").unwrap();
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();

        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut listener = pool.subscribe_to_messages();
        let attempted = pool.send_to_open(&ClientMessage::event(dm(&alice, &bob))).unwrap();
        assert_eq!(attempted, vec!["wss://up.test".to_string()]);

        let frame = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.relay_url, "wss://up.test");
        assert!(matches!(frame.message, RelayMessage::Ok { accepted: true, .. }));
        assert_eq!(up.received_event_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_one_requires_open_connection() {
        let network = MemoryNetwork::new();
        network.relay("wss://down.test").set_reachable(false);
        let pool = RelayPool::new(Arc::new(network), fast_config());
        pool.add_relay("wss://down.test").unwrap();

        let result = pool.send_to_one("wss://down.test", &ClientMessage::Close("x".into()));
        assert_eq!(
            result,
            Err(NetError::RelayUnavailable("wss://down.test".into()))
        );
    }

    #[tokio::test]
    async fn test_wait_for_connection_times_out() {
        let network = MemoryNetwork::new();
        network.relay("wss://down.test").set_reachable(false);
        let pool = RelayPool::new(Arc::new(network), fast_config());
        pool.add_relay("wss://down.test").unwrap();

        let result = pool.wait_for_connection(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(NetError::ConnectionTimeout(_))));
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_drop() {
        let network = MemoryNetwork::new();
        let relay = network.relay("wss://flaky.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());
        pool.add_relay("wss://flaky.test").unwrap();
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        assert_eq!(relay.connection_count(), 1);

        relay.disconnect_all();
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.connection_count() < 2 || pool.open_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(pool.health()[0].health, RelayHealth::Open);
    }

    #[tokio::test]
    async fn test_subscriptions_replayed_on_reconnect() {
        let network = MemoryNetwork::new();
        let relay = network.relay("wss://flaky.test");
        relay.set_policy(AckPolicy::Accept);
        let pool = RelayPool::new(Arc::new(network), fast_config());

        let alice = Identity::generate();
        let bob = Identity::generate();
        pool.subscribe("live", vec![direct_message_filter(&bob.public_key())])
            .unwrap();
        pool.add_relay("wss://flaky.test").unwrap();
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();

        let mut listener = pool.subscribe_to_messages();
        relay.inject(dm(&alice, &bob));

        let frame = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap();
        match frame.message {
            RelayMessage::Event {
                subscription_id, ..
            } => assert_eq!(subscription_id, "live"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_listener_is_unregistered() {
        let network = MemoryNetwork::new();
        network.relay("wss://one.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());

        let listener = pool.subscribe_to_messages();
        assert_eq!(lock(&pool.shared.listeners).len(), 1);
        drop(listener);
        assert!(lock(&pool.shared.listeners).is_empty());
    }

    #[tokio::test]
    async fn test_remove_relay_drops_health() {
        let network = MemoryNetwork::new();
        network.relay("wss://one.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());
        pool.add_relay("wss://one.test").unwrap();
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();

        assert!(pool.remove_relay("wss://one.test"));
        assert!(!pool.remove_relay("wss://one.test"));
        assert!(pool.health().is_empty());
        assert_eq!(pool.open_count(), 0);
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_transient_relay_is_not_reconnected() {
        let network = MemoryNetwork::new();
        let relay = network.relay("wss://discovery.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());
        assert!(pool.add_transient_relay("wss://discovery.test").unwrap());
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        assert!(pool.health()[0].transient);

        relay.disconnect_all();
        eventually(|| pool.health()[0].health == RelayHealth::Error).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(relay.connection_count(), 1);
        assert_eq!(relay.open_sessions(), 0);
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscription_is_not_replayed() {
        let network = MemoryNetwork::new();
        let relay = network.relay("wss://flaky.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());
        let bob = Identity::generate();
        pool.subscribe("live", vec![direct_message_filter(&bob.public_key())])
            .unwrap();
        pool.add_relay("wss://flaky.test").unwrap();
        pool.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        eventually(|| relay.has_subscription("live")).await;

        let closed = pool.close_subscription("live").unwrap();
        assert_eq!(closed, vec!["wss://flaky.test".to_string()]);
        eventually(|| !relay.has_subscription("live")).await;

        relay.disconnect_all();
        eventually(|| relay.connection_count() == 2 && relay.open_sessions() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.has_subscription("live"));
    }

    #[tokio::test]
    async fn test_health_events_report_open_count() {
        let network = MemoryNetwork::new();
        network.relay("wss://one.test");
        let pool = RelayPool::new(Arc::new(network), fast_config());
        let mut events = pool.health_events();
        pool.add_relay("wss://one.test").unwrap();

        let opened = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let change = events.recv().await.unwrap();
                if change.health == RelayHealth::Open {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(opened.url, "wss://one.test");
        assert_eq!(opened.open_relays, 1);

        pool.remove_relay("wss://one.test");
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.health, RelayHealth::Error);
        assert_eq!(removed.open_relays, 0);
    }
}
