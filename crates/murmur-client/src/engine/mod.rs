//! Message delivery engine.
//!
//! Owns the outgoing lifecycle (persist, encrypt, sign, fan out, aggregate
//! relay acknowledgements, retry) and the inbound path (verify, filter,
//! decrypt, dedup, append). All collaborators are injected through
//! [`EngineBuilder`]; background work runs in tasks holding only a weak
//! reference to the engine.

mod inbound;
mod outbound;
mod sync;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_net::{FrameSubscription, RelayPool};
use murmur_shared::constants::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_ATTEMPTS,
    LIVE_SUBSCRIPTION_ID, RETRY_BASE_MS, RETRY_MAX_MS,
};
use murmur_shared::crypto::{derive_group_key, SymmetricKey};
use murmur_shared::event::EventKind;
use murmur_shared::protocol::{direct_message_filter, Filter};
use murmur_shared::{
    ConversationId, DirectMessageCodec, Ed25519Signer, EventId, EventSigner, GroupId, Identity,
    LocalMessageId, MessageCodec, PublicKey,
};
use murmur_store::{Database, Message, MessageStatus, RelayResult};

use crate::error::{ErrorKind, MessageError};
use crate::monitor::{NetworkMonitor, NetworkState};
use crate::ordering::ConversationLog;
use crate::scheduler::RetryScheduler;
use crate::tracer::FlowTracer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for relay `OK` frames after a publish.
    pub ack_timeout: Duration,
    /// Attempts (initial send included) before a message is marked failed.
    pub max_attempts: u32,
    /// Successful acknowledgements needed for `accepted`.
    pub acceptance_quorum: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub sync_timeout: Duration,
    /// How often due retries are checked.
    pub retry_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            acceptance_quorum: 1,
            retry_base: Duration::from_millis(RETRY_BASE_MS),
            retry_max: Duration::from_millis(RETRY_MAX_MS),
            sync_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            retry_tick: Duration::from_secs(1),
        }
    }
}

/// Where an outgoing message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Direct(PublicKey),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub target: Target,
    pub content: String,
    pub reply_to: Option<EventId>,
    pub attachments: Vec<String>,
}

impl SendRequest {
    pub fn direct(recipient: PublicKey, content: impl Into<String>) -> Self {
        Self {
            target: Target::Direct(recipient),
            content: content.into(),
            reply_to: None,
            attachments: Vec::new(),
        }
    }

    pub fn group(group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            target: Target::Group(group_id),
            content: content.into(),
            reply_to: None,
            attachments: Vec::new(),
        }
    }

    pub fn reply_to(mut self, event_id: EventId) -> Self {
        self.reply_to = Some(event_id);
        self
    }

    pub fn attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachments.push(reference.into());
        self
    }
}

/// Result of a send or retry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub local_id: LocalMessageId,
    pub event_id: Option<EventId>,
    pub status: MessageStatus,
    pub error_kind: Option<ErrorKind>,
}

impl SendReceipt {
    fn of(message: &Message) -> Self {
        Self {
            local_id: message.local_id,
            event_id: message.event_id,
            status: message.status,
            error_kind: message.error_kind.as_deref().and_then(|k| k.parse().ok()),
        }
    }
}

/// Broadcast on every persisted status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub local_id: LocalMessageId,
    pub conversation_id: ConversationId,
    pub status: MessageStatus,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total_queued: usize,
    pub is_processing: bool,
}

/// A message joined with its confirmation overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub message: Message,
    pub reactions: BTreeMap<String, u32>,
    pub relay_results: Vec<RelayResult>,
}

impl MessageView {
    pub fn relay_summary(&self) -> RelaySummary {
        RelaySummary {
            succeeded: self.relay_results.iter().filter(|r| r.success).count(),
            reported: self.relay_results.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    pub succeeded: usize,
    pub reported: usize,
}

impl fmt::Display for RelaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sent to {} of {} relays", self.succeeded, self.reported)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RelayAck {
    pub(crate) relay_url: String,
    pub(crate) accepted: bool,
    pub(crate) message: String,
}

pub(crate) struct SyncProgress {
    pub(crate) eose_tx: mpsc::UnboundedSender<String>,
    pub(crate) new_messages: usize,
}

pub(crate) struct EngineInner {
    pub(crate) identity: Identity,
    pub(crate) codec: Arc<dyn MessageCodec>,
    pub(crate) signer: Arc<dyn EventSigner>,
    pub(crate) pool: RelayPool,
    pub(crate) store: Mutex<Database>,
    pub(crate) monitor: Arc<NetworkMonitor>,
    pub(crate) tracer: FlowTracer,
    pub(crate) config: EngineConfig,
    pub(crate) in_flight: Mutex<HashSet<LocalMessageId>>,
    pub(crate) acks: Mutex<HashMap<EventId, mpsc::UnboundedSender<RelayAck>>>,
    pub(crate) syncs: Mutex<HashMap<String, SyncProgress>>,
    pub(crate) scheduler: Mutex<RetryScheduler>,
    pub(crate) logs: Mutex<HashMap<ConversationId, ConversationLog>>,
    pub(crate) status_tx: broadcast::Sender<StatusUpdate>,
    pub(crate) incoming_tx: broadcast::Sender<Message>,
    pub(crate) processing: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Unix seconds; lower bound of the live subscription.
    pub(crate) started_at: i64,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EngineBuilder {
    identity: Identity,
    pool: RelayPool,
    store: Database,
    codec: Arc<dyn MessageCodec>,
    signer: Arc<dyn EventSigner>,
    monitor: Option<Arc<NetworkMonitor>>,
    tracer: Option<FlowTracer>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn EventSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn tracer(mut self, tracer: FlowTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine and recover state left by a previous run: sends
    /// interrupted mid-flight go back to `queued`, pending retries are
    /// rescheduled.
    pub fn build(self) -> Result<DeliveryEngine, MessageError> {
        let recovered = self.store.recover_interrupted_sends()?;
        let mut scheduler = RetryScheduler::new(self.config.retry_base, self.config.retry_max);
        for entry in self.store.outbox_entries()? {
            if let Some(ready_at) = entry.next_attempt_at {
                scheduler.schedule(entry.local_id, ready_at);
            }
        }
        if recovered > 0 || !scheduler.is_empty() {
            info!(
                recovered,
                scheduled = scheduler.len(),
                "Restored pending outbox"
            );
        }

        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (incoming_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(DeliveryEngine {
            inner: Arc::new(EngineInner {
                identity: self.identity,
                codec: self.codec,
                signer: self.signer,
                pool: self.pool,
                store: Mutex::new(self.store),
                monitor: self.monitor.unwrap_or_default(),
                tracer: self.tracer.unwrap_or_default(),
                config: self.config,
                in_flight: Mutex::new(HashSet::new()),
                acks: Mutex::new(HashMap::new()),
                syncs: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(scheduler),
                logs: Mutex::new(HashMap::new()),
                status_tx,
                incoming_tx,
                processing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                started_at: Utc::now().timestamp(),
            }),
        })
    }
}

/// Handle to the delivery engine. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl DeliveryEngine {
    pub fn builder(identity: Identity, pool: RelayPool, store: Database) -> EngineBuilder {
        EngineBuilder {
            identity,
            pool,
            store,
            codec: Arc::new(DirectMessageCodec),
            signer: Arc::new(Ed25519Signer),
            monitor: None,
            tracer: None,
            config: EngineConfig::default(),
        }
    }

    /// Spawn the frame dispatcher, the connectivity watcher and the retry
    /// ticker, and open the live subscription.
    pub fn start(&self) {
        let frames = self.inner.pool.subscribe_to_messages();
        let weak = Arc::downgrade(&self.inner);

        let dispatcher = tokio::spawn(run_dispatcher(weak.clone(), frames));
        let watcher = tokio::spawn(run_connectivity_watch(
            weak.clone(),
            self.inner.monitor.subscribe(),
        ));
        let ticker = tokio::spawn(run_retry_ticker(weak, self.inner.config.retry_tick));
        lock(&self.inner.tasks).extend([dispatcher, watcher, ticker]);

        if let Err(e) = self.refresh_live_subscription() {
            warn!(error = %e, "Failed to open live subscription");
        }
        info!(pubkey = %self.public_key().short(), "Delivery engine started");
    }

    pub fn shutdown(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        debug!("Delivery engine stopped");
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.identity.public_key()
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.inner.monitor
    }

    pub fn tracer(&self) -> &FlowTracer {
        &self.inner.tracer
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_incoming(&self) -> broadcast::Receiver<Message> {
        self.inner.incoming_tx.subscribe()
    }

    pub fn queue_status(&self) -> Result<QueueStatus, MessageError> {
        Ok(QueueStatus {
            total_queued: self.db().outbox_len()?,
            is_processing: self
                .inner
                .processing
                .load(std::sync::atomic::Ordering::SeqCst),
        })
    }

    pub fn message(&self, local_id: &LocalMessageId) -> Result<MessageView, MessageError> {
        let message = self.db().get_message(local_id)?;
        self.view(message)
    }

    /// The conversation, oldest first, merged with relay results.
    pub fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageView>, MessageError> {
        let messages = self.db().messages_for_conversation(conversation_id)?;

        let order: Vec<LocalMessageId> = self.with_log(conversation_id, |log| {
            for m in &messages {
                log.insert(m.local_id, m.event_id, m.timestamp);
            }
            log.local_ids().copied().collect()
        })?;

        let mut by_id: HashMap<LocalMessageId, Message> =
            messages.into_iter().map(|m| (m.local_id, m)).collect();
        order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .map(|m| self.view(m))
            .collect()
    }

    pub fn conversation_ids(&self) -> Result<Vec<ConversationId>, MessageError> {
        Ok(self.db().conversation_ids()?)
    }

    /// Derive and store the key for a group from a secret shared out of band,
    /// and subscribe to its messages.
    pub fn join_group(&self, group_id: &GroupId, shared_secret: &[u8]) -> Result<(), MessageError> {
        let key = derive_group_key(shared_secret, group_id);
        self.add_group_key(group_id, &key)
    }

    pub fn add_group_key(&self, group_id: &GroupId, key: &SymmetricKey) -> Result<(), MessageError> {
        self.db().save_group_key(group_id, key)?;
        info!(group = %group_id, "Group key stored");
        self.refresh_live_subscription()
    }

    /// Filters for everything addressed to us, optionally bounded by `since`.
    pub(crate) fn inbox_filters(&self, since: Option<i64>) -> Result<Vec<Filter>, MessageError> {
        let mut dm = direct_message_filter(&self.public_key());
        if let Some(since) = since {
            dm = dm.since(since);
        }
        let mut filters = vec![dm];

        let groups = self.db().group_ids()?;
        if !groups.is_empty() {
            let mut group_filter = Filter::new().kinds([EventKind::GroupMessage]);
            for group in groups {
                group_filter = group_filter.group(group.0);
            }
            if let Some(since) = since {
                group_filter = group_filter.since(since);
            }
            filters.push(group_filter);
        }
        Ok(filters)
    }

    fn refresh_live_subscription(&self) -> Result<(), MessageError> {
        let filters = self.inbox_filters(Some(self.inner.started_at))?;
        self.inner.pool.subscribe(LIVE_SUBSCRIPTION_ID, filters)?;
        Ok(())
    }

    pub(crate) fn db(&self) -> MutexGuard<'_, Database> {
        lock(&self.inner.store)
    }

    /// Run `f` on the conversation log, loading it from the store first if
    /// it is not cached.
    pub(crate) fn with_log<R>(
        &self,
        conversation_id: &ConversationId,
        f: impl FnOnce(&mut ConversationLog) -> R,
    ) -> Result<R, MessageError> {
        let mut logs = lock(&self.inner.logs);
        if !logs.contains_key(conversation_id) {
            let mut log = ConversationLog::new();
            for m in self.db().messages_for_conversation(conversation_id)? {
                log.insert(m.local_id, m.event_id, m.timestamp);
            }
            logs.insert(conversation_id.clone(), log);
        }
        let log = logs
            .entry(conversation_id.clone())
            .or_insert_with(ConversationLog::new);
        Ok(f(log))
    }

    pub(crate) fn emit_status(&self, message: &Message, status: MessageStatus, error_kind: Option<ErrorKind>) {
        // No subscribers is fine.
        let _ = self.inner.status_tx.send(StatusUpdate {
            local_id: message.local_id,
            conversation_id: message.conversation_id.clone(),
            status,
            error_kind,
        });
    }

    fn view(&self, message: Message) -> Result<MessageView, MessageError> {
        let db = self.db();
        let reactions = db.reaction_counts(&message.local_id)?;
        let relay_results = db.relay_results(&message.local_id)?;
        Ok(MessageView {
            message,
            reactions,
            relay_results,
        })
    }
}

pub(crate) fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

async fn run_dispatcher(weak: Weak<EngineInner>, mut frames: FrameSubscription) {
    while let Some(frame) = frames.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        DeliveryEngine { inner }.handle_frame(frame);
    }
    debug!("Frame dispatcher ended");
}

/// Flush the outbox after every monitor change that leaves the network
/// usable. Changes between polls are merged, so an offline spell can hide
/// behind a change that looks like usable-to-usable.
async fn run_connectivity_watch(weak: Weak<EngineInner>, mut state: watch::Receiver<NetworkState>) {
    while state.changed().await.is_ok() {
        if !state.borrow_and_update().is_available() {
            continue;
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let engine = DeliveryEngine { inner };
        let pending = engine.db().outbox_len();
        match pending {
            Ok(0) => continue,
            Ok(pending) => info!(pending, "Network usable, processing outbox"),
            Err(e) => {
                warn!(error = %e, "Could not read outbox");
                continue;
            }
        }
        match engine.process_offline_queue().await {
            Ok(attempted) => debug!(attempted, "Outbox processed after reconnect"),
            Err(e) => warn!(error = %e, "Outbox processing failed"),
        }
    }
}

async fn run_retry_ticker(weak: Weak<EngineInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let engine = DeliveryEngine { inner };
        engine.run_due_retries(Utc::now()).await;
    }
}
