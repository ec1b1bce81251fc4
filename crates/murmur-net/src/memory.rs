//! In-memory relays for tests.
//!
//! [`MemoryNetwork`] is a [`Connector`] that resolves URLs to
//! [`MemoryRelay`]s living in the same process. Client frames are handled
//! synchronously inside the sink, so once `send` returns the relay has
//! already seen the frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::debug;

use murmur_shared::event::Event;
use murmur_shared::protocol::{ClientMessage, Filter, RelayMessage};

use crate::error::NetError;
use crate::transport::{Connector, FrameSink, FrameStream};

/// How a relay answers `EVENT` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPolicy {
    Accept,
    Reject(String),
    /// Store nothing and never answer.
    Silent,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    relays: Arc<Mutex<HashMap<String, MemoryRelay>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the relay at `url`, creating an accepting one if needed.
    pub fn relay(&self, url: &str) -> MemoryRelay {
        lock(&self.relays)
            .entry(url.to_string())
            .or_insert_with(|| MemoryRelay::new(url))
            .clone()
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), NetError>> {
        let relay = lock(&self.relays).get(url).cloned();
        let url = url.to_string();
        Box::pin(async move {
            match relay {
                Some(relay) => relay.open_session(),
                None => Err(NetError::Connect(format!("{url}: no such relay"))),
            }
        })
    }
}

struct Session {
    id: u64,
    tx: UnboundedSender<Result<String, NetError>>,
    subscriptions: HashMap<String, Vec<Filter>>,
}

impl Session {
    fn push(&self, message: &RelayMessage) {
        if let Ok(text) = message.to_json() {
            // The client may already be gone.
            let _ = self.tx.unbounded_send(Ok(text));
        }
    }
}

struct RelayState {
    policy: AckPolicy,
    reachable: bool,
    stored: Vec<Event>,
    received: Vec<Event>,
    sessions: Vec<Session>,
    next_session: u64,
    connections: usize,
}

#[derive(Clone)]
pub struct MemoryRelay {
    url: String,
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Arc::new(Mutex::new(RelayState {
                policy: AckPolicy::Accept,
                reachable: true,
                stored: Vec::new(),
                received: Vec::new(),
                sessions: Vec::new(),
                next_session: 1,
                connections: 0,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_policy(&self, policy: AckPolicy) {
        lock(&self.state).policy = policy;
    }

    /// An unreachable relay refuses connections and drops the open ones.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = lock(&self.state);
        state.reachable = reachable;
        if !reachable {
            state.sessions.clear();
        }
    }

    /// Drop every open session. Clients see the stream end.
    pub fn disconnect_all(&self) {
        lock(&self.state).sessions.clear();
        debug!(relay = %self.url, "Memory relay dropped its sessions");
    }

    /// Total number of sessions ever opened.
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Number of `EVENT` frames received, duplicates included.
    pub fn received_event_count(&self) -> usize {
        lock(&self.state).received.len()
    }

    pub fn received_events(&self) -> Vec<Event> {
        lock(&self.state).received.clone()
    }

    pub fn stored_events(&self) -> Vec<Event> {
        lock(&self.state).stored.clone()
    }

    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        lock(&self.state)
            .sessions
            .iter()
            .any(|s| s.subscriptions.contains_key(subscription_id))
    }

    /// Store an event as if another client had published it, and push it to
    /// matching live subscriptions.
    pub fn inject(&self, event: Event) {
        let mut state = lock(&self.state);
        store_and_fan_out(&mut state, event);
    }

    fn open_session(&self) -> Result<(FrameSink, FrameStream), NetError> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(NetError::Connect(format!("{}: unreachable", self.url)));
        }

        let id = state.next_session;
        state.next_session += 1;
        state.connections += 1;

        let (tx, rx) = unbounded();
        state.sessions.push(Session {
            id,
            tx,
            subscriptions: HashMap::new(),
        });

        let relay = self.clone();
        let sink = futures::sink::unfold(relay, move |relay, frame: String| async move {
            relay.handle_frame(id, &frame)?;
            Ok::<_, NetError>(relay)
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(rx.fuse());
        Ok((sink, stream))
    }

    fn handle_frame(&self, session_id: u64, frame: &str) -> Result<(), NetError> {
        let mut state = lock(&self.state);
        let index = state
            .sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or(NetError::Closed)?;

        let message = match ClientMessage::from_json(frame) {
            Ok(message) => message,
            Err(e) => {
                state.sessions[index].push(&RelayMessage::Notice(format!("invalid: {e}")));
                return Ok(());
            }
        };

        match message {
            ClientMessage::Event(event) => {
                let event = *event;
                state.received.push(event.clone());
                match state.policy.clone() {
                    AckPolicy::Accept => {
                        state.sessions[index].push(&RelayMessage::Ok {
                            event_id: event.id,
                            accepted: true,
                            message: String::new(),
                        });
                        store_and_fan_out(&mut state, event);
                    }
                    AckPolicy::Reject(reason) => {
                        state.sessions[index].push(&RelayMessage::Ok {
                            event_id: event.id,
                            accepted: false,
                            message: reason,
                        });
                    }
                    AckPolicy::Silent => {}
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let session = &state.sessions[index];
                for event in state
                    .stored
                    .iter()
                    .filter(|e| filters.iter().any(|f| f.matches(e)))
                {
                    session.push(&RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: Box::new(event.clone()),
                    });
                }
                session.push(&RelayMessage::Eose(subscription_id.clone()));
                state.sessions[index]
                    .subscriptions
                    .insert(subscription_id, filters);
            }
            ClientMessage::Close(subscription_id) => {
                state.sessions[index].subscriptions.remove(&subscription_id);
            }
        }
        Ok(())
    }
}

fn store_and_fan_out(state: &mut RelayState, event: Event) {
    if state.stored.iter().any(|e| e.id == event.id) {
        return;
    }
    for session in &state.sessions {
        for (subscription_id, filters) in &session.subscriptions {
            if filters.iter().any(|f| f.matches(&event)) {
                session.push(&RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event: Box::new(event.clone()),
                });
            }
        }
    }
    state.stored.push(event);
}
