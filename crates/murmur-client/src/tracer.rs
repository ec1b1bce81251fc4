//! Flow tracer: a write-only record of message lifecycle events.
//!
//! Each record is emitted as a `tracing` event under the `murmur::flow`
//! target and kept in a bounded ring for diagnostics. Nothing in the engine
//! reads it back to make decisions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use murmur_shared::{EventId, LocalMessageId};

const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStage {
    Created,
    Queued,
    Encrypted,
    Signed,
    Published,
    RelayAccepted,
    RelayRejected,
    StatusChanged,
    Received,
    Duplicate,
    DecryptFailed,
    Discarded,
    SyncStarted,
    SyncFinished,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub at: DateTime<Utc>,
    pub stage: FlowStage,
    pub local_id: Option<LocalMessageId>,
    pub event_id: Option<EventId>,
    pub relay_url: Option<String>,
    pub detail: String,
}

impl FlowRecord {
    pub fn new(stage: FlowStage, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stage,
            local_id: None,
            event_id: None,
            relay_url: None,
            detail: detail.into(),
        }
    }

    pub fn message(mut self, local_id: LocalMessageId) -> Self {
        self.local_id = Some(local_id);
        self
    }

    pub fn event(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn relay(mut self, url: &str) -> Self {
        self.relay_url = Some(url.to_string());
        self
    }
}

#[derive(Clone)]
pub struct FlowTracer {
    records: Arc<Mutex<VecDeque<FlowRecord>>>,
    capacity: usize,
}

impl FlowTracer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: FlowRecord) {
        tracing::debug!(
            target: "murmur::flow",
            stage = ?record.stage,
            local_id = ?record.local_id.map(|id| id.to_string()),
            event_id = ?record.event_id.map(|id| id.short()),
            relay = ?record.relay_url,
            detail = %record.detail,
            "flow"
        );

        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Copy of the retained records, oldest first.
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for FlowTracer {
    fn default() -> Self {
        Self::new()
    }
}
