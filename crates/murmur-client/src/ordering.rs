//! Per-conversation ordering and deduplication.
//!
//! Messages arrive from several relays in any order and more than once. A
//! [`ConversationLog`] keeps one entry per message, sorted by timestamp with
//! first-seen order breaking ties, and refuses a second entry for an event id
//! it already holds.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use murmur_shared::{EventId, LocalMessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub local_id: LocalMessageId,
    pub event_id: Option<EventId>,
    pub timestamp: DateTime<Utc>,
    /// First-seen order within this log.
    pub seq: u64,
}

impl LogEntry {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<LogEntry>,
    event_ids: HashSet<EventId>,
    local_ids: HashSet<LocalMessageId>,
    next_seq: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message at its temporal position. Returns `false` for a
    /// duplicate local id or event id.
    pub fn insert(
        &mut self,
        local_id: LocalMessageId,
        event_id: Option<EventId>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if self.local_ids.contains(&local_id) {
            return false;
        }
        if let Some(id) = event_id {
            if !self.event_ids.insert(id) {
                return false;
            }
        }
        self.local_ids.insert(local_id);

        let entry = LogEntry {
            local_id,
            event_id,
            timestamp,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let key = entry.sort_key();
        let at = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(at, entry);
        true
    }

    /// Attach the event id to a locally created entry once it is signed.
    pub fn set_event_id(&mut self, local_id: &LocalMessageId, event_id: EventId) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| &e.local_id == local_id) else {
            return false;
        };
        if entry.event_id == Some(event_id) {
            return true;
        }
        if entry.event_id.is_some() || !self.event_ids.insert(event_id) {
            return false;
        }
        entry.event_id = Some(event_id);
        true
    }

    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.event_ids.contains(event_id)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn local_ids(&self) -> impl Iterator<Item = &LocalMessageId> + '_ {
        self.entries.iter().map(|e| &e.local_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
