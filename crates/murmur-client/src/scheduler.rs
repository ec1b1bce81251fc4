//! Retry scheduling.
//!
//! A min-heap of `(ready_at, seq, id)`. Time is always passed in by the
//! caller, so the schedule can be tested without sleeping. Rescheduling or
//! cancelling an id leaves the stale heap entry in place; it is skipped when
//! popped, and the heap is compacted once stale entries outnumber live ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use murmur_net::Backoff;
use murmur_shared::LocalMessageId;

/// Heaps smaller than this are never compacted.
const COMPACT_MIN: usize = 32;

pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, LocalMessageId)>>,
    live: HashMap<LocalMessageId, u64>,
    backoff: Backoff,
    next_seq: u64,
}

impl RetryScheduler {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            backoff: Backoff::new(base, max),
            next_seq: 0,
        }
    }

    /// Delay before the next attempt after `attempts` failed ones.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.backoff.delay_for(attempts.saturating_sub(1))
    }

    pub fn schedule(&mut self, id: LocalMessageId, ready_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id, seq);
        self.heap.push(Reverse((ready_at, seq, id)));
        self.compact_if_stale();
    }

    /// Schedule relative to `now` using the backoff for `attempts`.
    pub fn schedule_after_failure(
        &mut self,
        id: LocalMessageId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_after(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let ready_at = now + delay;
        self.schedule(id, ready_at);
        ready_at
    }

    pub fn cancel(&mut self, id: &LocalMessageId) -> bool {
        let removed = self.live.remove(id).is_some();
        self.compact_if_stale();
        removed
    }

    fn compact_if_stale(&mut self) {
        if self.heap.len() <= COMPACT_MIN.max(2 * self.live.len()) {
            return;
        }
        let live = &self.live;
        self.heap
            .retain(|Reverse((_, seq, id))| live.get(id) == Some(seq));
    }

    /// Remove and return every id whose time has come, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<LocalMessageId> {
        let mut due = Vec::new();
        while let Some(Reverse((ready_at, seq, id))) = self.heap.peek().copied() {
            if ready_at > now {
                break;
            }
            self.heap.pop();
            if self.live.get(&id) == Some(&seq) {
                self.live.remove(&id);
                due.push(id);
            }
        }
        due
    }

    pub fn next_ready_at(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((ready_at, seq, id))) = self.heap.peek().copied() {
            if self.live.get(&id) == Some(&seq) {
                return Some(ready_at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn is_scheduled(&self, id: &LocalMessageId) -> bool {
        self.live.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
