// Historical sync: one-shot REQ, wait for EOSE from every relay, CLOSE.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::ClientMessage;

use super::{lock, DeliveryEngine, SyncProgress};
use crate::error::{ErrorKind, MessageError};
use crate::tracer::{FlowRecord, FlowStage};

impl DeliveryEngine {
    /// Fetch messages missed while offline.
    ///
    /// `since` defaults to the last completed sync. Messages go through the
    /// regular inbound path, so anything already stored is skipped. Returns
    /// the number of new messages.
    pub async fn sync_missed_messages(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize, MessageError> {
        let availability = self.inner.monitor.can_attempt_operation();
        if !availability.allowed {
            return Err(MessageError::new(
                availability.kind.unwrap_or(ErrorKind::NetworkOffline),
                availability.reason,
            ));
        }

        let since = match since {
            Some(at) => Some(at.timestamp()),
            None => self.db().last_sync_at()?,
        };
        let filters = self.inbox_filters(since)?;
        let subscription_id = format!("murmur-sync-{}", Uuid::new_v4().simple());

        let (eose_tx, mut eose_rx) = mpsc::unbounded_channel();
        lock(&self.inner.syncs).insert(
            subscription_id.clone(),
            SyncProgress {
                eose_tx,
                new_messages: 0,
            },
        );
        self.inner.tracer.record(FlowRecord::new(
            FlowStage::SyncStarted,
            format!("since {}", since.unwrap_or(0)),
        ));

        let attempted = match self
            .inner
            .pool
            .send_to_open(&ClientMessage::req(subscription_id.as_str(), filters))
        {
            Ok(urls) => urls,
            Err(e) => {
                lock(&self.inner.syncs).remove(&subscription_id);
                return Err(MessageError::new(self.inner.monitor.classify(&e), e.to_string()));
            }
        };
        if attempted.is_empty() {
            lock(&self.inner.syncs).remove(&subscription_id);
            return Err(MessageError::new(
                ErrorKind::AllRelaysFailed,
                "no relay accepted the sync request",
            ));
        }

        let mut waiting: HashSet<String> = attempted.into_iter().collect();
        let deadline = Instant::now() + self.inner.config.sync_timeout;
        while !waiting.is_empty() {
            match tokio::time::timeout_at(deadline, eose_rx.recv()).await {
                Ok(Some(url)) => {
                    waiting.remove(&url);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(missing = waiting.len(), "Sync timed out waiting for relays");
                    break;
                }
            }
        }

        if let Err(e) = self
            .inner
            .pool
            .send_to_open(&ClientMessage::Close(subscription_id.clone()))
        {
            debug!(error = %e, "Could not close sync subscription");
        }
        let new_messages = lock(&self.inner.syncs)
            .remove(&subscription_id)
            .map(|progress| progress.new_messages)
            .unwrap_or(0);

        if waiting.is_empty() {
            self.db().set_last_sync_at(Utc::now().timestamp())?;
        }
        self.inner.tracer.record(FlowRecord::new(
            FlowStage::SyncFinished,
            format!("{new_messages} new"),
        ));
        info!(new_messages, complete = waiting.is_empty(), "Sync finished");
        Ok(new_messages)
    }

    pub(crate) fn count_sync_message(&self, subscription_id: &str) {
        if let Some(progress) = lock(&self.inner.syncs).get_mut(subscription_id) {
            progress.new_messages += 1;
        }
    }

    pub(crate) fn note_eose(&self, subscription_id: &str, relay_url: &str) {
        if let Some(progress) = lock(&self.inner.syncs).get(subscription_id) {
            let _ = progress.eose_tx.send(relay_url.to_string());
        } else {
            debug!(relay = %relay_url, subscription_id, "End of stored events");
        }
    }
}
