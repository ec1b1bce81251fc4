use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::LocalMessageId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::{conversion_error, millis_to_datetime};
use crate::models::{MessageStatus, OutboxEntry};

const OUTBOX_COLUMNS: &str = "local_id, attempts, next_attempt_at_ms, last_error, created_at_ms";

impl Database {
    pub fn upsert_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO outbox ({OUTBOX_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(local_id) DO UPDATE SET
                     attempts = excluded.attempts,
                     next_attempt_at_ms = excluded.next_attempt_at_ms,
                     last_error = excluded.last_error"
            ),
            params![
                entry.local_id.to_string(),
                entry.attempts,
                entry.next_attempt_at.map(|t| t.timestamp_millis()),
                entry.last_error,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_outbox_entry(&self, local_id: &LocalMessageId) -> Result<Option<OutboxEntry>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE local_id = ?1"),
                params![local_id.to_string()],
                row_to_entry,
            )
            .optional()?)
    }

    /// Every pending entry, oldest first.
    pub fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY created_at_ms ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn outbox_len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn remove_outbox_entry(&self, local_id: &LocalMessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE local_id = ?1",
            params![local_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Set a terminal status and drop the outbox entry in one transaction.
    pub fn finish_outgoing(
        &self,
        local_id: &LocalMessageId,
        status: MessageStatus,
        error_kind: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal(), "{status} keeps its outbox entry");
        let tx = self.conn().unchecked_transaction()?;
        self.update_status(local_id, status, error_kind)?;
        self.remove_outbox_entry(local_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt: new status, attempt count and next eligible
    /// time, in one transaction.
    pub fn record_failed_attempt(
        &self,
        local_id: &LocalMessageId,
        status: MessageStatus,
        error_kind: &str,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        self.update_status(local_id, status, Some(error_kind))?;
        self.set_retry_count(local_id, attempts)?;
        tx.execute(
            "UPDATE outbox SET attempts = ?2, next_attempt_at_ms = ?3, last_error = ?4
             WHERE local_id = ?1",
            params![
                local_id.to_string(),
                attempts,
                next_attempt_at.map(|t| t.timestamp_millis()),
                error_kind,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Move messages interrupted mid-send back to `queued`. Returns how many
    /// were recovered.
    pub fn recover_interrupted_sends(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'queued'
             WHERE status = 'sending'
               AND local_id IN (SELECT local_id FROM outbox)",
            [],
        )?;
        if affected > 0 {
            tracing::info!(recovered = affected, "recovered interrupted sends");
        }
        Ok(affected)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let local_id: String = row.get(0)?;
    let attempts: u32 = row.get(1)?;
    let next_attempt_at_ms: Option<i64> = row.get(2)?;
    let last_error: Option<String> = row.get(3)?;
    let created_at_ms: i64 = row.get(4)?;

    Ok(OutboxEntry {
        local_id: LocalMessageId::parse(&local_id).map_err(|e| conversion_error(0, e))?,
        attempts,
        next_attempt_at: next_attempt_at_ms
            .map(|ms| millis_to_datetime(2, ms))
            .transpose()?,
        last_error,
        created_at: millis_to_datetime(4, created_at_ms)?,
    })
}
