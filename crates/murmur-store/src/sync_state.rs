use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

const LAST_SYNC_AT: &str = "last_sync_at";

impl Database {
    /// Unix seconds of the last completed historical sync.
    pub fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM sync_state WHERE name = ?1",
                params![LAST_SYNC_AT],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_last_sync_at(&self, unix_secs: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_state (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![LAST_SYNC_AT, unix_secs],
        )?;
        Ok(())
    }
}
