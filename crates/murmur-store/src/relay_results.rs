use rusqlite::params;

use murmur_shared::LocalMessageId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::millis_to_datetime;
use crate::models::RelayResult;

impl Database {
    /// Record the outcome from one relay. A later result for the same relay
    /// replaces the earlier one.
    pub fn record_relay_result(&self, local_id: &LocalMessageId, result: &RelayResult) -> Result<()> {
        self.conn().execute(
            "INSERT INTO relay_results (local_id, relay_url, success, error, latency_ms, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(local_id, relay_url) DO UPDATE SET
                 success = excluded.success,
                 error = excluded.error,
                 latency_ms = excluded.latency_ms,
                 recorded_at_ms = excluded.recorded_at_ms",
            params![
                local_id.to_string(),
                result.relay_url,
                result.success,
                result.error,
                result.latency_ms.map(|ms| ms as i64),
                result.recorded_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn relay_results(&self, local_id: &LocalMessageId) -> Result<Vec<RelayResult>> {
        let mut stmt = self.conn().prepare(
            "SELECT relay_url, success, error, latency_ms, recorded_at_ms
             FROM relay_results WHERE local_id = ?1 ORDER BY relay_url ASC",
        )?;

        let rows = stmt.query_map(params![local_id.to_string()], |row| {
            let latency_ms: Option<i64> = row.get(3)?;
            Ok(RelayResult {
                relay_url: row.get(0)?,
                success: row.get(1)?,
                error: row.get(2)?,
                latency_ms: latency_ms.map(|ms| ms.max(0) as u64),
                recorded_at: millis_to_datetime(4, row.get(4)?)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::Utc;
    use murmur_shared::Identity;

    fn result(url: &str, success: bool, error: Option<&str>) -> RelayResult {
        RelayResult {
            relay_url: url.into(),
            success,
            error: error.map(str::to_string),
            latency_ms: Some(12),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_later_result_supersedes() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let message = Message::outgoing_direct(alice, bob, "hi".into());
        db.insert_message(&message).unwrap();

        db.record_relay_result(&message.local_id, &result("wss://a", false, Some("rate-limited")))
            .unwrap();
        db.record_relay_result(&message.local_id, &result("wss://b", true, None))
            .unwrap();
        db.record_relay_result(&message.local_id, &result("wss://a", true, None))
            .unwrap();

        let results = db.relay_results(&message.local_id).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].relay_url, "wss://a");
        assert_eq!(results[0].error, None);
    }
}
