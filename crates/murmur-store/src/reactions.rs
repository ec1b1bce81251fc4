use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::params;

use murmur_shared::{LocalMessageId, PublicKey};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Returns `false` if the same reactor already used this emoji.
    pub fn add_reaction(
        &self,
        local_id: &LocalMessageId,
        reactor: &PublicKey,
        emoji: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (local_id, reactor, emoji, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                local_id.to_string(),
                reactor.to_hex(),
                emoji,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_reaction(
        &self,
        local_id: &LocalMessageId,
        reactor: &PublicKey,
        emoji: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE local_id = ?1 AND reactor = ?2 AND emoji = ?3",
            params![local_id.to_string(), reactor.to_hex(), emoji],
        )?;
        Ok(affected > 0)
    }

    /// Reaction counts keyed by emoji.
    pub fn reaction_counts(&self, local_id: &LocalMessageId) -> Result<BTreeMap<String, u32>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, COUNT(*) FROM reactions WHERE local_id = ?1 GROUP BY emoji",
        )?;
        let rows = stmt.query_map(params![local_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (emoji, count) = row?;
            counts.insert(emoji, count);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use murmur_shared::Identity;

    #[test]
    fn test_counts_distinct_reactors() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let message = Message::outgoing_direct(alice, bob, "nice".into());
        db.insert_message(&message).unwrap();

        assert!(db.add_reaction(&message.local_id, &alice, "+").unwrap());
        assert!(db.add_reaction(&message.local_id, &bob, "+").unwrap());
        assert!(!db.add_reaction(&message.local_id, &bob, "+").unwrap());
        assert!(db.add_reaction(&message.local_id, &bob, "🔥").unwrap());

        let counts = db.reaction_counts(&message.local_id).unwrap();
        assert_eq!(counts.get("+"), Some(&2));
        assert_eq!(counts.get("🔥"), Some(&1));

        assert!(db.remove_reaction(&message.local_id, &bob, "🔥").unwrap());
        assert!(!db.reaction_counts(&message.local_id).unwrap().contains_key("🔥"));
    }
}
