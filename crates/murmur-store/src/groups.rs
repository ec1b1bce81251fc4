use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use murmur_shared::crypto::SymmetricKey;
use murmur_shared::GroupId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::conversion_error;

impl Database {
    pub fn save_group_key(&self, group_id: &GroupId, key: &SymmetricKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO group_keys (group_id, key_hex, created_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET key_hex = excluded.key_hex",
            params![
                group_id.as_str(),
                hex::encode(key),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn group_key(&self, group_id: &GroupId) -> Result<Option<SymmetricKey>> {
        let hex_key: Option<String> = self
            .conn()
            .query_row(
                "SELECT key_hex FROM group_keys WHERE group_id = ?1",
                params![group_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(hex_key) = hex_key else {
            return Ok(None);
        };
        let bytes = hex::decode(&hex_key).map_err(|e| conversion_error(0, e))?;
        let key: SymmetricKey = bytes.as_slice().try_into().map_err(|e| conversion_error(0, e))?;
        Ok(Some(key))
    }

    pub fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT group_id FROM group_keys ORDER BY group_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(GroupId(row?));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let group = GroupId::new("rust-club");
        assert!(db.group_key(&group).unwrap().is_none());

        db.save_group_key(&group, &[9u8; 32]).unwrap();
        db.save_group_key(&group, &[3u8; 32]).unwrap();

        assert_eq!(db.group_key(&group).unwrap(), Some([3u8; 32]));
        assert_eq!(db.group_ids().unwrap(), vec![group]);
    }
}
