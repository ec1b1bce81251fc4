use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use murmur_shared::{ConversationId, Event, EventId, GroupId, LocalMessageId, PublicKey};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Direction, Message, MessageStatus, OutboxEntry};

const MESSAGE_COLUMNS: &str = "local_id, event_id, conversation_id, sender, recipient, group_id,
     content, timestamp_ms, direction, status, reply_to, attachments, deleted_at_ms,
     retry_count, error_kind, signed_event";

impl Database {
    /// Insert a message. Returns `false` if a message with the same local id
    /// or event id already exists, which is how incoming duplicates are
    /// dropped.
    pub fn insert_message(&self, message: &Message) -> Result<bool> {
        let attachments = serde_json::to_string(&message.attachments)?;
        let signed_event = message
            .signed_event
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                message.local_id.to_string(),
                message.event_id.map(|id| id.to_hex()),
                message.conversation_id.as_str(),
                message.sender.to_hex(),
                message.recipient.map(|pk| pk.to_hex()),
                message.group_id.as_ref().map(GroupId::as_str),
                message.content,
                message.timestamp.timestamp_millis(),
                message.direction.as_str(),
                message.status.as_str(),
                message.reply_to.map(|id| id.to_hex()),
                attachments,
                message.deleted_at.map(|t| t.timestamp_millis()),
                message.retry_count,
                message.error_kind,
                signed_event,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Persist a new outgoing message together with its outbox entry.
    pub fn insert_outgoing(&self, message: &Message) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        self.insert_message(message)?;
        self.upsert_outbox_entry(&OutboxEntry::new(message.local_id))?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, local_id: &LocalMessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE local_id = ?1"),
                params![local_id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_message_by_event_id(&self, event_id: &EventId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE event_id = ?1"),
                params![event_id.to_hex()],
                row_to_message,
            )
            .optional()?)
    }

    pub fn has_event(&self, event_id: &EventId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE event_id = ?1",
            params![event_id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All messages of a conversation, oldest first. Ties on timestamp keep
    /// insertion order.
    pub fn messages_for_conversation(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp_ms ASC, seq ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn conversation_ids(&self) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM messages
             GROUP BY conversation_id
             ORDER BY MAX(timestamp_ms) DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(ConversationId(row?));
        }
        Ok(ids)
    }

    /// Unconditionally set the status.
    pub fn update_status(
        &self,
        local_id: &LocalMessageId,
        status: MessageStatus,
        error_kind: Option<&str>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, error_kind = ?3 WHERE local_id = ?1",
            params![local_id.to_string(), status.as_str(), error_kind],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Set the status only if the current one is in `from`. Returns whether
    /// the row changed.
    pub fn transition_status(
        &self,
        local_id: &LocalMessageId,
        from: &[MessageStatus],
        to: MessageStatus,
        error_kind: Option<&str>,
    ) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE local_id = ?1",
                params![local_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current {
            Some(s) => s,
            None => return Err(StoreError::NotFound),
        };
        if !from.iter().any(|s| s.as_str() == current) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE messages SET status = ?2, error_kind = ?3 WHERE local_id = ?1",
            params![local_id.to_string(), to.as_str(), error_kind],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Attach the signed event. The event id is immutable once set.
    pub fn set_signed_event(&self, local_id: &LocalMessageId, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let affected = self.conn().execute(
            "UPDATE messages SET event_id = ?2, signed_event = ?3
             WHERE local_id = ?1 AND (event_id IS NULL OR event_id = ?2)",
            params![local_id.to_string(), event.id.to_hex(), json],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_retry_count(&self, local_id: &LocalMessageId, retry_count: u32) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET retry_count = ?2 WHERE local_id = ?1",
            params![local_id.to_string(), retry_count],
        )?;
        Ok(())
    }

    /// Mark a message deleted. Returns `false` if it already was.
    pub fn soft_delete_message(&self, local_id: &LocalMessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at_ms = ?2 WHERE local_id = ?1 AND deleted_at_ms IS NULL",
            params![local_id.to_string(), Utc::now().timestamp_millis()],
        )?;
        Ok(affected > 0)
    }
}

pub(crate) fn conversion_error<E>(index: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
}

pub(crate) fn millis_to_datetime(index: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, ms))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let local_id: String = row.get(0)?;
    let event_id: Option<String> = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let sender: String = row.get(3)?;
    let recipient: Option<String> = row.get(4)?;
    let group_id: Option<String> = row.get(5)?;
    let content: String = row.get(6)?;
    let timestamp_ms: i64 = row.get(7)?;
    let direction: String = row.get(8)?;
    let status: String = row.get(9)?;
    let reply_to: Option<String> = row.get(10)?;
    let attachments: String = row.get(11)?;
    let deleted_at_ms: Option<i64> = row.get(12)?;
    let retry_count: u32 = row.get(13)?;
    let error_kind: Option<String> = row.get(14)?;
    let signed_event: Option<String> = row.get(15)?;

    let local_id = LocalMessageId::parse(&local_id).map_err(|e| conversion_error(0, e))?;
    let event_id = event_id
        .map(|hex| EventId::from_hex(&hex))
        .transpose()
        .map_err(|e| conversion_error(1, e))?;
    let sender = PublicKey::from_hex(&sender).map_err(|e| conversion_error(3, e))?;
    let recipient = recipient
        .map(|hex| PublicKey::from_hex(&hex))
        .transpose()
        .map_err(|e| conversion_error(4, e))?;
    let direction = direction
        .parse::<Direction>()
        .map_err(|e| conversion_error(8, e))?;
    let status = status
        .parse::<MessageStatus>()
        .map_err(|e| conversion_error(9, e))?;
    let reply_to = reply_to
        .map(|hex| EventId::from_hex(&hex))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;
    let attachments: Vec<String> =
        serde_json::from_str(&attachments).map_err(|e| conversion_error(11, e))?;
    let signed_event: Option<Event> = signed_event
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| conversion_error(15, e))?;

    Ok(Message {
        local_id,
        event_id,
        conversation_id: ConversationId(conversation_id),
        sender,
        recipient,
        group_id: group_id.map(GroupId),
        content,
        timestamp: millis_to_datetime(7, timestamp_ms)?,
        direction,
        status,
        reply_to,
        attachments,
        deleted_at: deleted_at_ms.map(|ms| millis_to_datetime(12, ms)).transpose()?,
        retry_count,
        error_kind,
        signed_event,
    })
}
