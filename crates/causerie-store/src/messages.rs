//! CRUD operations for [`Message`] records.

use std::collections::BTreeSet;

use causerie_shared::{ConversationId, MessageId, MessageStatus, UserId};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    /// Insert a message, or replace every field of the existing row with the
    /// same id.  Callers performing merges read the current row first and
    /// write the merged result; the write itself is a single statement, so
    /// readers never observe a partially-updated message.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, body, media_ref,
                                   timestamp, status, delivered_to, read_by,
                                   delivered_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 conversation_id = excluded.conversation_id,
                 sender_id       = excluded.sender_id,
                 body            = excluded.body,
                 media_ref       = excluded.media_ref,
                 timestamp       = excluded.timestamp,
                 status          = excluded.status,
                 delivered_to    = excluded.delivered_to,
                 read_by         = excluded.read_by,
                 delivered_at    = excluded.delivered_at,
                 read_at         = excluded.read_at",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.body,
                message.media_ref,
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
                user_set_to_json(&message.delivered_to)?,
                user_set_to_json(&message.read_by)?,
                message.delivered_at.map(|t| t.to_rfc3339()),
                message.read_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether a message row with this id exists.
    pub fn message_exists(&self, id: MessageId) -> Result<bool> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages of one conversation, oldest first.
    pub fn get_messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Set the delivery status of a message.
    pub fn update_message_status(&self, id: MessageId, status: MessageStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Write a message's receipt fields and status in one statement.
    pub fn update_message_receipts(&self, message: &Message) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET
                 delivered_to = ?2,
                 read_by      = ?3,
                 delivered_at = ?4,
                 read_at      = ?5,
                 status       = ?6
             WHERE id = ?1",
            params![
                message.id.to_string(),
                user_set_to_json(&message.delivered_to)?,
                user_set_to_json(&message.read_by)?,
                message.delivered_at.map(|t| t.to_rfc3339()),
                message.read_at.map(|t| t.to_rfc3339()),
                message.status.as_str(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Messages stuck awaiting remote confirmation: status Pending or Sent
    /// with a timestamp older than `cutoff`.  Used by the startup recovery
    /// scan.
    pub fn stale_messages(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE status IN ('pending', 'sent') AND timestamp < ?1
             ORDER BY timestamp ASC"
        ))?;

        let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Messages in a conversation that `reader` has not read and did not
    /// send.  The `read_by` membership check happens here rather than in SQL
    /// because the column is a JSON array.
    pub fn messages_unread_by(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1 AND sender_id != ?2
             ORDER BY timestamp ASC"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), reader.as_str()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let message = row?;
            if !message.read_by.contains(reader) {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Delete a message by id.  Returns `true` if a row was deleted.  The
    /// sync engine itself never calls this; deletion is an explicit user
    /// action.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, media_ref, timestamp, \
     status, delivered_to, read_by, delivered_at, read_at";

fn user_set_to_json(set: &BTreeSet<UserId>) -> Result<String> {
    Ok(serde_json::to_string(set)?)
}

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let body: Option<String> = row.get(3)?;
    let media_ref: Option<String> = row.get(4)?;
    let ts_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let delivered_to_json: String = row.get(7)?;
    let read_by_json: String = row.get(8)?;
    let delivered_at_str: Option<String> = row.get(9)?;
    let read_at_str: Option<String> = row.get(10)?;

    let id = MessageId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let timestamp = parse_timestamp(5, &ts_str)?;

    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown message status: {status_str}").into(),
        )
    })?;

    let delivered_to = parse_user_set(7, &delivered_to_json)?;
    let read_by = parse_user_set(8, &read_by_json)?;

    let delivered_at = delivered_at_str
        .as_deref()
        .map(|s| parse_timestamp(9, s))
        .transpose()?;
    let read_at = read_at_str
        .as_deref()
        .map(|s| parse_timestamp(10, s))
        .transpose()?;

    Ok(Message {
        id,
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new(sender_id),
        body,
        media_ref,
        timestamp,
        status,
        delivered_to,
        read_by,
        delivered_at,
        read_at,
    })
}

pub(crate) fn parse_timestamp(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_user_set(col: usize, json: &str) -> rusqlite::Result<BTreeSet<UserId>> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}
