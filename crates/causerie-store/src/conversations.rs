//! CRUD operations for [`Conversation`] records.

use causerie_shared::ConversationId;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{parse_timestamp, parse_user_set};
use crate::models::Conversation;

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a conversation, or replace the metadata of an existing one.
    /// The unread counter is preserved on conflict; it is owned by the local
    /// read/receipt flow, not by remote snapshots.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, participant_ids, is_group, last_message_text,
                                        last_message_time, unread_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 participant_ids   = excluded.participant_ids,
                 is_group          = excluded.is_group,
                 last_message_text = excluded.last_message_text,
                 last_message_time = excluded.last_message_time",
            params![
                conversation.id.as_str(),
                serde_json::to_string(&conversation.participant_ids)?,
                conversation.is_group,
                conversation.last_message_text,
                conversation.last_message_time.map(|t| t.to_rfc3339()),
                conversation.unread_count,
                conversation.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update the last-message fields shown in conversation-list views.
    pub fn update_conversation_last_message(
        &self,
        id: &ConversationId,
        text: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations
             SET last_message_text = ?2, last_message_time = ?3
             WHERE id = ?1",
            params![id.as_str(), text, time.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Bump the unread counter by one.
    pub fn increment_unread(&self, id: &ConversationId) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET unread_count = unread_count + 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Reset the unread counter to zero.
    pub fn reset_unread(&self, id: &ConversationId) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, participant_ids, is_group, last_message_text,
                        last_message_time, unread_count, created_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, participant_ids, is_group, last_message_text,
                    last_message_time, unread_count, created_at
             FROM conversations
             ORDER BY last_message_time IS NULL, last_message_time DESC",
        )?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation by id.  Returns `true` if a row was deleted.
    /// Messages of the conversation are retained.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let participants_json: String = row.get(1)?;
    let is_group: bool = row.get(2)?;
    let last_message_text: Option<String> = row.get(3)?;
    let last_time_str: Option<String> = row.get(4)?;
    let unread_count: u32 = row.get(5)?;
    let created_str: String = row.get(6)?;

    let participant_ids = parse_user_set(1, &participants_json)?;

    let last_message_time = last_time_str
        .as_deref()
        .map(|s| parse_timestamp(4, s))
        .transpose()?;
    let created_at = parse_timestamp(6, &created_str)?;

    Ok(Conversation {
        id: ConversationId::new(id),
        participant_ids,
        is_group,
        last_message_text,
        last_message_time,
        unread_count,
        created_at,
    })
}
