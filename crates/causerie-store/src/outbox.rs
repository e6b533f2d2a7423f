//! CRUD operations for [`QueuedEntry`] records (the outbound send queue).
//!
//! The `message_id` primary key enforces the core queue invariant: at most
//! one entry per message at any time.  Entries are drained in creation order
//! and removed on confirmed remote acceptance or retry exhaustion.

use causerie_shared::MessageId;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::parse_timestamp;
use crate::models::QueuedEntry;

impl Database {
    /// Insert a queue entry.  Returns `false` when an entry for the same
    /// message already exists (the existing entry is left untouched).
    pub fn enqueue_entry(&self, entry: &QueuedEntry) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO outbox (message_id, payload, retry_count, last_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                entry.message_id.to_string(),
                serde_json::to_string(&entry.payload)?,
                entry.retry_count,
                entry.last_attempt_at.map(|t| t.to_rfc3339()),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Fetch a single queue entry by message id.
    pub fn get_entry(&self, message_id: MessageId) -> Result<QueuedEntry> {
        self.conn()
            .query_row(
                "SELECT message_id, payload, retry_count, last_attempt_at, created_at
                 FROM outbox
                 WHERE message_id = ?1",
                params![message_id.to_string()],
                row_to_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Whether a queue entry exists for this message.
    pub fn is_queued(&self, message_id: MessageId) -> Result<bool> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM outbox WHERE message_id = ?1",
            params![message_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All queue entries in FIFO (creation) order.
    pub fn list_entries(&self) -> Result<Vec<QueuedEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, payload, retry_count, last_attempt_at, created_at
             FROM outbox
             ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Record a failed send attempt: bump the retry counter and stamp the
    /// attempt time, in one statement.
    pub fn record_attempt(&self, message_id: MessageId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbox
             SET retry_count = retry_count + 1, last_attempt_at = ?2
             WHERE message_id = ?1",
            params![message_id.to_string(), at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Remove a queue entry.  Returns `true` if a row was deleted.
    pub fn remove_entry(&self, message_id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE message_id = ?1",
            params![message_id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`QueuedEntry`].
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedEntry> {
    let id_str: String = row.get(0)?;
    let payload_json: String = row.get(1)?;
    let retry_count: u32 = row.get(2)?;
    let last_attempt_str: Option<String> = row.get(3)?;
    let created_str: String = row.get(4)?;

    let message_id = MessageId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let last_attempt_at = last_attempt_str
        .as_deref()
        .map(|s| parse_timestamp(3, s))
        .transpose()?;
    let created_at = parse_timestamp(4, &created_str)?;

    Ok(QueuedEntry {
        message_id,
        payload,
        retry_count,
        last_attempt_at,
        created_at,
    })
}
