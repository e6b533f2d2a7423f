//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `conversations`, `messages`, and `outbox`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,  -- deterministic (1:1) or server-assigned (group)
    participant_ids   TEXT NOT NULL,              -- JSON array of user ids
    is_group          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    last_message_text TEXT,
    last_message_time TEXT,                       -- ISO-8601 / RFC-3339
    unread_count      INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- No FK to conversations: conversations are created lazily and a message
-- snapshot may arrive before its conversation document.
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,    -- UUID v4, client-generated
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    body            TEXT,                         -- NULL for media-only messages
    media_ref       TEXT,
    timestamp       TEXT NOT NULL,                -- ISO-8601
    status          TEXT NOT NULL,
    delivered_to    TEXT NOT NULL DEFAULT '[]',   -- JSON array of user ids
    read_by         TEXT NOT NULL DEFAULT '[]',   -- JSON array of user ids
    delivered_at    TEXT,
    read_at         TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp ASC);

CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);

-- ----------------------------------------------------------------
-- Outbox (queued outbound sends)
-- ----------------------------------------------------------------
-- message_id is the primary key: at most one queue entry per message.
CREATE TABLE IF NOT EXISTS outbox (
    message_id      TEXT PRIMARY KEY NOT NULL,    -- FK -> messages(id)
    payload         TEXT NOT NULL,                -- JSON MessagePayload
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_outbox_created ON outbox(created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
