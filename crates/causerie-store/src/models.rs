//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer over IPC.  The store owns the canonical copy of
//! this data; other components work with clones or ids.

use std::collections::BTreeSet;

use causerie_shared::{ConversationId, MessageId, MessagePayload, MessageStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier, generated on the composing client and
    /// immutable for the message's whole life.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Id of the user who composed the message.
    pub sender_id: UserId,
    /// Plain text body; `None` for media-only messages.
    pub body: Option<String>,
    /// Opaque reference to an already-uploaded attachment, if any.
    pub media_ref: Option<String>,
    /// Client-assigned at creation, superseded by the server timestamp once
    /// the remote store accepts the message.
    pub timestamp: DateTime<Utc>,
    /// Delivery state, see [`MessageStatus`].
    pub status: MessageStatus,
    /// Recipients known to have received the message.
    pub delivered_to: BTreeSet<UserId>,
    /// Users known to have read the message.  The sender may appear here for
    /// bookkeeping but never advances the status on its own.
    pub read_by: BTreeSet<UserId>,
    /// First-delivery timestamp; set once, never cleared.
    pub delivered_at: Option<DateTime<Utc>>,
    /// First-read timestamp; set once, never cleared.
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new outbound message in the given initial status.
    pub fn outbound(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        payload: MessagePayload,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            body: payload.text,
            media_ref: payload.media_ref,
            timestamp,
            status,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            delivered_at: None,
            read_at: None,
        }
    }

    /// The send payload for this message's content.
    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            text: self.body.clone(),
            media_ref: self.media_ref.clone(),
        }
    }

    /// Whether anyone other than the sender has read the message.
    ///
    /// The sender is implicitly a reader of their own message; only a
    /// non-sender entry in `read_by` carries read semantics.
    pub fn has_non_sender_reader(&self) -> bool {
        self.read_by.iter().any(|u| *u != self.sender_id)
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Metadata for a 1:1 or group thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Deterministic for 1:1 chats, server-assigned for groups.
    pub id: ConversationId,
    /// Participant set; order is irrelevant.  Always includes the local user
    /// while they remain a participant.
    pub participant_ids: BTreeSet<UserId>,
    /// Whether this is a group thread.
    pub is_group: bool,
    /// Text of the most recent message, for conversation-list views.
    pub last_message_text: Option<String>,
    /// Timestamp of the most recent message.
    pub last_message_time: Option<DateTime<Utc>>,
    /// Number of messages the local user has not read yet.
    pub unread_count: u32,
    /// When the conversation was first seen locally.
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a 1:1 conversation between the local user and one peer.
    pub fn direct(local: &UserId, peer: &UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::direct(local, peer),
            participant_ids: BTreeSet::from([local.clone(), peer.clone()]),
            is_group: false,
            last_message_text: None,
            last_message_time: None,
            unread_count: 0,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// QueuedEntry
// ---------------------------------------------------------------------------

/// An outbound work item, distinct from the [`Message`] it refers to.
///
/// At most one entry exists per message id at any time; the entry is removed
/// on confirmed remote acceptance or converted to a `Failed` message once the
/// retry ceiling is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedEntry {
    /// Foreign key to the message this entry will send.
    pub message_id: MessageId,
    /// Snapshot of the message content at enqueue time.
    pub payload: MessagePayload,
    /// Number of send attempts made so far.
    pub retry_count: u32,
    /// When the most recent attempt was made, if any.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Enqueue time; drives FIFO ordering.
    pub created_at: DateTime<Utc>,
}

impl QueuedEntry {
    /// Fresh entry with no attempts recorded.
    pub fn new(message_id: MessageId, payload: MessagePayload, created_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            payload,
            retry_count: 0,
            last_attempt_at: None,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_alone_is_not_a_reader() {
        let sender = UserId::new("alice");
        let mut msg = Message::outbound(
            MessageId::new(),
            ConversationId::new("alice--bob"),
            sender.clone(),
            MessagePayload::text("salut"),
            Utc::now(),
            MessageStatus::Sent,
        );

        msg.read_by.insert(sender);
        assert!(!msg.has_non_sender_reader());

        msg.read_by.insert(UserId::new("bob"));
        assert!(msg.has_non_sender_reader());
    }
}
