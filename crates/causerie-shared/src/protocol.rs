use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, MessageStatus, UserId};

/// Asynchronous remote-store updates delivered to the reconciler.
///
/// Snapshots are immutable point-in-time views keyed by entity id.  The
/// transport may deliver them duplicated or out of order; the reconciler's
/// merge rules absorb both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteEvent {
    /// A message document changed (or appeared) remotely.
    Message(MessageSnapshot),

    /// A conversation document changed remotely.
    Conversation(ConversationSnapshot),
}

/// Point-in-time view of a remote message document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Absent for media-only messages.
    pub text: Option<String>,
    /// Opaque reference to an already-uploaded attachment, if any.
    pub media_ref: Option<String>,
    /// Server-authoritative timestamp.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub delivered_to: BTreeSet<UserId>,
    pub read_by: BTreeSet<UserId>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a remote conversation document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub participant_ids: BTreeSet<UserId>,
    pub is_group: bool,
    pub last_message_text: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl RemoteEvent {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
