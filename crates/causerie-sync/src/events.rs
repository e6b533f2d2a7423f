//! Change notifications for the UI layer.
//!
//! Every mutation of the local store is announced on a broadcast channel.
//! Events carry the conversation id so a subscriber rendering one thread can
//! filter to it; payloads are serializable so they can be forwarded over IPC
//! unchanged.

use causerie_shared::{ConversationId, MessageId, MessageStatus};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffer size for the broadcast channel; a lagging subscriber loses
/// the oldest events, never blocks the engine.
const CHANNEL_CAPACITY: usize = 256;

/// A change to the locally-stored view.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A message was inserted or its content/receipts changed.
    MessageUpserted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// A message's delivery status changed.
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
    },

    /// A message was deleted by explicit user action.
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// Conversation metadata (participants, last message, unread count)
    /// changed.
    ConversationUpdated { conversation_id: ConversationId },

    /// The conversation was removed locally (the local user is no longer a
    /// participant).
    ConversationDeleted { conversation_id: ConversationId },
}

impl ChangeEvent {
    /// The conversation this event belongs to, for per-thread filtering.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageUpserted { conversation_id, .. }
            | Self::MessageStatusChanged { conversation_id, .. }
            | Self::MessageDeleted { conversation_id, .. }
            | Self::ConversationUpdated { conversation_id }
            | Self::ConversationDeleted { conversation_id } => conversation_id,
        }
    }
}

/// Broadcast sender wrapper shared by all engine components.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all subsequent change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event.  Having no subscribers is not an error; the engine
    /// runs headless in tests and background sync.
    pub fn emit(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("change event dropped, no subscribers");
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
