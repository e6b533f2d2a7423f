//! Remote transport abstraction.
//!
//! The engine treats the remote store abstractly: a document store with a
//! server-authoritative clock, reached through this trait.  The concrete
//! network layer lives outside the engine and plugs in here; a
//! [`MockTransport`] ships in the crate for tests and downstream test
//! doubles.
//!
//! Snapshot delivery (the `listen` side) is modeled separately: the network
//! layer feeds [`RemoteEvent`](causerie_shared::RemoteEvent)s into the
//! channel handed out by the engine, which pumps them into the reconciler in
//! arrival order.

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use causerie_shared::{
    ConversationId, MessageId, MessagePayload, TransportError, UserId,
};
use chrono::{DateTime, Utc};

/// An outbound send as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub payload: MessagePayload,
    /// Client-assigned compose time; the remote store replaces it with its
    /// own clock on acceptance.
    pub timestamp: DateTime<Utc>,
}

/// Confirmation returned by the remote store for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    pub message_id: MessageId,
    /// Server-authoritative timestamp assigned to the message.
    pub server_timestamp: DateTime<Utc>,
}

/// Operations the engine needs from the remote store.
///
/// All delivery guarantees are at-least-once; the engine's idempotent merge
/// and the client-generated message ids turn that into exactly-once effects.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Attempt to write one message to the remote store.
    ///
    /// Must be idempotent in the message id: re-sending an id the store has
    /// already accepted returns a fresh ack instead of duplicating the
    /// document.
    async fn send(&self, message: &OutgoingMessage) -> Result<RemoteAck, TransportError>;

    /// Whether a message document with this id exists remotely.  Used by
    /// crash recovery to distinguish "send succeeded before the crash" from
    /// "never left the device".
    async fn exists(&self, id: MessageId) -> Result<bool, TransportError>;

    /// Add `reader` to the read set of every listed message in one remote
    /// transaction.
    async fn batch_mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        message_ids: &[MessageId],
    ) -> Result<(), TransportError>;
}
