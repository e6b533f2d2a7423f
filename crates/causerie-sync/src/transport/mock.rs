//! Mock transport for testing.
//!
//! Allows scripting failures and capturing writes for verification.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use causerie_shared::{ConversationId, MessageId, TransportError, UserId};
use chrono::{DateTime, Utc};

use super::{OutgoingMessage, RemoteAck, RemoteTransport};

/// A captured `batch_mark_read` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub conversation_id: ConversationId,
    pub reader: UserId,
    pub message_ids: Vec<MessageId>,
}

/// Mock transport for testing.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    sent: Vec<OutgoingMessage>,
    read_batches: Vec<ReadBatch>,
    remote_ids: HashSet<MessageId>,
    fail_next_send: Option<TransportError>,
    fail_all_sends: Option<TransportError>,
    ack_timestamp: Option<DateTime<Utc>>,
}

impl MockTransport {
    /// Create a new mock transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all messages that were sent successfully.
    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Get the last message that was sent successfully.
    pub fn last_sent(&self) -> Option<OutgoingMessage> {
        self.inner.lock().unwrap().sent.last().cloned()
    }

    /// Get all captured `batch_mark_read` calls.
    pub fn read_batches(&self) -> Vec<ReadBatch> {
        self.inner.lock().unwrap().read_batches.clone()
    }

    /// Cause the next `send()` to fail with the given error.
    pub fn fail_next_send(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_next_send = Some(error);
    }

    /// Cause every `send()` to fail with the given error until
    /// [`accept_sends`](Self::accept_sends) is called.
    pub fn fail_all_sends(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_all_sends = Some(error);
    }

    /// Clear any scripted send failures.
    pub fn accept_sends(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_all_sends = None;
        inner.fail_next_send = None;
    }

    /// Mark a message id as existing remotely (as if an earlier send had
    /// been accepted before a crash).
    pub fn add_remote_message(&self, id: MessageId) {
        self.inner.lock().unwrap().remote_ids.insert(id);
    }

    /// Pin the server timestamp returned by subsequent acks.
    pub fn set_ack_timestamp(&self, ts: DateTime<Utc>) {
        self.inner.lock().unwrap().ack_timestamp = Some(ts);
    }

    /// Clear all state (messages, scripted failures, remote ids).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<RemoteAck, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_next_send.take() {
            return Err(error);
        }
        if let Some(error) = inner.fail_all_sends.clone() {
            return Err(error);
        }

        inner.sent.push(message.clone());
        inner.remote_ids.insert(message.id);
        Ok(RemoteAck {
            message_id: message.id,
            server_timestamp: inner.ack_timestamp.unwrap_or_else(Utc::now),
        })
    }

    async fn exists(&self, id: MessageId) -> Result<bool, TransportError> {
        Ok(self.inner.lock().unwrap().remote_ids.contains(&id))
    }

    async fn batch_mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        message_ids: &[MessageId],
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_batches.push(ReadBatch {
            conversation_id: conversation_id.clone(),
            reader: reader.clone(),
            message_ids: message_ids.to_vec(),
        });
        Ok(())
    }
}
