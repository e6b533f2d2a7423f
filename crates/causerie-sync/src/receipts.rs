//! Read receipt aggregation.
//!
//! Marks every unread message of a conversation as read by one user: a
//! single batched remote write, then the local mirror of it.  Safe to call
//! redundantly (e.g. on every app-foreground event).

use std::sync::{Arc, Mutex, MutexGuard};

use causerie_shared::{ConversationId, MessageId, MessageStatus, UserId};
use causerie_store::Database;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::transport::RemoteTransport;

pub struct ReceiptAggregator {
    store: Arc<Mutex<Database>>,
    transport: Arc<dyn RemoteTransport>,
    notifier: ChangeNotifier,
}

impl ReceiptAggregator {
    pub fn new(
        store: Arc<Mutex<Database>>,
        transport: Arc<dyn RemoteTransport>,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            store,
            transport,
            notifier,
        }
    }

    /// Mark every message in the conversation that `reader` did not send and
    /// has not read.  Returns the number of messages affected.
    ///
    /// The remote write is one batched transaction, not one write per
    /// message; local state changes only after the batch commits.  With
    /// nothing unread this is a no-op apart from resetting a stale unread
    /// counter.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<usize> {
        let unread = self.store()?.messages_unread_by(conversation_id, reader)?;

        if unread.is_empty() {
            self.store()?.reset_unread(conversation_id)?;
            return Ok(0);
        }

        let message_ids: Vec<MessageId> = unread.iter().map(|m| m.id).collect();
        self.transport
            .batch_mark_read(conversation_id, reader, &message_ids)
            .await?;

        debug!(
            conversation = %conversation_id,
            count = message_ids.len(),
            "remote read batch committed"
        );

        let now = Utc::now();
        let mut status_events = Vec::new();
        {
            let store = self.store()?;
            for mut message in unread {
                message.read_by.insert(reader.clone());

                // First-reader semantics, identical for 1:1 and group
                // threads: one non-sender reader advances the status.
                if message.has_non_sender_reader() && message.status.can_become_read() {
                    if message.status != MessageStatus::Read {
                        status_events.push((message.id, MessageStatus::Read));
                    }
                    message.status = MessageStatus::Read;
                    if message.read_at.is_none() {
                        message.read_at = Some(now);
                    }
                }

                store.update_message_receipts(&message)?;
            }
            store.reset_unread(conversation_id)?;
        }

        for (message_id, status) in status_events {
            self.notifier.emit(ChangeEvent::MessageStatusChanged {
                conversation_id: conversation_id.clone(),
                message_id,
                status,
            });
        }
        self.notifier.emit(ChangeEvent::ConversationUpdated {
            conversation_id: conversation_id.clone(),
        });

        info!(conversation = %conversation_id, reader = %reader, "conversation marked read");
        Ok(message_ids.len())
    }

    fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use causerie_shared::{MessagePayload, MessageId};
    use causerie_store::{Conversation, Message};

    use super::*;
    use crate::transport::MockTransport;

    struct Fixture {
        store: Arc<Mutex<Database>>,
        transport: MockTransport,
        aggregator: ReceiptAggregator,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let store = Arc::new(Mutex::new(db));
        let transport = MockTransport::new();
        let aggregator = ReceiptAggregator::new(
            store.clone(),
            Arc::new(transport.clone()),
            ChangeNotifier::new(),
        );
        Fixture {
            store,
            transport,
            aggregator,
            _dir: dir,
        }
    }

    fn seed_conversation(fixture: &Fixture) -> ConversationId {
        let convo = Conversation::direct(&UserId::new("alice"), &UserId::new("bob"), Utc::now());
        let id = convo.id.clone();
        fixture.store.lock().unwrap().upsert_conversation(&convo).unwrap();
        id
    }

    fn seed_message(fixture: &Fixture, conversation: &ConversationId, sender: &str) -> Message {
        let message = Message::outbound(
            MessageId::new(),
            conversation.clone(),
            UserId::new(sender),
            MessagePayload::text("bonjour"),
            Utc::now(),
            MessageStatus::Delivered,
        );
        let store = fixture.store.lock().unwrap();
        store.upsert_message(&message).unwrap();
        store.increment_unread(conversation).unwrap();
        message
    }

    #[tokio::test]
    async fn marks_unread_messages_and_resets_counter() {
        let fixture = fixture();
        let conversation = seed_conversation(&fixture);
        let from_bob = seed_message(&fixture, &conversation, "bob");
        let own = seed_message(&fixture, &conversation, "alice");

        let affected = fixture
            .aggregator
            .mark_read(&conversation, &UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let store = fixture.store.lock().unwrap();
        let read = store.get_message(from_bob.id).unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        assert!(read.read_by.contains(&UserId::new("alice")));
        assert!(read.read_at.is_some());

        // The reader's own message is untouched.
        assert_eq!(store.get_message(own.id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(store.get_conversation(&conversation).unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn remote_batch_is_single_transaction() {
        let fixture = fixture();
        let conversation = seed_conversation(&fixture);
        let first = seed_message(&fixture, &conversation, "bob");
        let second = seed_message(&fixture, &conversation, "bob");

        fixture
            .aggregator
            .mark_read(&conversation, &UserId::new("alice"))
            .await
            .unwrap();

        let batches = fixture.transport.read_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].message_ids.len(), 2);
        assert!(batches[0].message_ids.contains(&first.id));
        assert!(batches[0].message_ids.contains(&second.id));
    }

    #[tokio::test]
    async fn redundant_call_is_noop() {
        let fixture = fixture();
        let conversation = seed_conversation(&fixture);
        seed_message(&fixture, &conversation, "bob");
        let reader = UserId::new("alice");

        fixture.aggregator.mark_read(&conversation, &reader).await.unwrap();
        let affected = fixture
            .aggregator
            .mark_read(&conversation, &reader)
            .await
            .unwrap();

        assert_eq!(affected, 0);
        // No second remote batch for an already-read conversation.
        assert_eq!(fixture.transport.read_batches().len(), 1);
    }

    #[tokio::test]
    async fn nothing_unread_skips_remote_entirely() {
        let fixture = fixture();
        let conversation = seed_conversation(&fixture);

        let affected = fixture
            .aggregator
            .mark_read(&conversation, &UserId::new("alice"))
            .await
            .unwrap();

        assert_eq!(affected, 0);
        assert!(fixture.transport.read_batches().is_empty());
    }

    #[tokio::test]
    async fn pending_own_messages_cannot_become_read() {
        let fixture = fixture();
        let conversation = seed_conversation(&fixture);

        // A message from bob still waiting on delivery confirmation.
        let message = Message::outbound(
            MessageId::new(),
            conversation.clone(),
            UserId::new("bob"),
            MessagePayload::text("bonjour"),
            Utc::now(),
            MessageStatus::Pending,
        );
        fixture.store.lock().unwrap().upsert_message(&message).unwrap();

        fixture
            .aggregator
            .mark_read(&conversation, &UserId::new("alice"))
            .await
            .unwrap();

        let stored = fixture.store.lock().unwrap().get_message(message.id).unwrap();
        // The read set is recorded, but Read is unreachable from Pending.
        assert!(stored.read_by.contains(&UserId::new("alice")));
        assert_eq!(stored.status, MessageStatus::Pending);
    }
}
