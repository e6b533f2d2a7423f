//! Crash recovery.
//!
//! Runs exactly once per process start, before the outbound processor begins
//! draining.  A message stuck in Pending/Sent past the staleness threshold
//! means the process died mid-send: either the remote store already has it
//! (confirm, never re-send) or it never left the device (requeue).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use causerie_shared::MessageStatus;
use causerie_store::{Database, Message, QueuedEntry, StoreError};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::transport::RemoteTransport;

/// What one recovery pass did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Confirmed remotely; advanced to Delivered without a re-send.
    pub confirmed: usize,
    /// Absent remotely; a fresh queue entry was created.
    pub requeued: usize,
    /// Already had a queue entry; left untouched.
    pub already_queued: usize,
    /// Could not be recovered; marked Failed for explicit user retry.
    pub failed: usize,
    /// Remote store unreachable; left as-is for the next startup.
    pub skipped: usize,
}

pub struct CrashRecovery {
    store: Arc<Mutex<Database>>,
    transport: Arc<dyn RemoteTransport>,
    staleness_threshold: Duration,
    notifier: ChangeNotifier,
}

impl CrashRecovery {
    pub fn new(
        store: Arc<Mutex<Database>>,
        transport: Arc<dyn RemoteTransport>,
        staleness_threshold: Duration,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            store,
            transport,
            staleness_threshold,
            notifier,
        }
    }

    /// One pass over all stale messages.  Idempotent: every outcome moves
    /// the message out of the stale set, so a second run finds nothing.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let threshold = chrono::Duration::from_std(self.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - threshold;

        let stale = self.store()?.stale_messages(cutoff)?;
        if stale.is_empty() {
            return Ok(RecoveryReport::default());
        }

        info!(count = stale.len(), "recovering messages stuck mid-send");

        let mut report = RecoveryReport::default();
        for message in stale {
            match self.transport.exists(message.id).await {
                Ok(true) => {
                    // The send succeeded before the crash; no re-send.
                    self.confirm(&message)?;
                    report.confirmed += 1;
                }
                Ok(false) => self.requeue(&message, &mut report)?,
                Err(error) => {
                    // Unreachable remote: neither outcome can be proven, and
                    // requeueing a message that was in fact accepted would
                    // duplicate it.  Leave it for the next startup.
                    warn!(msg_id = %message.id, error = %error, "cannot confirm stale message, leaving as-is");
                    report.skipped += 1;
                }
            }
        }

        info!(
            confirmed = report.confirmed,
            requeued = report.requeued,
            already_queued = report.already_queued,
            failed = report.failed,
            skipped = report.skipped,
            "crash recovery finished"
        );
        Ok(report)
    }

    fn confirm(&self, message: &Message) -> Result<()> {
        self.store()?
            .update_message_status(message.id, MessageStatus::Delivered)?;
        self.notifier.emit(ChangeEvent::MessageStatusChanged {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
            status: MessageStatus::Delivered,
        });
        Ok(())
    }

    fn requeue(&self, message: &Message, report: &mut RecoveryReport) -> Result<()> {
        let store = self.store()?;

        if store.is_queued(message.id)? {
            // The outbound processor will pick the existing entry up; a
            // second entry would violate the one-entry-per-message invariant.
            report.already_queued += 1;
            return Ok(());
        }

        let entry = QueuedEntry::new(message.id, message.payload(), Utc::now());
        let queued = store
            .enqueue_entry(&entry)
            .and_then(|_| store.update_message_status(message.id, MessageStatus::Queued));
        drop(store);

        match queued {
            Ok(()) => {
                info!(msg_id = %message.id, "stale message requeued");
                self.notifier.emit(ChangeEvent::MessageStatusChanged {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id,
                    status: MessageStatus::Queued,
                });
                report.requeued += 1;
            }
            Err(error) => {
                // Queueing itself failed; mark the message Failed so the
                // user is not left with a silently stuck message.
                warn!(msg_id = %message.id, error = %error, "requeue failed, marking message failed");
                self.mark_failed(message)?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    fn mark_failed(&self, message: &Message) -> Result<()> {
        match self
            .store()?
            .update_message_status(message.id, MessageStatus::Failed)
        {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.notifier.emit(ChangeEvent::MessageStatusChanged {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
            status: MessageStatus::Failed,
        });
        Ok(())
    }

    fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use causerie_shared::{ConversationId, MessageId, MessagePayload, UserId};

    use super::*;
    use crate::transport::MockTransport;

    struct Fixture {
        store: Arc<Mutex<Database>>,
        transport: MockTransport,
        recovery: CrashRecovery,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let store = Arc::new(Mutex::new(db));
        let transport = MockTransport::new();
        let recovery = CrashRecovery::new(
            store.clone(),
            Arc::new(transport.clone()),
            Duration::from_secs(60),
            ChangeNotifier::new(),
        );
        Fixture {
            store,
            transport,
            recovery,
            _dir: dir,
        }
    }

    fn seed_stale(fixture: &Fixture, status: MessageStatus) -> Message {
        let message = Message::outbound(
            MessageId::new(),
            ConversationId::new("alice--bob"),
            UserId::new("alice"),
            MessagePayload::text("bonjour"),
            Utc::now() - chrono::Duration::minutes(10),
            status,
        );
        fixture.store.lock().unwrap().upsert_message(&message).unwrap();
        message
    }

    #[tokio::test]
    async fn remotely_confirmed_message_becomes_delivered() {
        let fixture = fixture();
        let message = seed_stale(&fixture, MessageStatus::Pending);
        fixture.transport.add_remote_message(message.id);

        let report = fixture.recovery.run().await.unwrap();
        assert_eq!(report.confirmed, 1);

        let store = fixture.store.lock().unwrap();
        assert_eq!(
            store.get_message(message.id).unwrap().status,
            MessageStatus::Delivered
        );
        assert!(!store.is_queued(message.id).unwrap());
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let fixture = fixture();
        let message = seed_stale(&fixture, MessageStatus::Pending);
        fixture.transport.add_remote_message(message.id);

        fixture.recovery.run().await.unwrap();
        let second = fixture.recovery.run().await.unwrap();

        // Second pass finds nothing stale and queues nothing.
        assert_eq!(second, RecoveryReport::default());
        let store = fixture.store.lock().unwrap();
        assert_eq!(
            store.get_message(message.id).unwrap().status,
            MessageStatus::Delivered
        );
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_message_is_requeued() {
        let fixture = fixture();
        let message = seed_stale(&fixture, MessageStatus::Sent);

        let report = fixture.recovery.run().await.unwrap();
        assert_eq!(report.requeued, 1);

        let store = fixture.store.lock().unwrap();
        assert_eq!(
            store.get_message(message.id).unwrap().status,
            MessageStatus::Queued
        );
        let entry = store.get_entry(message.id).unwrap();
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn already_queued_message_is_untouched() {
        let fixture = fixture();
        let message = seed_stale(&fixture, MessageStatus::Pending);
        {
            let store = fixture.store.lock().unwrap();
            let mut entry = QueuedEntry::new(message.id, message.payload(), Utc::now());
            entry.retry_count = 2;
            store.enqueue_entry(&entry).unwrap();
        }

        let report = fixture.recovery.run().await.unwrap();
        assert_eq!(report.already_queued, 1);

        let store = fixture.store.lock().unwrap();
        // No duplicate entry, retry state preserved.
        assert_eq!(store.list_entries().unwrap().len(), 1);
        assert_eq!(store.get_entry(message.id).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn fresh_messages_are_not_touched() {
        let fixture = fixture();
        let message = Message::outbound(
            MessageId::new(),
            ConversationId::new("alice--bob"),
            UserId::new("alice"),
            MessagePayload::text("bonjour"),
            Utc::now(),
            MessageStatus::Pending,
        );
        fixture.store.lock().unwrap().upsert_message(&message).unwrap();

        let report = fixture.recovery.run().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
