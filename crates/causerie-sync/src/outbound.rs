//! Outbound queue processor.
//!
//! Drains queued messages in creation order, attempts the remote send, and
//! applies the retry policy.  Backoff gates the re-attempt timing of each
//! entry individually; one entry waiting out its backoff never blocks the
//! others.  All coordination happens through the store: queue presence,
//! retry counters, and message status are the only shared state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use causerie_shared::{MessageId, MessageStatus, TransportError};
use causerie_store::{Database, Message, QueuedEntry, StoreError};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::retry::RetryPolicy;
use crate::transport::{OutgoingMessage, RemoteAck, RemoteTransport};

/// Drains the outbox against the remote transport.
///
/// Cloning is cheap; clones share the drain guard, so a concurrent
/// [`drain`](Self::drain) on any clone is a no-op.
#[derive(Clone)]
pub struct OutboundProcessor {
    store: Arc<Mutex<Database>>,
    transport: Arc<dyn RemoteTransport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    notifier: ChangeNotifier,
    draining: Arc<AtomicBool>,
    kick: Arc<Notify>,
}

impl OutboundProcessor {
    pub fn new(
        store: Arc<Mutex<Database>>,
        transport: Arc<dyn RemoteTransport>,
        policy: RetryPolicy,
        send_timeout: Duration,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            send_timeout,
            notifier,
            draining: Arc::new(AtomicBool::new(false)),
            kick: Arc::new(Notify::new()),
        }
    }

    /// Store a queue entry for the message and return immediately.
    ///
    /// Returns `false` when the message is already queued; the existing
    /// entry keeps its retry state.  A drain sleeping out a backoff window
    /// is woken so a fresh entry is not stuck behind it.
    pub fn enqueue(&self, message: &Message) -> Result<bool> {
        let entry = QueuedEntry::new(message.id, message.payload(), Utc::now());
        let inserted = self.store()?.enqueue_entry(&entry)?;
        if inserted {
            debug!(msg_id = %message.id, "message enqueued");
        }
        self.kick.notify_one();
        Ok(inserted)
    }

    /// Drain the queue until every entry has either been delivered, failed
    /// terminally, or the queue is empty.
    ///
    /// Idempotent and re-entrant-safe: if a drain is already running, this
    /// call returns immediately without touching the queue.  Callers that
    /// must not wait (UI paths) spawn it as a task.
    pub async fn drain(&self) -> Result<()> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.drain_loop().await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_loop(&self) -> Result<()> {
        loop {
            let entries = self.store()?.list_entries()?;
            if entries.is_empty() {
                return Ok(());
            }

            let now = Utc::now();
            let mut next_due: Option<DateTime<Utc>> = None;
            let mut progressed = false;

            for entry in entries {
                if self.policy.is_exhausted(entry.retry_count) {
                    self.give_up(entry.message_id)?;
                    progressed = true;
                    continue;
                }

                let due_at = self.policy.next_attempt_at(&entry);
                if due_at > now {
                    // Entry is inside its backoff window; skip it without
                    // blocking the rest of the queue.
                    next_due = Some(next_due.map_or(due_at, |d| d.min(due_at)));
                    continue;
                }

                self.attempt(&entry).await?;
                progressed = true;
            }

            if progressed {
                continue;
            }

            // Everything left is waiting out a backoff window.  Sleep until
            // the earliest one is due, or until a fresh enqueue kicks us.
            let Some(due_at) = next_due else {
                return Ok(());
            };
            let wait = (due_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait + self.policy.jitter_sample()) => {}
                _ = self.kick.notified() => {}
            }
        }
    }

    /// One send attempt for one queue entry.
    async fn attempt(&self, entry: &QueuedEntry) -> Result<()> {
        // Re-read the message: the user may have deleted it since enqueue.
        let Some(message) = self.get_message_opt(entry.message_id)? else {
            ignore_missing(self.store()?.remove_entry(entry.message_id).map(|_| ()))?;
            debug!(msg_id = %entry.message_id, "dropping queue entry for deleted message");
            return Ok(());
        };

        let outgoing = OutgoingMessage {
            id: message.id,
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            payload: entry.payload.clone(),
            timestamp: message.timestamp,
        };

        debug!(
            msg_id = %message.id,
            attempt = entry.retry_count + 1,
            "attempting remote send"
        );

        let sent = match tokio::time::timeout(self.send_timeout, self.transport.send(&outgoing))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match sent {
            Ok(ack) => self.complete(entry.message_id, ack),
            Err(error) if error.is_transient() => {
                ignore_missing(self.store()?.record_attempt(entry.message_id, Utc::now()))?;
                warn!(
                    msg_id = %entry.message_id,
                    error = %error,
                    retry_count = entry.retry_count + 1,
                    "send failed, will retry"
                );
                if self.policy.is_exhausted(entry.retry_count + 1) {
                    self.give_up(entry.message_id)?;
                }
                Ok(())
            }
            Err(error) => {
                warn!(msg_id = %entry.message_id, error = %error, "send rejected permanently");
                self.give_up(entry.message_id)?;
                Ok(())
            }
        }
    }

    /// The remote store accepted the message: drop the queue entry, advance
    /// the status, and refresh the conversation's last-message fields.
    fn complete(&self, message_id: MessageId, ack: RemoteAck) -> Result<()> {
        let conversation_id;
        let status;
        {
            let store = self.store()?;
            store.remove_entry(message_id)?;

            // The user may have deleted the message while the send was in
            // flight; the ack is dropped and the entry is already gone.
            let mut message = match store.get_message(message_id) {
                Ok(message) => message,
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            // merged_with: a snapshot may have advanced the status to Read
            // while the send was in flight.
            message.status = message.status.merged_with(MessageStatus::Delivered);
            message.timestamp = ack.server_timestamp;
            if message.delivered_at.is_none() {
                message.delivered_at = Some(ack.server_timestamp);
            }
            store.upsert_message(&message)?;

            ignore_missing(store.update_conversation_last_message(
                &message.conversation_id,
                message.body.as_deref(),
                ack.server_timestamp,
            ))?;

            conversation_id = message.conversation_id;
            status = message.status;
        }

        info!(msg_id = %message_id, "message delivered");
        self.notifier.emit(ChangeEvent::MessageStatusChanged {
            conversation_id: conversation_id.clone(),
            message_id,
            status,
        });
        self.notifier
            .emit(ChangeEvent::ConversationUpdated { conversation_id });
        Ok(())
    }

    /// Terminal failure: drop the queue entry and mark the message failed.
    /// No further automatic retries; the user can retry explicitly.
    fn give_up(&self, message_id: MessageId) -> Result<()> {
        let conversation_id;
        {
            let store = self.store()?;
            store.remove_entry(message_id)?;
            match store.get_message(message_id) {
                Ok(message) => {
                    store.update_message_status(message_id, MessageStatus::Failed)?;
                    conversation_id = message.conversation_id;
                }
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        info!(msg_id = %message_id, "message failed, retries exhausted");
        self.notifier.emit(ChangeEvent::MessageStatusChanged {
            conversation_id,
            message_id,
            status: MessageStatus::Failed,
        });
        Ok(())
    }

    fn get_message_opt(&self, id: MessageId) -> Result<Option<Message>> {
        match self.store()?.get_message(id) {
            Ok(message) => Ok(Some(message)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }
}

fn ignore_missing(result: std::result::Result<(), StoreError>) -> std::result::Result<(), StoreError> {
    match result {
        Err(StoreError::NotFound) => Ok(()),
        other => other,
    }
}
