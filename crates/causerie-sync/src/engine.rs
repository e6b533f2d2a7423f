//! The engine facade.
//!
//! [`SyncEngine`] wires the components together and owns the background
//! tasks: the reconciler pump consuming remote events in arrival order, and
//! the connectivity watcher that resumes draining when the network returns.
//! Crash recovery runs to completion inside [`SyncEngine::start`], before
//! any background work begins.
//!
//! Every component holds the same `Arc<Mutex<Database>>`; the store is the
//! only shared mutable state and no component holds a lock across a network
//! await, so operations stay re-entrant-safe by construction.

use std::sync::{Arc, Mutex, MutexGuard};

use causerie_shared::{
    ConversationId, MessageId, MessagePayload, MessageStatus, RemoteEvent, UserId,
};
use causerie_store::{Conversation, Database, Message, StoreError};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::outbound::OutboundProcessor;
use crate::receipts::ReceiptAggregator;
use crate::reconcile::Reconciler;
use crate::recovery::{CrashRecovery, RecoveryReport};
use crate::transport::RemoteTransport;

/// Buffer for remote events between the transport adapter and the
/// reconciler pump.
const REMOTE_EVENT_BUFFER: usize = 256;

/// Client-side message synchronization engine.
///
/// Constructed with explicit dependencies (store, transport, identity) so
/// embedders and tests can inject doubles.
pub struct SyncEngine {
    store: Arc<Mutex<Database>>,
    local_user: UserId,
    outbound: OutboundProcessor,
    receipts: ReceiptAggregator,
    notifier: ChangeNotifier,
    connected_tx: watch::Sender<bool>,
    remote_tx: mpsc::Sender<RemoteEvent>,
}

impl SyncEngine {
    /// Run crash recovery, then start the background tasks and return the
    /// ready engine.  The device is considered offline until
    /// [`set_connected`](Self::set_connected) says otherwise.
    pub async fn start(
        config: SyncConfig,
        database: Database,
        transport: Arc<dyn RemoteTransport>,
        local_user: UserId,
    ) -> Result<(Arc<Self>, RecoveryReport)> {
        let store = Arc::new(Mutex::new(database));
        let notifier = ChangeNotifier::new();

        // Recovery must finish before the queue starts draining.
        let recovery = CrashRecovery::new(
            store.clone(),
            transport.clone(),
            config.staleness_threshold,
            notifier.clone(),
        );
        let report = recovery.run().await?;

        let outbound = OutboundProcessor::new(
            store.clone(),
            transport.clone(),
            config.retry_policy(),
            config.send_timeout,
            notifier.clone(),
        );
        let receipts = ReceiptAggregator::new(store.clone(), transport.clone(), notifier.clone());
        let reconciler = Reconciler::new(store.clone(), local_user.clone(), notifier.clone());

        let (connected_tx, connected_rx) = watch::channel(false);
        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_EVENT_BUFFER);

        let engine = Arc::new(Self {
            store,
            local_user,
            outbound,
            receipts,
            notifier,
            connected_tx,
            remote_tx,
        });

        spawn_reconciler_pump(reconciler, remote_rx);
        spawn_connectivity_watcher(engine.outbound.clone(), connected_rx);

        info!(user = %engine.local_user, "sync engine started");
        Ok((engine, report))
    }

    // ------------------------------------------------------------------
    // Wiring for external collaborators
    // ------------------------------------------------------------------

    /// Subscribe to change notifications.  Events carry their conversation
    /// id, so a per-thread view filters with
    /// [`ChangeEvent::conversation_id`].
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    /// Sender half for the transport adapter's `listen` callback: every
    /// snapshot pushed here is applied by the reconciler in arrival order.
    pub fn remote_events(&self) -> mpsc::Sender<RemoteEvent> {
        self.remote_tx.clone()
    }

    /// Feed a connectivity change from the network monitor.  A transition
    /// to connected resumes draining the outbox.
    pub fn set_connected(&self, connected: bool) {
        self.connected_tx.send_replace(connected);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    // ------------------------------------------------------------------
    // UI surface
    // ------------------------------------------------------------------

    /// Compose a message into an existing conversation.
    ///
    /// The message is inserted optimistically and queued for sending; when
    /// the device is offline it starts out `Queued` and waits for
    /// connectivity, otherwise `Pending` -> `Sent` and a drain is kicked off
    /// immediately.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        payload: MessagePayload,
    ) -> Result<MessageId> {
        let connected = self.is_connected();
        let now = Utc::now();
        let initial = if connected {
            MessageStatus::Pending
        } else {
            MessageStatus::Queued
        };

        let mut message = Message::outbound(
            MessageId::new(),
            conversation_id.clone(),
            self.local_user.clone(),
            payload,
            now,
            initial,
        );

        {
            let store = self.store()?;
            // The conversation must exist; use `send_direct_message` for the
            // lazy 1:1 path.
            store.get_conversation(conversation_id)?;
            store.upsert_message(&message)?;
            if connected {
                // Persisted locally: the optimistic copy is safe on disk.
                store.update_message_status(message.id, MessageStatus::Sent)?;
                message.status = MessageStatus::Sent;
            }
            store.update_conversation_last_message(
                conversation_id,
                message.body.as_deref(),
                now,
            )?;
        }

        self.outbound.enqueue(&message)?;

        self.notifier.emit(ChangeEvent::MessageUpserted {
            conversation_id: conversation_id.clone(),
            message_id: message.id,
        });
        self.notifier.emit(ChangeEvent::ConversationUpdated {
            conversation_id: conversation_id.clone(),
        });

        if connected {
            self.spawn_drain();
        }
        Ok(message.id)
    }

    /// Compose a message to a single peer, creating the 1:1 conversation on
    /// first contact.
    pub async fn send_direct_message(
        &self,
        peer: &UserId,
        payload: MessagePayload,
    ) -> Result<MessageId> {
        let conversation_id = ConversationId::direct(&self.local_user, peer);
        {
            let store = self.store()?;
            match store.get_conversation(&conversation_id) {
                Ok(_) => {}
                Err(StoreError::NotFound) => {
                    let convo = Conversation::direct(&self.local_user, peer, Utc::now());
                    store.upsert_conversation(&convo)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.send_message(&conversation_id, payload).await
    }

    /// Explicit user retry of a failed message.  Re-creates a queue entry
    /// with a fresh retry budget and kicks a drain.
    pub async fn retry_message(&self, id: MessageId) -> Result<()> {
        let mut message;
        {
            let store = self.store()?;
            message = store.get_message(id)?;
            if message.status != MessageStatus::Failed {
                return Err(SyncError::NotRetryable(id));
            }
            store.update_message_status(id, MessageStatus::Pending)?;
            message.status = MessageStatus::Pending;
        }

        self.outbound.enqueue(&message)?;
        self.notifier.emit(ChangeEvent::MessageStatusChanged {
            conversation_id: message.conversation_id.clone(),
            message_id: id,
            status: MessageStatus::Pending,
        });

        self.spawn_drain();
        Ok(())
    }

    /// Delete a message locally.  Any queue entry goes with it, so an
    /// in-flight or pending send is cancelled rather than left dangling.
    /// Returns `false` if the message did not exist.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let conversation_id;
        {
            let store = self.store()?;
            match store.get_message(id) {
                Ok(message) => conversation_id = message.conversation_id,
                Err(StoreError::NotFound) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            store.delete_message(id)?;
        }

        self.notifier.emit(ChangeEvent::MessageDeleted {
            conversation_id,
            message_id: id,
        });
        Ok(true)
    }

    /// Mark every unread message in the conversation as read by the local
    /// user.  Safe to call redundantly.
    pub async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<usize> {
        self.receipts
            .mark_read(conversation_id, &self.local_user)
            .await
    }

    /// Messages of one conversation, oldest first.
    pub fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        Ok(self
            .store()?
            .get_messages_for_conversation(conversation_id, limit, offset)?)
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        Ok(self.store()?.get_message(id)?)
    }

    /// All conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.store()?.list_conversations()?)
    }

    /// Manually trigger a drain pass (normally driven by enqueues and the
    /// connectivity signal).  Idempotent; a concurrent drain makes this a
    /// no-op.
    pub async fn drain(&self) -> Result<()> {
        self.outbound.drain().await
    }

    fn spawn_drain(&self) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            if let Err(e) = outbound.drain().await {
                error!(error = %e, "outbound drain failed");
            }
        });
    }

    fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }
}

/// Applies remote events in arrival order.  Out-of-order and duplicated
/// delivery is the reconciler's problem; this loop just preserves arrival
/// order.
fn spawn_reconciler_pump(reconciler: Reconciler, mut remote_rx: mpsc::Receiver<RemoteEvent>) {
    tokio::spawn(async move {
        while let Some(event) = remote_rx.recv().await {
            if let Err(e) = reconciler.apply(event) {
                error!(error = %e, "failed to apply remote event");
            }
        }
    });
}

/// Resumes draining whenever connectivity comes back.
fn spawn_connectivity_watcher(outbound: OutboundProcessor, mut connected_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        while connected_rx.changed().await.is_ok() {
            if *connected_rx.borrow_and_update() {
                info!("connectivity restored, draining outbox");
                if let Err(e) = outbound.drain().await {
                    error!(error = %e, "outbound drain failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use causerie_shared::{MessageSnapshot, TransportError};

    use super::*;
    use crate::transport::MockTransport;

    /// Zero backoff and zero jitter so drains retry immediately.
    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            backoff_jitter: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        transport: MockTransport,
        /// Second connection onto the same database file, for assertions.
        inspector: Database,
        _dir: tempfile::TempDir,
    }

    async fn start_engine() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let database = Database::open_at(&path).unwrap();
        let inspector = Database::open_at(&path).unwrap();
        let transport = MockTransport::new();

        let (engine, _report) = SyncEngine::start(
            test_config(),
            database,
            Arc::new(transport.clone()),
            UserId::new("alice"),
        )
        .await
        .unwrap();

        Fixture {
            engine,
            transport,
            inspector,
            _dir: dir,
        }
    }

    async fn wait_for_status(fixture: &Fixture, id: MessageId, status: MessageStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(message) = fixture.inspector.get_message(id) {
                if message.status == status {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for status {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn offline_send_queues_then_connectivity_delivers_then_snapshot_reads() {
        let fixture = start_engine().await;
        let bob = UserId::new("bob");

        // Offline: the message goes straight to Queued.
        let id = fixture
            .engine
            .send_direct_message(&bob, MessagePayload::text("m1"))
            .await
            .unwrap();
        let queued = fixture.inspector.get_message(id).unwrap();
        assert_eq!(queued.status, MessageStatus::Queued);
        assert!(fixture.inspector.is_queued(id).unwrap());

        // Connectivity restored: the watcher drains and the mock accepts.
        fixture.engine.set_connected(true);
        wait_for_status(&fixture, id, MessageStatus::Delivered).await;
        assert!(!fixture.inspector.is_queued(id).unwrap());

        // The recipient reads it; a remote snapshot arrives.
        let delivered = fixture.inspector.get_message(id).unwrap();
        let snapshot = MessageSnapshot {
            id,
            conversation_id: delivered.conversation_id.clone(),
            sender_id: delivered.sender_id.clone(),
            text: delivered.body.clone(),
            media_ref: None,
            timestamp: delivered.timestamp,
            status: MessageStatus::Delivered,
            delivered_to: BTreeSet::from([bob.clone()]),
            read_by: BTreeSet::from([bob.clone()]),
            delivered_at: delivered.delivered_at,
            read_at: None,
        };
        fixture
            .engine
            .remote_events()
            .send(RemoteEvent::Message(snapshot))
            .await
            .unwrap();

        wait_for_status(&fixture, id, MessageStatus::Read).await;
        let read = fixture.inspector.get_message(id).unwrap();
        assert!(read.read_by.contains(&bob));
        assert!(read.read_at.is_some());
    }

    #[tokio::test]
    async fn online_send_goes_pending_sent_delivered() {
        let fixture = start_engine().await;
        fixture.engine.set_connected(true);

        let id = fixture
            .engine
            .send_direct_message(&UserId::new("bob"), MessagePayload::text("coucou"))
            .await
            .unwrap();

        wait_for_status(&fixture, id, MessageStatus::Delivered).await;
        assert_eq!(fixture.transport.sent_messages().len(), 1);

        let convo_id = ConversationId::direct(&UserId::new("alice"), &UserId::new("bob"));
        let convo = fixture.inspector.get_conversation(&convo_id).unwrap();
        assert_eq!(convo.last_message_text.as_deref(), Some("coucou"));
    }

    #[tokio::test]
    async fn failed_message_can_be_retried_by_user() {
        let fixture = start_engine().await;
        fixture.engine.set_connected(true);
        fixture
            .transport
            .fail_all_sends(TransportError::PermissionDenied("quota".into()));

        let id = fixture
            .engine
            .send_direct_message(&UserId::new("bob"), MessagePayload::text("m"))
            .await
            .unwrap();
        wait_for_status(&fixture, id, MessageStatus::Failed).await;
        assert!(!fixture.inspector.is_queued(id).unwrap());

        // Retrying anything but a failed message is rejected.
        fixture.transport.accept_sends();
        fixture.engine.retry_message(id).await.unwrap();
        wait_for_status(&fixture, id, MessageStatus::Delivered).await;

        let result = fixture.engine.retry_message(id).await;
        assert!(matches!(result, Err(SyncError::NotRetryable(_))));
    }

    #[tokio::test]
    async fn delete_message_cancels_pending_send() {
        let fixture = start_engine().await;

        // Offline, so the entry sits in the queue.
        let id = fixture
            .engine
            .send_direct_message(&UserId::new("bob"), MessagePayload::text("m"))
            .await
            .unwrap();
        assert!(fixture.inspector.is_queued(id).unwrap());

        assert!(fixture.engine.delete_message(id).unwrap());
        assert!(!fixture.inspector.is_queued(id).unwrap());
        assert!(matches!(
            fixture.inspector.get_message(id),
            Err(StoreError::NotFound)
        ));

        // Draining afterwards sends nothing.
        fixture.engine.drain().await.unwrap();
        assert!(fixture.transport.sent_messages().is_empty());
        assert!(!fixture.engine.delete_message(id).unwrap());
    }

    #[tokio::test]
    async fn recovery_runs_before_draining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let database = Database::open_at(&path).unwrap();
        let inspector = Database::open_at(&path).unwrap();
        let transport = MockTransport::new();

        // A message stuck in Pending from a previous process life, already
        // accepted remotely.
        let stuck = Message::outbound(
            MessageId::new(),
            ConversationId::new("alice--bob"),
            UserId::new("alice"),
            MessagePayload::text("m"),
            Utc::now() - chrono::Duration::minutes(10),
            MessageStatus::Pending,
        );
        database.upsert_message(&stuck).unwrap();
        transport.add_remote_message(stuck.id);

        let (_engine, report) = SyncEngine::start(
            test_config(),
            database,
            Arc::new(transport.clone()),
            UserId::new("alice"),
        )
        .await
        .unwrap();

        assert_eq!(report.confirmed, 1);
        assert_eq!(
            inspector.get_message(stuck.id).unwrap().status,
            MessageStatus::Delivered
        );
        // Confirmed, not re-sent.
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn sending_to_unknown_conversation_fails() {
        let fixture = start_engine().await;
        let result = fixture
            .engine
            .send_message(&ConversationId::new("nope"), MessagePayload::text("m"))
            .await;
        assert!(matches!(result, Err(SyncError::Store(StoreError::NotFound))));
    }

    #[tokio::test]
    async fn mark_conversation_read_is_wired_through() {
        let fixture = start_engine().await;

        // An inbound message lands via the reconciler.
        let snapshot = MessageSnapshot {
            id: MessageId::new(),
            conversation_id: ConversationId::direct(&UserId::new("alice"), &UserId::new("bob")),
            sender_id: UserId::new("bob"),
            text: Some("salut".into()),
            media_ref: None,
            timestamp: Utc::now(),
            status: MessageStatus::Delivered,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            delivered_at: None,
            read_at: None,
        };
        let conversation_id = snapshot.conversation_id.clone();
        let message_id = snapshot.id;
        fixture
            .engine
            .remote_events()
            .send(RemoteEvent::Message(snapshot))
            .await
            .unwrap();
        wait_for_status(&fixture, message_id, MessageStatus::Delivered).await;

        let affected = fixture
            .engine
            .mark_conversation_read(&conversation_id)
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(
            fixture.inspector.get_message(message_id).unwrap().status,
            MessageStatus::Read
        );
        assert_eq!(
            fixture
                .inspector
                .get_conversation(&conversation_id)
                .unwrap()
                .unread_count,
            0
        );
    }
}
