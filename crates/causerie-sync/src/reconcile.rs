//! Remote reconciler.
//!
//! Consumes the asynchronous stream of remote snapshots and upserts them into
//! the local store.  The transport guarantees nothing about ordering or
//! duplication, so every rule here is a merge: status only moves forward,
//! receipt sets are unioned, first-occurrence timestamps are written once.
//! Applying the same snapshot twice produces the same stored row as once.

use std::sync::{Arc, Mutex, MutexGuard};

use causerie_shared::{
    ConversationId, ConversationSnapshot, MessageSnapshot, MessageStatus, RemoteEvent, UserId,
};
use causerie_store::{Conversation, Database, Message, StoreError};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, ChangeNotifier};

pub struct Reconciler {
    store: Arc<Mutex<Database>>,
    local_user: UserId,
    notifier: ChangeNotifier,
}

impl Reconciler {
    pub fn new(store: Arc<Mutex<Database>>, local_user: UserId, notifier: ChangeNotifier) -> Self {
        Self {
            store,
            local_user,
            notifier,
        }
    }

    /// Apply one remote event in arrival order.
    pub fn apply(&self, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Message(snapshot) => self.apply_message(snapshot),
            RemoteEvent::Conversation(snapshot) => self.apply_conversation(snapshot),
        }
    }

    fn apply_message(&self, snapshot: MessageSnapshot) -> Result<()> {
        let store = self.store()?;

        match store.get_message(snapshot.id) {
            Err(StoreError::NotFound) => self.insert_new_message(&store, snapshot),
            Ok(existing) => self.merge_message(&store, existing, snapshot),
            Err(e) => Err(e.into()),
        }
    }

    /// First sighting of this id: a message from another participant, or a
    /// remote confirmation arriving on a device that lost its optimistic
    /// copy.
    fn insert_new_message(
        &self,
        store: &MutexGuard<'_, Database>,
        snapshot: MessageSnapshot,
    ) -> Result<()> {
        let inbound = snapshot.sender_id != self.local_user;
        let message = message_from_snapshot(snapshot);

        store.upsert_message(&message)?;
        self.ensure_conversation(store, &message)?;
        if inbound {
            store.increment_unread(&message.conversation_id)?;
        }
        self.touch_conversation_last_message(store, &message)?;

        debug!(msg_id = %message.id, inbound, "stored remote message");
        self.notifier.emit(ChangeEvent::MessageUpserted {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
        });
        self.notifier.emit(ChangeEvent::ConversationUpdated {
            conversation_id: message.conversation_id,
        });
        Ok(())
    }

    /// Merge a snapshot into an existing row, non-destructively.
    fn merge_message(
        &self,
        store: &MutexGuard<'_, Database>,
        existing: Message,
        snapshot: MessageSnapshot,
    ) -> Result<()> {
        let mut merged = existing.clone();

        merged.status = existing.status.merged_with(snapshot.status);
        merged.delivered_to.extend(snapshot.delivered_to);
        merged.read_by.extend(snapshot.read_by);
        if merged.delivered_at.is_none() {
            merged.delivered_at = snapshot.delivered_at;
        }
        if merged.read_at.is_none() {
            merged.read_at = snapshot.read_at;
        }
        // Server clock is authoritative once the message exists remotely.
        merged.timestamp = snapshot.timestamp;
        if merged.body.is_none() {
            merged.body = snapshot.text;
        }
        if merged.media_ref.is_none() {
            merged.media_ref = snapshot.media_ref;
        }

        // Receipt-driven transitions the snapshot status may not carry yet.
        if merged.delivered_to.iter().any(|u| *u != merged.sender_id) {
            merged.status = merged.status.merged_with(MessageStatus::Delivered);
        }
        if merged.has_non_sender_reader() && merged.status.can_become_read() {
            merged.status = MessageStatus::Read;
            if merged.read_at.is_none() {
                merged.read_at = Some(merged.timestamp);
            }
        }

        if merged == existing {
            // Duplicate delivery; nothing to write, nothing to announce.
            return Ok(());
        }

        store.upsert_message(&merged)?;

        debug!(msg_id = %merged.id, status = %merged.status, "merged remote snapshot");
        self.notifier.emit(ChangeEvent::MessageUpserted {
            conversation_id: merged.conversation_id.clone(),
            message_id: merged.id,
        });
        if merged.status != existing.status {
            self.notifier.emit(ChangeEvent::MessageStatusChanged {
                conversation_id: merged.conversation_id,
                message_id: merged.id,
                status: merged.status,
            });
        }
        Ok(())
    }

    fn apply_conversation(&self, snapshot: ConversationSnapshot) -> Result<()> {
        let store = self.store()?;

        // The local user was removed: the conversation disappears from the
        // local view.  Its messages are retained.
        if !snapshot.participant_ids.contains(&self.local_user) {
            let deleted = store.delete_conversation(&snapshot.id)?;
            drop(store);
            if deleted {
                info!(conversation = %snapshot.id, "removed conversation, local user no longer a participant");
                self.notifier.emit(ChangeEvent::ConversationDeleted {
                    conversation_id: snapshot.id,
                });
            }
            return Ok(());
        }

        let merged = match store.get_conversation(&snapshot.id) {
            Ok(existing) => Conversation {
                id: existing.id,
                participant_ids: snapshot.participant_ids,
                is_group: snapshot.is_group,
                // Server-authoritative over locally-optimistic values.
                last_message_text: snapshot.last_message_text.or(existing.last_message_text),
                last_message_time: snapshot.last_message_time.or(existing.last_message_time),
                unread_count: existing.unread_count,
                created_at: existing.created_at,
            },
            Err(StoreError::NotFound) => Conversation {
                id: snapshot.id,
                participant_ids: snapshot.participant_ids,
                is_group: snapshot.is_group,
                last_message_text: snapshot.last_message_text,
                last_message_time: snapshot.last_message_time,
                unread_count: 0,
                created_at: Utc::now(),
            },
            Err(e) => return Err(e.into()),
        };

        store.upsert_conversation(&merged)?;
        drop(store);

        debug!(conversation = %merged.id, "merged remote conversation");
        self.notifier.emit(ChangeEvent::ConversationUpdated {
            conversation_id: merged.id,
        });
        Ok(())
    }

    /// Create a minimal conversation when a message snapshot arrives before
    /// its conversation document.  Participants beyond the sender and the
    /// local user are filled in by the conversation snapshot when it lands.
    fn ensure_conversation(
        &self,
        store: &MutexGuard<'_, Database>,
        message: &Message,
    ) -> Result<()> {
        match store.get_conversation(&message.conversation_id) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound) => {
                let direct_id = ConversationId::direct(&self.local_user, &message.sender_id);
                let convo = Conversation {
                    id: message.conversation_id.clone(),
                    participant_ids: [self.local_user.clone(), message.sender_id.clone()]
                        .into_iter()
                        .collect(),
                    is_group: message.conversation_id != direct_id,
                    last_message_text: None,
                    last_message_time: None,
                    unread_count: 0,
                    created_at: Utc::now(),
                };
                store.upsert_conversation(&convo)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn touch_conversation_last_message(
        &self,
        store: &MutexGuard<'_, Database>,
        message: &Message,
    ) -> Result<()> {
        let newer = match store.get_conversation(&message.conversation_id) {
            Ok(convo) => convo
                .last_message_time
                .map_or(true, |t| message.timestamp >= t),
            Err(StoreError::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        if newer {
            store.update_conversation_last_message(
                &message.conversation_id,
                message.body.as_deref(),
                message.timestamp,
            )?;
        }
        Ok(())
    }

    fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }
}

fn message_from_snapshot(snapshot: MessageSnapshot) -> Message {
    Message {
        id: snapshot.id,
        conversation_id: snapshot.conversation_id,
        sender_id: snapshot.sender_id,
        body: snapshot.text,
        media_ref: snapshot.media_ref,
        timestamp: snapshot.timestamp,
        status: snapshot.status,
        delivered_to: snapshot.delivered_to,
        read_by: snapshot.read_by,
        delivered_at: snapshot.delivered_at,
        read_at: snapshot.read_at,
    }
}
