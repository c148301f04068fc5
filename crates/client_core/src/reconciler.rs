use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use shared::domain::{MessageId, RoomId, UserId};
use storage::{MessageRepository, StoredMessage};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::{
    offline_queue::{DeliveryFailure, OutgoingMessage, QueueEvent, QueuedAction},
    protocol_client::ChatEvent,
};

const UPDATE_BUFFER: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    /// Handed to the transport; no echo yet.
    Sent,
    /// Echoed back by the server.
    Delivered,
    Failed(String),
}

impl DeliveryState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Client-generated id of one optimistic record. A retry gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticMessageRecord {
    pub local_id: LocalId,
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub attachment_refs: Vec<String>,
    /// Set when an edit arrived before the message was confirmed.
    pub edited: bool,
}

/// One row of the merged per-room message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to_message_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    /// Set while an optimistic record backs this entry.
    pub local_id: Option<LocalId>,
    pub is_mine: bool,
    pub edited: bool,
    pub deleted: bool,
    pub attachment_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerUpdate {
    RecordChanged(OptimisticMessageRecord),
    RecordRetired {
        room_id: RoomId,
        message_id: MessageId,
    },
    ConfirmedAdded(StoredMessage),
    ConfirmedChanged(StoredMessage),
    System {
        room_id: RoomId,
        content: String,
        timestamp: DateTime<Utc>,
    },
    ServerError {
        room_id: RoomId,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no optimistic record for message {0}")]
    UnknownMessage(MessageId),
    #[error("message {message_id} is {state:?}, only failed messages can be retried")]
    NotRetryable {
        message_id: MessageId,
        state: DeliveryState,
    },
    #[error("failed to load history for room {room_id}: {reason}")]
    History { room_id: RoomId, reason: String },
    #[error("failed to persist message {message_id}: {reason}")]
    Persist {
        message_id: MessageId,
        reason: String,
    },
}

#[derive(Default)]
struct ReconcilerState {
    optimistic: HashMap<MessageId, OptimisticMessageRecord>,
    /// Per room, ordered by server timestamp; equal timestamps keep arrival order.
    confirmed: HashMap<RoomId, Vec<StoredMessage>>,
    /// Confirmed in the view but not yet accepted by the repository.
    unsaved: HashSet<MessageId>,
}

impl ReconcilerState {
    fn confirmed_mut(&mut self, room_id: &RoomId, message_id: &MessageId) -> Option<&mut StoredMessage> {
        self.confirmed
            .get_mut(room_id)
            .and_then(|messages| messages.iter_mut().find(|m| &m.message_id == message_id))
    }

    /// Returns `false` when the message was already confirmed.
    fn insert_confirmed(&mut self, message: StoredMessage) -> bool {
        let messages = self.confirmed.entry(message.room_id.clone()).or_default();
        if messages.iter().any(|m| m.message_id == message.message_id) {
            return false;
        }
        let position = messages.partition_point(|m| m.sent_at <= message.sent_at);
        messages.insert(position, message);
        true
    }
}

/// Merges optimistic local sends with server-confirmed history into one view
/// per room. Reads run concurrently; writes are serialized by the state lock.
pub struct DeliveryReconciler {
    local_user: UserId,
    repository: Arc<dyn MessageRepository>,
    state: RwLock<ReconcilerState>,
    next_local_id: AtomicU64,
    updates: broadcast::Sender<ReconcilerUpdate>,
}

impl DeliveryReconciler {
    pub fn new(local_user: UserId, repository: Arc<dyn MessageRepository>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Arc::new(Self {
            local_user,
            repository,
            state: RwLock::new(ReconcilerState::default()),
            next_local_id: AtomicU64::new(1),
            updates,
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerUpdate> {
        self.updates.subscribe()
    }

    /// Registers a user-initiated send as `Sending`. Any earlier record for the
    /// same message id is replaced.
    pub async fn begin_send(
        &self,
        room_id: &RoomId,
        message: &OutgoingMessage,
    ) -> OptimisticMessageRecord {
        let record = OptimisticMessageRecord {
            local_id: self.allocate_local_id(),
            message_id: message.message_id.clone(),
            room_id: room_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            reply_to_message_id: message.reply_to_message_id.clone(),
            created_at: message.created_at,
            delivery_state: DeliveryState::Sending,
            attachment_refs: message.attachment_refs.clone(),
            edited: false,
        };
        self.state
            .write()
            .await
            .optimistic
            .insert(record.message_id.clone(), record.clone());
        debug!(
            room_id = %room_id,
            message_id = %record.message_id,
            local_id = record.local_id.0,
            "reconciler: optimistic record created"
        );
        self.emit(ReconcilerUpdate::RecordChanged(record.clone()));
        record
    }

    /// `Sending` to `Sent`. Never downgrades a delivered record.
    pub async fn mark_sent(&self, message_id: &MessageId) -> bool {
        self.transition(message_id, |state| {
            (*state == DeliveryState::Sending).then_some(DeliveryState::Sent)
        })
        .await
    }

    /// Terminal until [`begin_retry`](Self::begin_retry).
    pub async fn mark_failed(&self, message_id: &MessageId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self
            .transition(message_id, |state| {
                matches!(state, DeliveryState::Sending | DeliveryState::Sent)
                    .then(|| DeliveryState::Failed(reason.clone()))
            })
            .await;
        if changed {
            warn!(message_id = %message_id, %reason, "reconciler: delivery failed");
        }
        changed
    }

    /// Puts a failed record back to `Sending` under a fresh local id and
    /// returns what has to be transmitted again, with the same message id.
    pub async fn begin_retry(
        &self,
        message_id: &MessageId,
    ) -> Result<(RoomId, OutgoingMessage), ReconcileError> {
        let mut state = self.state.write().await;
        let record = state
            .optimistic
            .get_mut(message_id)
            .ok_or_else(|| ReconcileError::UnknownMessage(message_id.clone()))?;
        if !record.delivery_state.is_failed() {
            return Err(ReconcileError::NotRetryable {
                message_id: message_id.clone(),
                state: record.delivery_state.clone(),
            });
        }
        record.local_id = self.allocate_local_id();
        record.created_at = Utc::now();
        record.delivery_state = DeliveryState::Sending;
        let outgoing = OutgoingMessage {
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            reply_to_message_id: record.reply_to_message_id.clone(),
            attachment_refs: record.attachment_refs.clone(),
            created_at: record.created_at,
        };
        let room_id = record.room_id.clone();
        let snapshot = record.clone();
        drop(state);

        info!(room_id = %room_id, message_id = %message_id, "reconciler: retrying message");
        self.emit(ReconcilerUpdate::RecordChanged(snapshot));
        Ok((room_id, outgoing))
    }

    /// Folds an outcome of the offline queue into delivery state.
    pub async fn apply_queue_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Transmitted(QueuedAction::Send { message, .. }) => {
                self.mark_sent(&message.message_id).await;
            }
            QueueEvent::Failed(DeliveryFailure {
                action: QueuedAction::Send { message, .. },
                reason,
            }) => {
                self.mark_failed(&message.message_id, reason.clone()).await;
            }
            QueueEvent::Failed(DeliveryFailure { action, reason }) => {
                warn!(
                    room_id = %action.room_id(),
                    message_id = %action.message_id(),
                    %reason,
                    "reconciler: queued edit or delete was dropped"
                );
            }
            QueueEvent::Transmitted(_) => {}
        }
    }

    /// Applies one inbound room event. Confirmed messages are persisted; the
    /// optimistic record of a message is retired only once that succeeded.
    pub async fn apply_event(&self, room_id: &RoomId, event: ChatEvent) -> Result<(), ReconcileError> {
        match event {
            ChatEvent::MessageReceived {
                message_id,
                sender_id,
                content,
                reply_to_message_id,
                timestamp,
            } => {
                let message = StoredMessage {
                    message_id,
                    room_id: room_id.clone(),
                    sender_id,
                    content,
                    reply_to_message_id,
                    sent_at: timestamp,
                    edited: false,
                    deleted: false,
                };
                self.confirm(message).await
            }
            ChatEvent::MessageEdited {
                message_id,
                new_content,
                ..
            } => {
                let changed = {
                    let mut state = self.state.write().await;
                    if let Some(record) = state.optimistic.get_mut(&message_id) {
                        record.content = new_content.clone();
                        record.edited = true;
                    }
                    state.confirmed_mut(room_id, &message_id).map(|message| {
                        message.content = new_content.clone();
                        message.edited = true;
                        message.clone()
                    })
                };
                if let Some(message) = changed {
                    self.emit(ReconcilerUpdate::ConfirmedChanged(message));
                }
                self.repository
                    .update_message_content(room_id, &message_id, &new_content)
                    .await
                    .map_err(|err| ReconcileError::Persist {
                        message_id,
                        reason: format!("{err:#}"),
                    })?;
                Ok(())
            }
            ChatEvent::MessageDeleted { message_id, .. } => {
                let changed = {
                    let mut state = self.state.write().await;
                    state.confirmed_mut(room_id, &message_id).map(|message| {
                        message.deleted = true;
                        message.clone()
                    })
                };
                if let Some(message) = changed {
                    self.emit(ReconcilerUpdate::ConfirmedChanged(message));
                }
                self.repository
                    .mark_message_deleted(room_id, &message_id)
                    .await
                    .map_err(|err| ReconcileError::Persist {
                        message_id,
                        reason: format!("{err:#}"),
                    })?;
                Ok(())
            }
            ChatEvent::SystemMessage { content, timestamp } => {
                self.emit(ReconcilerUpdate::System {
                    room_id: room_id.clone(),
                    content,
                    timestamp,
                });
                Ok(())
            }
            ChatEvent::Error { message } => {
                warn!(room_id = %room_id, %message, "reconciler: server reported an error");
                self.emit(ReconcilerUpdate::ServerError {
                    room_id: room_id.clone(),
                    message,
                });
                Ok(())
            }
        }
    }

    /// Seeds the confirmed view of `room_id` from the repository. Returns how
    /// many messages were new to the view.
    pub async fn load_history(&self, room_id: &RoomId) -> Result<usize, ReconcileError> {
        let history: Vec<StoredMessage> = self
            .repository
            .stream_messages(room_id)
            .try_collect()
            .await
            .map_err(|err| ReconcileError::History {
                room_id: room_id.clone(),
                reason: format!("{err:#}"),
            })?;

        let mut state = self.state.write().await;
        let mut added = 0;
        for message in history {
            if state.insert_confirmed(message) {
                added += 1;
            }
        }
        info!(room_id = %room_id, added, "reconciler: history loaded");
        Ok(added)
    }

    /// Confirmed messages by server time, followed by optimistic records that
    /// have no confirmed copy yet, in local creation order.
    pub async fn timeline(&self, room_id: &RoomId) -> Vec<TimelineEntry> {
        let state = self.state.read().await;
        let confirmed = state.confirmed.get(room_id).map(Vec::as_slice).unwrap_or_default();
        let confirmed_ids: HashSet<&MessageId> = confirmed.iter().map(|m| &m.message_id).collect();

        let mut entries: Vec<TimelineEntry> = confirmed
            .iter()
            .map(|message| {
                let record = state.optimistic.get(&message.message_id);
                TimelineEntry {
                    message_id: message.message_id.clone(),
                    sender_id: message.sender_id.clone(),
                    content: message.content.clone(),
                    reply_to_message_id: message.reply_to_message_id.clone(),
                    timestamp: message.sent_at,
                    delivery_state: DeliveryState::Delivered,
                    local_id: record.map(|r| r.local_id),
                    is_mine: message.sender_id == self.local_user,
                    edited: message.edited,
                    deleted: message.deleted,
                    attachment_refs: record.map(|r| r.attachment_refs.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let mut pending: Vec<&OptimisticMessageRecord> = state
            .optimistic
            .values()
            .filter(|r| &r.room_id == room_id && !confirmed_ids.contains(&r.message_id))
            .collect();
        pending.sort_by_key(|r| r.local_id);
        entries.extend(pending.into_iter().map(|record| TimelineEntry {
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            reply_to_message_id: record.reply_to_message_id.clone(),
            timestamp: record.created_at,
            delivery_state: record.delivery_state.clone(),
            local_id: Some(record.local_id),
            is_mine: true,
            edited: record.edited,
            deleted: false,
            attachment_refs: record.attachment_refs.clone(),
        }));
        entries
    }

    /// The live optimistic record for `message_id`, if any.
    pub async fn record(&self, message_id: &MessageId) -> Option<OptimisticMessageRecord> {
        self.state.read().await.optimistic.get(message_id).cloned()
    }

    async fn confirm(&self, message: StoredMessage) -> Result<(), ReconcileError> {
        let message_id = message.message_id.clone();
        let room_id = message.room_id.clone();
        let delivered = {
            let mut state = self.state.write().await;
            if !state.insert_confirmed(message.clone()) {
                if !state.unsaved.contains(&message_id) {
                    debug!(room_id = %room_id, message_id = %message_id, "reconciler: duplicate message ignored");
                    return Ok(());
                }
                // Seen before but never persisted: try again with the current copy.
                let Some(current) = state.confirmed_mut(&room_id, &message_id).map(|m| m.clone())
                else {
                    return Ok(());
                };
                drop(state);
                debug!(room_id = %room_id, message_id = %message_id, "reconciler: retrying persist");
                return self.persist_confirmed(current).await;
            }
            state.unsaved.insert(message_id.clone());
            match state.optimistic.get_mut(&message_id) {
                Some(record) if message.sender_id == self.local_user => {
                    record.delivery_state = DeliveryState::Delivered;
                    Some(record.clone())
                }
                _ => None,
            }
        };

        self.emit(ReconcilerUpdate::ConfirmedAdded(message.clone()));
        if let Some(record) = delivered {
            debug!(room_id = %room_id, message_id = %message_id, "reconciler: message delivered");
            self.emit(ReconcilerUpdate::RecordChanged(record));
        }
        self.persist_confirmed(message).await
    }

    /// Appends `message` to the repository, then retires its optimistic record.
    async fn persist_confirmed(&self, message: StoredMessage) -> Result<(), ReconcileError> {
        let message_id = message.message_id.clone();
        let room_id = message.room_id.clone();
        self.repository
            .append_confirmed_message(&room_id, &message)
            .await
            .map_err(|err| ReconcileError::Persist {
                message_id: message_id.clone(),
                reason: format!("{err:#}"),
            })?;

        let retired = {
            let mut state = self.state.write().await;
            state.unsaved.remove(&message_id);
            state.optimistic.remove(&message_id).is_some()
        };
        if retired {
            self.emit(ReconcilerUpdate::RecordRetired { room_id, message_id });
        }
        Ok(())
    }

    async fn transition(
        &self,
        message_id: &MessageId,
        next: impl FnOnce(&DeliveryState) -> Option<DeliveryState>,
    ) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(record) = state.optimistic.get_mut(message_id) else {
                return false;
            };
            let Some(next) = next(&record.delivery_state) else {
                return false;
            };
            record.delivery_state = next;
            record.clone()
        };
        debug!(
            message_id = %message_id,
            state = ?snapshot.delivery_state,
            "reconciler: delivery state changed"
        );
        self.emit(ReconcilerUpdate::RecordChanged(snapshot));
        true
    }

    fn allocate_local_id(&self) -> LocalId {
        LocalId(self.next_local_id.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, update: ReconcilerUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
