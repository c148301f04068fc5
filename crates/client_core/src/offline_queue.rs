use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, RoomId, UserId};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch, Mutex, Notify,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionManager, ConnectionState},
    protocol_client::{ChatProtocol, ProtocolError},
};

const QUEUE_EVENT_BUFFER: usize = 256;

/// A message as composed by the local user, before any server involvement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub reply_to_message_id: Option<MessageId>,
    /// Opaque references to already uploaded attachments. Local only.
    pub attachment_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn new(sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender_id,
            content: content.into(),
            reply_to_message_id: None,
            attachment_refs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }

    pub fn with_attachment(mut self, attachment_ref: impl Into<String>) -> Self {
        self.attachment_refs.push(attachment_ref.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedAction {
    Send {
        message: OutgoingMessage,
        room_id: RoomId,
    },
    Edit {
        message_id: MessageId,
        new_content: String,
        room_id: RoomId,
    },
    Delete {
        message_id: MessageId,
        room_id: RoomId,
    },
}

impl QueuedAction {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Send { room_id, .. }
            | Self::Edit { room_id, .. }
            | Self::Delete { room_id, .. } => room_id,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Send { message, .. } => &message.message_id,
            Self::Edit { message_id, .. } | Self::Delete { message_id, .. } => message_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Hands `action` to the matching protocol call.
pub async fn transmit(
    protocol: &dyn ChatProtocol,
    action: &QueuedAction,
) -> Result<(), ProtocolError> {
    match action {
        QueuedAction::Send { message, room_id } => {
            protocol
                .send_message(
                    room_id,
                    &message.sender_id,
                    &message.content,
                    &message.message_id,
                    message.reply_to_message_id.as_ref(),
                )
                .await
        }
        QueuedAction::Edit {
            message_id,
            new_content,
            room_id,
        } => protocol.edit_message(room_id, message_id, new_content).await,
        QueuedAction::Delete {
            message_id,
            room_id,
        } => protocol.delete_message(room_id, message_id).await,
    }
}

/// Terminal failure of one action: it will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub action: QueuedAction,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Transmitted(QueuedAction),
    Failed(DeliveryFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue ran empty.
    Completed { transmitted: usize },
    /// A connection failure stopped the drain; the failed action is back at the front.
    Interrupted { transmitted: usize },
    /// Another drain loop owns the queue.
    AlreadyDraining,
}

struct PendingAction {
    action: QueuedAction,
    requeues: u32,
}

#[derive(Default)]
struct QueueState {
    actions: VecDeque<PendingAction>,
    in_flight: bool,
    /// Bumped by every clear; an action popped under an older epoch is not put back.
    epoch: u64,
}

impl QueueState {
    fn size(&self) -> usize {
        self.actions.len() + usize::from(self.in_flight)
    }
}

/// Keeps outgoing actions across disconnection windows and replays them in
/// submission order once the connection is back.
pub struct OfflineActionQueue {
    protocol: Arc<dyn ChatProtocol>,
    max_requeues: Option<u32>,
    state: Mutex<QueueState>,
    drain_lock: Mutex<()>,
    size: watch::Sender<usize>,
    /// `true` once the watcher has prepared the current connection.
    ready: watch::Sender<bool>,
    events: broadcast::Sender<QueueEvent>,
    kick: Notify,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OfflineActionQueue {
    /// `max_requeues` bounds how often one action may be pushed back after a
    /// failed attempt before it is declared a [`DeliveryFailure`]; `None`
    /// retries forever.
    pub fn new(protocol: Arc<dyn ChatProtocol>, max_requeues: Option<u32>) -> Arc<Self> {
        let (size, _) = watch::channel(0);
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(QUEUE_EVENT_BUFFER);
        Arc::new(Self {
            protocol,
            max_requeues,
            state: Mutex::new(QueueState::default()),
            drain_lock: Mutex::new(()),
            size,
            ready,
            events,
            kick: Notify::new(),
            watcher: std::sync::Mutex::new(None),
        })
    }

    pub async fn queue_message(&self, action: QueuedAction) {
        {
            let mut state = self.state.lock().await;
            info!(
                action = action.label(),
                room_id = %action.room_id(),
                message_id = %action.message_id(),
                "queue: action queued"
            );
            state.actions.push_back(PendingAction {
                action,
                requeues: 0,
            });
            self.size.send_replace(state.size());
        }
        self.kick.notify_one();
    }

    pub fn get_queue_size(&self) -> usize {
        *self.size.borrow()
    }

    pub fn watch_size(&self) -> watch::Receiver<usize> {
        self.size.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Whether the watcher finished preparing the live connection. Cleared on
    /// every transition away from `Connected`.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn watch_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Drops every pending action, including one a drain is sending right
    /// now: if that send fails it is not put back. Only for logout or account
    /// switches.
    pub async fn clear_queue(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.actions.len() + usize::from(state.in_flight);
        state.actions.clear();
        state.in_flight = false;
        state.epoch += 1;
        self.size.send_replace(state.size());
        info!(dropped, "queue: cleared");
    }

    /// Drains whenever `connection` becomes `Connected`, and when an action is
    /// queued while already connected. Replaces a previous watcher. The
    /// watcher keeps the queue alive until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>, connection: &ConnectionManager) {
        self.start_with(connection, || std::future::ready(()));
    }

    /// Like [`start`](Self::start), but awaits `prepare` on every transition
    /// into `Connected` before draining. Nothing is drained for that
    /// connection until `prepare` has finished.
    pub fn start_with<F, Fut>(self: &Arc<Self>, connection: &ConnectionManager, prepare: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let transitions = connection.subscribe_state();
        let current = connection.watch_state();
        let task = tokio::spawn(run_watcher(Arc::clone(self), transitions, current, prepare));
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        let task = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Transmits pending actions oldest first until the queue is empty or a
    /// send fails. Only one drain runs at a time.
    pub async fn drain(&self) -> DrainOutcome {
        let Ok(_drain) = self.drain_lock.try_lock() else {
            debug!("queue: drain already running");
            return DrainOutcome::AlreadyDraining;
        };

        let mut transmitted = 0;
        loop {
            let (next, epoch) = {
                let mut state = self.state.lock().await;
                let next = state.actions.pop_front();
                state.in_flight = next.is_some();
                (next, state.epoch)
            };
            let Some(mut pending) = next else {
                if transmitted > 0 {
                    info!(transmitted, "queue: drained");
                }
                return DrainOutcome::Completed { transmitted };
            };

            match transmit(self.protocol.as_ref(), &pending.action).await {
                Ok(()) => {
                    transmitted += 1;
                    self.settle(None, epoch).await;
                    debug!(
                        action = pending.action.label(),
                        message_id = %pending.action.message_id(),
                        "queue: action transmitted"
                    );
                    let _ = self.events.send(QueueEvent::Transmitted(pending.action));
                }
                Err(err) if err.is_retryable() => {
                    pending.requeues += 1;
                    if self.max_requeues.is_some_and(|max| pending.requeues > max) {
                        self.settle(None, epoch).await;
                        self.report_failure(pending.action, &err);
                    } else {
                        warn!(
                            action = pending.action.label(),
                            message_id = %pending.action.message_id(),
                            requeues = pending.requeues,
                            error = %err,
                            "queue: drain interrupted, action pushed back"
                        );
                        self.settle(Some(pending), epoch).await;
                    }
                    return DrainOutcome::Interrupted { transmitted };
                }
                Err(err) => {
                    self.settle(None, epoch).await;
                    self.report_failure(pending.action, &err);
                }
            }
        }
    }

    /// Ends the in-flight slot, putting `requeued` back at the front unless
    /// the queue was cleared since the action was popped.
    async fn settle(&self, requeued: Option<PendingAction>, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            if let Some(pending) = requeued {
                debug!(
                    message_id = %pending.action.message_id(),
                    "queue: cleared while in flight, not requeued"
                );
            }
            return;
        }
        state.in_flight = false;
        if let Some(pending) = requeued {
            state.actions.push_front(pending);
        }
        self.size.send_replace(state.size());
    }

    fn report_failure(&self, action: QueuedAction, err: &ProtocolError) {
        warn!(
            action = action.label(),
            message_id = %action.message_id(),
            error = %err,
            "queue: action dropped after terminal failure"
        );
        let _ = self.events.send(QueueEvent::Failed(DeliveryFailure {
            action,
            reason: err.to_string(),
        }));
    }
}

async fn run_watcher<F, Fut>(
    queue: Arc<OfflineActionQueue>,
    mut transitions: broadcast::Receiver<ConnectionState>,
    current: watch::Receiver<ConnectionState>,
    prepare: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let is_connected = |rx: &watch::Receiver<ConnectionState>| rx.borrow().is_connected();

    if is_connected(&current) {
        prepare().await;
        queue.ready.send_replace(true);
        queue.drain().await;
    }

    loop {
        let connected = tokio::select! {
            biased;
            transition = transitions.recv() => match transition {
                Ok(ConnectionState::Connected) => true,
                Ok(_) => {
                    queue.ready.send_replace(false);
                    continue;
                }
                // Missed transitions: fall back to the current value.
                Err(RecvError::Lagged(_)) => is_connected(&current),
                Err(RecvError::Closed) => return,
            },
            _ = queue.kick.notified() => {
                if queue.is_ready() && is_connected(&current) {
                    queue.drain().await;
                }
                continue;
            }
        };
        if connected {
            prepare().await;
            queue.ready.send_replace(true);
            queue.drain().await;
        } else {
            queue.ready.send_replace(false);
        }
    }
}

#[cfg(test)]
#[path = "tests/offline_queue_tests.rs"]
mod tests;
