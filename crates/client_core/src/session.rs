use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures::{Stream, StreamExt};
use shared::domain::{MessageId, RoomId};
use storage::MessageRepository;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    connection::{ConnectionManager, ConnectionState},
    offline_queue::{
        transmit, DeliveryFailure, OfflineActionQueue, OutgoingMessage, QueueEvent, QueuedAction,
    },
    protocol_client::{ChatEvent, ChatProtocol, ProtocolClient},
    reconciler::{DeliveryReconciler, ReconcileError, ReconcilerUpdate, TimelineEntry},
    transport::TransportConnector,
};

/// Wires connection, protocol, offline queue and reconciler together and is
/// the only place that decides between sending now and queuing.
pub struct ChatSession {
    settings: ClientSettings,
    connection: Arc<ConnectionManager>,
    protocol: Arc<ProtocolClient>,
    queue: Arc<OfflineActionQueue>,
    reconciler: Arc<DeliveryReconciler>,
    rooms: Arc<Mutex<HashMap<RoomId, JoinHandle<()>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        settings: ClientSettings,
        connector: Arc<dyn TransportConnector>,
        repository: Arc<dyn MessageRepository>,
    ) -> Arc<Self> {
        let connection = ConnectionManager::new(connector, settings.connection_options());
        let protocol = ProtocolClient::new(Arc::clone(&connection), settings.user_id.clone());
        let queue = OfflineActionQueue::new(
            Arc::clone(&protocol) as Arc<dyn ChatProtocol>,
            settings.max_requeue_attempts,
        );
        let reconciler = DeliveryReconciler::new(settings.user_id.clone(), repository);
        Arc::new(Self {
            settings,
            connection,
            protocol,
            queue,
            reconciler,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Starts the background workers and opens the connection. Returns once
    /// the first connection is ready for direct sends or the attempt failed.
    pub async fn start(&self) {
        self.start_queue();

        let mut tasks = vec![self.spawn_queue_forwarder()];
        if let Some(task) = self.spawn_heartbeat() {
            tasks.push(task);
        }
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(
            server_url = %self.settings.server_url,
            user_id = %self.settings.user_id,
            "session: started"
        );
        self.connection.connect().await;
        if self.connection.state().is_connected() {
            let mut ready = self.queue.watch_ready();
            let became_ready = tokio::time::timeout(
                self.settings.connect_timeout,
                ready.wait_for(|ready| *ready),
            )
            .await
            .is_ok_and(|waited| waited.is_ok());
            if !became_ready {
                warn!("session: connection not ready in time, sends will be queued");
            }
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn reconciler(&self) -> &Arc<DeliveryReconciler> {
        &self.reconciler
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn queued_messages_count(&self) -> usize {
        self.queue.get_queue_size()
    }

    pub fn watch_queued_messages_count(&self) -> watch::Receiver<usize> {
        self.queue.watch_size()
    }

    pub fn observe_room(&self, room_id: RoomId) -> impl Stream<Item = ChatEvent> + Send + 'static {
        self.protocol.observe_room(room_id)
    }

    pub async fn timeline(&self, room_id: &RoomId) -> Vec<TimelineEntry> {
        self.reconciler.timeline(room_id).await
    }

    pub fn subscribe_updates(&self) -> tokio::sync::broadcast::Receiver<ReconcilerUpdate> {
        self.reconciler.subscribe()
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut joined: Vec<RoomId> = rooms.keys().cloned().collect();
        joined.sort();
        joined
    }

    /// Starts feeding the room's events into the reconciler, seeds it from
    /// stored history and announces the join when connected. Joining twice is
    /// a no-op.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), ReconcileError> {
        {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            if rooms.contains_key(room_id) {
                return Ok(());
            }
            // Subscribe before loading history so nothing arriving meanwhile is missed.
            let observer = self.spawn_room_observer(room_id.clone());
            rooms.insert(room_id.clone(), observer);
        }

        if self.connection.state().is_connected() {
            let _ = self.protocol.join_room(room_id).await;
        }
        self.reconciler.load_history(room_id).await?;
        Ok(())
    }

    pub async fn leave_room(&self, room_id: &RoomId) {
        let observer = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room_id);
        let Some(observer) = observer else {
            return;
        };
        observer.abort();
        if self.connection.state().is_connected() {
            let _ = self.protocol.leave_room(room_id).await;
        }
    }

    /// Registers the message as `Sending` and transmits or queues it.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        content: &str,
        reply_to_message_id: Option<MessageId>,
    ) -> MessageId {
        let mut message = OutgoingMessage::new(self.settings.user_id.clone(), content);
        message.reply_to_message_id = reply_to_message_id;
        self.send_outgoing(room_id, message).await
    }

    pub async fn send_outgoing(&self, room_id: &RoomId, message: OutgoingMessage) -> MessageId {
        self.reconciler.begin_send(room_id, &message).await;
        let message_id = message.message_id.clone();
        self.submit(QueuedAction::Send {
            message,
            room_id: room_id.clone(),
        })
        .await;
        message_id
    }

    pub async fn edit_message(&self, room_id: &RoomId, message_id: &MessageId, new_content: &str) {
        self.submit(QueuedAction::Edit {
            message_id: message_id.clone(),
            new_content: new_content.to_string(),
            room_id: room_id.clone(),
        })
        .await;
    }

    pub async fn delete_message(&self, room_id: &RoomId, message_id: &MessageId) {
        self.submit(QueuedAction::Delete {
            message_id: message_id.clone(),
            room_id: room_id.clone(),
        })
        .await;
    }

    /// Sends a `Failed` message again under the same message id.
    pub async fn retry_message(&self, message_id: &MessageId) -> Result<(), ReconcileError> {
        let (room_id, message) = self.reconciler.begin_retry(message_id).await?;
        self.submit(QueuedAction::Send { message, room_id }).await;
        Ok(())
    }

    /// Drops everything still queued and closes the connection.
    pub async fn logout(&self) {
        self.queue.clear_queue().await;
        self.connection.disconnect().await;
        info!(user_id = %self.settings.user_id, "session: logged out");
    }

    /// Stops every background worker and disconnects. Queued actions stay
    /// queued.
    pub async fn shutdown(&self) {
        self.abort_workers();
        self.connection.disconnect().await;
        info!("session: shut down");
    }

    /// Sends right away only when connected, with the rooms rejoined and
    /// nothing queued ahead, so queued actions keep their place in line. A connection-level failure
    /// moves the action onto the queue.
    async fn submit(&self, action: QueuedAction) {
        if self.connection.state().is_connected()
            && self.queue.is_ready()
            && self.queue.get_queue_size() == 0
        {
            match transmit(self.protocol.as_ref(), &action).await {
                Ok(()) => {
                    self.reconciler
                        .apply_queue_event(&QueueEvent::Transmitted(action))
                        .await;
                    return;
                }
                Err(err) if err.is_retryable() => {
                    info!(
                        room_id = %action.room_id(),
                        message_id = %action.message_id(),
                        error = %err,
                        "session: direct send failed, queuing"
                    );
                }
                Err(err) => {
                    self.reconciler
                        .apply_queue_event(&QueueEvent::Failed(DeliveryFailure {
                            action,
                            reason: err.to_string(),
                        }))
                        .await;
                    return;
                }
            }
        }
        self.queue.queue_message(action).await;
    }

    fn spawn_room_observer(&self, room_id: RoomId) -> JoinHandle<()> {
        let mut events = Box::pin(self.protocol.observe_room(room_id.clone()));
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(err) = reconciler.apply_event(&room_id, event).await {
                    warn!(room_id = %room_id, error = %err, "session: failed to apply room event");
                }
            }
        })
    }

    fn spawn_queue_forwarder(&self) -> JoinHandle<()> {
        let mut events = self.queue.subscribe_events();
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => reconciler.apply_queue_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: queue events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Every transition into `Connected` first re-announces the joined rooms
    /// and only then replays the queue; the server drops messages for rooms
    /// the connection has not joined.
    fn start_queue(&self) {
        let protocol = Arc::clone(&self.protocol);
        let rooms = Arc::clone(&self.rooms);
        self.queue.start_with(&self.connection, move || {
            let protocol = Arc::clone(&protocol);
            let joined: Vec<RoomId> = rooms
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect();
            async move {
                for room_id in joined {
                    if let Err(err) = protocol.join_room(&room_id).await {
                        warn!(room_id = %room_id, error = %err, "session: rejoin failed");
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let period = self.settings.heartbeat_interval;
        if period.is_zero() {
            debug!("session: heartbeat disabled");
            return None;
        }
        let protocol = Arc::clone(&self.protocol);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !protocol.connection().state().is_connected() {
                    continue;
                }
                if let Err(err) = protocol.send_heartbeat().await {
                    debug!(error = %err, "session: heartbeat not sent");
                }
            }
        }))
    }

    fn abort_workers(&self) {
        self.queue.stop();
        let tasks = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        let observers = std::mem::take(&mut *self.rooms.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, observer) in observers {
            observer.abort();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.abort_workers();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
