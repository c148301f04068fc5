use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use shared::{
    codec,
    domain::{MessageId, RoomId, UserId},
    error::EncodeError,
    protocol::{Envelope, EnvelopeType},
};
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{connection::ConnectionManager, transport::TransportError};

const ENVELOPE_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl ProtocolError {
    /// Connection-level failures are worth replaying after a reconnect; an
    /// envelope that cannot be encoded never will be.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

impl From<TransportError> for ProtocolError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::NotConnected => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

/// Room-scoped event derived from an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageReceived {
        message_id: MessageId,
        sender_id: UserId,
        content: String,
        reply_to_message_id: Option<MessageId>,
        timestamp: DateTime<Utc>,
    },
    MessageEdited {
        message_id: MessageId,
        new_content: String,
        timestamp: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    SystemMessage {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    /// `None` for envelope types that carry nothing for room observers.
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        let timestamp = envelope.timestamp.unwrap_or_else(Utc::now);
        match envelope.kind {
            EnvelopeType::Message => Some(Self::MessageReceived {
                message_id: envelope.message_id,
                sender_id: envelope.sender_id,
                content: envelope.content.unwrap_or_default(),
                reply_to_message_id: envelope.reply_to_message_id,
                timestamp,
            }),
            EnvelopeType::EditMessage => Some(Self::MessageEdited {
                message_id: envelope.message_id,
                new_content: envelope.content.unwrap_or_default(),
                timestamp,
            }),
            EnvelopeType::DeleteMessage => Some(Self::MessageDeleted {
                message_id: envelope.message_id,
                timestamp,
            }),
            EnvelopeType::System => Some(Self::SystemMessage {
                content: envelope.content.unwrap_or_default(),
                timestamp,
            }),
            EnvelopeType::Error => Some(Self::Error {
                message: envelope
                    .content
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
            EnvelopeType::JoinRoom
            | EnvelopeType::LeaveRoom
            | EnvelopeType::Heartbeat
            | EnvelopeType::Unknown(_) => None,
        }
    }
}

/// Outgoing room operations. Success means the envelope was handed to the
/// transport, not that the server saw it.
#[async_trait]
pub trait ChatProtocol: Send + Sync {
    async fn send_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &str,
        message_id: &MessageId,
        reply_to_message_id: Option<&MessageId>,
    ) -> Result<(), ProtocolError>;

    async fn edit_message(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), ProtocolError>;

    async fn delete_message(&self, room_id: &RoomId, message_id: &MessageId)
        -> Result<(), ProtocolError>;

    async fn join_room(&self, room_id: &RoomId) -> Result<(), ProtocolError>;

    async fn leave_room(&self, room_id: &RoomId) -> Result<(), ProtocolError>;
}

/// Stateless translator between room operations and envelopes. It never
/// queues; callers that know about connectivity decide that.
pub struct ProtocolClient {
    connection: Arc<ConnectionManager>,
    local_user: UserId,
    envelopes: broadcast::Sender<Envelope>,
    decoder: JoinHandle<()>,
}

impl ProtocolClient {
    pub fn new(connection: Arc<ConnectionManager>, local_user: UserId) -> Arc<Self> {
        let (envelopes, _) = broadcast::channel(ENVELOPE_BUFFER);
        let decoder = spawn_decoder(connection.subscribe_inbound(), envelopes.clone());
        Arc::new(Self {
            connection,
            local_user,
            envelopes,
            decoder,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Every decoded inbound envelope, all rooms.
    pub fn subscribe_envelopes(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Events of one room. Each call is an independent subscription to the
    /// shared inbound stream; dropping the stream unsubscribes.
    pub fn observe_room(
        &self,
        room_id: RoomId,
    ) -> impl Stream<Item = ChatEvent> + Send + 'static {
        BroadcastStream::new(self.envelopes.subscribe()).filter_map(move |item| {
            let event = match item {
                Ok(envelope) if envelope.room_id == room_id => ChatEvent::from_envelope(envelope),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(room_id = %room_id, skipped, "protocol: room observer lagged");
                    None
                }
            };
            futures::future::ready(event)
        })
    }

    pub async fn send_heartbeat(&self) -> Result<(), ProtocolError> {
        self.dispatch(Envelope::heartbeat(self.local_user.clone())).await
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let envelope = envelope.with_timestamp(Utc::now());
        let frame = codec::encode(&envelope)?;
        self.connection.send(frame).await?;
        debug!(
            kind = %envelope.kind,
            room_id = %envelope.room_id,
            message_id = %envelope.message_id,
            "protocol: envelope handed to transport"
        );
        Ok(())
    }

    fn log_outcome(
        action: &str,
        room_id: &RoomId,
        message_id: Option<&MessageId>,
        result: &Result<(), ProtocolError>,
    ) {
        if let Err(err) = result {
            warn!(
                action,
                room_id = %room_id,
                message_id = message_id.map(|id| id.as_str()).unwrap_or_default(),
                error = %err,
                "protocol: send failed"
            );
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.decoder.abort();
    }
}

#[async_trait]
impl ChatProtocol for ProtocolClient {
    async fn send_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &str,
        message_id: &MessageId,
        reply_to_message_id: Option<&MessageId>,
    ) -> Result<(), ProtocolError> {
        let envelope = Envelope::message(
            room_id.clone(),
            message_id.clone(),
            sender_id.clone(),
            content,
            reply_to_message_id.cloned(),
        );
        let result = self.dispatch(envelope).await;
        Self::log_outcome("send", room_id, Some(message_id), &result);
        result
    }

    async fn edit_message(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), ProtocolError> {
        let envelope = Envelope::edit(
            room_id.clone(),
            message_id.clone(),
            self.local_user.clone(),
            new_content,
        );
        let result = self.dispatch(envelope).await;
        Self::log_outcome("edit", room_id, Some(message_id), &result);
        result
    }

    async fn delete_message(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> Result<(), ProtocolError> {
        let envelope =
            Envelope::delete(room_id.clone(), message_id.clone(), self.local_user.clone());
        let result = self.dispatch(envelope).await;
        Self::log_outcome("delete", room_id, Some(message_id), &result);
        result
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), ProtocolError> {
        let result = self
            .dispatch(Envelope::join(room_id.clone(), self.local_user.clone()))
            .await;
        if result.is_ok() {
            info!(room_id = %room_id, "protocol: join requested");
        }
        Self::log_outcome("join", room_id, None, &result);
        result
    }

    async fn leave_room(&self, room_id: &RoomId) -> Result<(), ProtocolError> {
        let result = self
            .dispatch(Envelope::leave(room_id.clone(), self.local_user.clone()))
            .await;
        if result.is_ok() {
            info!(room_id = %room_id, "protocol: leave requested");
        }
        Self::log_outcome("leave", room_id, None, &result);
        result
    }
}

/// Decodes each inbound frame once for all observers. Malformed frames are
/// logged and dropped so they cannot stall the stream.
fn spawn_decoder(
    mut frames: broadcast::Receiver<Vec<u8>>,
    envelopes: broadcast::Sender<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => match codec::decode(&frame) {
                    Ok(envelope) => {
                        let _ = envelopes.send(envelope);
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            bytes = frame.len(),
                            "protocol: dropping undecodable envelope"
                        );
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "protocol: inbound frames lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
