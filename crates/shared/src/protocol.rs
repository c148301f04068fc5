use std::fmt;

use chrono::{DateTime, Utc};

use crate::{
    domain::{MessageId, RoomId, UserId},
    error::EnvelopeError,
};

/// Wire tag of an [`Envelope`]. Tags this client does not know decode to
/// `Unknown` so newer servers cannot crash older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Message,
    EditMessage,
    DeleteMessage,
    JoinRoom,
    LeaveRoom,
    System,
    Error,
    Heartbeat,
    Unknown(String),
}

impl EnvelopeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "MESSAGE",
            Self::EditMessage => "EDIT_MESSAGE",
            Self::DeleteMessage => "DELETE_MESSAGE",
            Self::JoinRoom => "JOIN_ROOM",
            Self::LeaveRoom => "LEAVE_ROOM",
            Self::System => "SYSTEM",
            Self::Error => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "MESSAGE" => Self::Message,
            "EDIT_MESSAGE" => Self::EditMessage,
            "DELETE_MESSAGE" => Self::DeleteMessage,
            "JOIN_ROOM" => Self::JoinRoom,
            "LEAVE_ROOM" => Self::LeaveRoom,
            "SYSTEM" => Self::System,
            "ERROR" => Self::Error,
            "HEARTBEAT" => Self::Heartbeat,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Room-scoped user actions must name the room, the message and the sender.
    fn requires_addressing(&self) -> bool {
        matches!(
            self,
            Self::Message | Self::EditMessage | Self::DeleteMessage | Self::JoinRoom | Self::LeaveRoom
        )
    }

    fn requires_content(&self) -> bool {
        matches!(self, Self::Message | Self::EditMessage)
    }

    fn forbids_content(&self) -> bool {
        matches!(self, Self::DeleteMessage | Self::LeaveRoom)
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat record exchanged with the chat server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeType,
    pub room_id: RoomId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub reply_to_message_id: Option<MessageId>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    fn addressed(kind: EnvelopeType, room_id: RoomId, message_id: MessageId, sender_id: UserId) -> Self {
        Self {
            kind,
            room_id,
            message_id,
            sender_id,
            content: None,
            reply_to_message_id: None,
            timestamp: None,
        }
    }

    pub fn message(
        room_id: RoomId,
        message_id: MessageId,
        sender_id: UserId,
        content: impl Into<String>,
        reply_to_message_id: Option<MessageId>,
    ) -> Self {
        let mut envelope = Self::addressed(EnvelopeType::Message, room_id, message_id, sender_id);
        envelope.content = Some(content.into());
        envelope.reply_to_message_id = reply_to_message_id;
        envelope
    }

    pub fn edit(
        room_id: RoomId,
        message_id: MessageId,
        sender_id: UserId,
        new_content: impl Into<String>,
    ) -> Self {
        let mut envelope =
            Self::addressed(EnvelopeType::EditMessage, room_id, message_id, sender_id);
        envelope.content = Some(new_content.into());
        envelope
    }

    pub fn delete(room_id: RoomId, message_id: MessageId, sender_id: UserId) -> Self {
        Self::addressed(EnvelopeType::DeleteMessage, room_id, message_id, sender_id)
    }

    pub fn join(room_id: RoomId, sender_id: UserId) -> Self {
        Self::addressed(EnvelopeType::JoinRoom, room_id, MessageId::generate(), sender_id)
    }

    pub fn leave(room_id: RoomId, sender_id: UserId) -> Self {
        Self::addressed(EnvelopeType::LeaveRoom, room_id, MessageId::generate(), sender_id)
    }

    pub fn heartbeat(sender_id: UserId) -> Self {
        Self::addressed(
            EnvelopeType::Heartbeat,
            RoomId::default(),
            MessageId::generate(),
            sender_id,
        )
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Checks the per-type field rules: user actions are fully addressed,
    /// `MESSAGE`/`EDIT_MESSAGE` carry content, `DELETE_MESSAGE`/`LEAVE_ROOM` do not.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let kind = || self.kind.as_str().to_string();

        if self.kind.requires_addressing() {
            let required = [
                ("roomId", self.room_id.is_empty()),
                ("messageId", self.message_id.is_empty()),
                ("senderId", self.sender_id.is_empty()),
            ];
            if let Some((field, _)) = required.into_iter().find(|(_, missing)| *missing) {
                return Err(EnvelopeError::MissingField { kind: kind(), field });
            }
        }

        if self.kind.requires_content() && self.content.is_none() {
            return Err(EnvelopeError::MissingField {
                kind: kind(),
                field: "content",
            });
        }

        if self.kind.forbids_content() && self.content.is_some() {
            return Err(EnvelopeError::UnexpectedContent { kind: kind() });
        }

        Ok(())
    }
}
