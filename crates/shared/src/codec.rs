//! JSON mapping between [`Envelope`] and its flat wire object:
//! `{ type, roomId, messageId, senderId, content?, replyToMessageId?, timestamp? }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, RoomId, UserId},
    error::{DecodeError, EncodeError},
    protocol::{Envelope, EnvelopeType},
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    envelope.validate()?;
    let wire = WireEnvelope {
        kind: envelope.kind.as_str().to_string(),
        room_id: Some(envelope.room_id.0.clone()),
        message_id: Some(envelope.message_id.0.clone()),
        sender_id: Some(envelope.sender_id.0.clone()),
        content: envelope.content.clone(),
        reply_to_message_id: envelope.reply_to_message_id.as_ref().map(|id| id.0.clone()),
        timestamp: envelope.timestamp,
    };
    Ok(serde_json::to_vec(&wire)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)?;
    let envelope = Envelope {
        kind: EnvelopeType::from_wire(&wire.kind),
        room_id: RoomId(wire.room_id.unwrap_or_default()),
        message_id: MessageId(wire.message_id.unwrap_or_default()),
        sender_id: UserId(wire.sender_id.unwrap_or_default()),
        content: wire.content,
        reply_to_message_id: wire.reply_to_message_id.map(MessageId),
        timestamp: wire.timestamp,
    };
    envelope.validate()?;
    Ok(envelope)
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
