//! # Envelope Codec
//!
//! Converts envelopes to broker wire messages and back.
//!
//! ## Wire Layout
//!
//! - `NodeId`, `RecipientId`, `MessageType` are string properties so the
//!   subscription filter can evaluate routing without touching the body.
//! - Byte payloads are copied into the body verbatim; name lists are a JSON
//!   array of strings; request types have an empty body.
//! - Heartbeats carry only `Heartbeat = true`, `NodeId` and `Timestamp`.
//!   [`is_heartbeat`] looks at the flag alone so the dispatcher can
//!   short-circuit them before full decoding.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sync_types::{Envelope, MessageType, NodeId, Payload, PayloadKind};

use super::errors::CodecError;
use super::wire::{
    PropertyValue, WireMessage, PROP_HEARTBEAT, PROP_MESSAGE_TYPE, PROP_NODE_ID,
    PROP_RECIPIENT_ID, PROP_TIMESTAMP,
};

/// Decoded heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Node announcing itself.
    pub sender: NodeId,
    /// When the sender emitted the heartbeat.
    pub sent_at: DateTime<Utc>,
}

/// Encode an envelope.
///
/// The envelope must already carry its sender.
///
/// # Errors
///
/// - `CodecError::Types` if the payload does not match the message type
/// - `CodecError::MissingProperty` if the sender is not set
pub fn encode(envelope: &Envelope) -> Result<WireMessage, CodecError> {
    envelope.validate()?;
    let sender = envelope
        .sender
        .as_ref()
        .ok_or(CodecError::MissingProperty(PROP_NODE_ID))?;

    let mut message = WireMessage::new()
        .with_property(PROP_NODE_ID, PropertyValue::Str(sender.to_string()))
        .with_property(
            PROP_MESSAGE_TYPE,
            PropertyValue::Str(envelope.message_type.tag().to_string()),
        );

    if let Some(recipient) = &envelope.recipient {
        message = message.with_property(PROP_RECIPIENT_ID, PropertyValue::Str(recipient.to_string()));
    }

    let body = match &envelope.payload {
        Payload::Empty => Bytes::new(),
        Payload::Bytes(bytes) => bytes.clone(),
        Payload::Names(names) => Bytes::from(serde_json::to_vec(names)?),
    };

    Ok(message.with_body(body))
}

/// Decode a non-heartbeat wire message into an envelope.
///
/// # Errors
///
/// Fails on heartbeats, missing or invalid routing properties, unknown type
/// tags, and bodies that do not fit the message type.
pub fn decode(message: &WireMessage) -> Result<Envelope, CodecError> {
    if is_heartbeat(message) {
        return Err(CodecError::InvalidProperty {
            name: PROP_HEARTBEAT,
            reason: "heartbeat is not an envelope".to_string(),
        });
    }

    let sender = required_node_id(message, PROP_NODE_ID)?;
    let recipient = match message.property(PROP_RECIPIENT_ID) {
        None => None,
        Some(PropertyValue::Str(raw)) if raw.trim().is_empty() => None,
        Some(value) => Some(node_id_from(value, PROP_RECIPIENT_ID)?),
    };

    let tag = required_str(message, PROP_MESSAGE_TYPE)?;
    let message_type: MessageType = tag
        .parse()
        .map_err(CodecError::UnknownMessageType)?;

    let payload = match message_type.payload_kind() {
        PayloadKind::Empty => {
            if !message.body.is_empty() {
                return Err(CodecError::UnexpectedBody(message_type, message.body.len()));
            }
            Payload::Empty
        }
        PayloadKind::Bytes => Payload::Bytes(message.body.clone()),
        PayloadKind::Names => Payload::Names(serde_json::from_slice(&message.body)?),
    };

    Ok(Envelope {
        sender: Some(sender),
        recipient,
        message_type,
        payload,
    })
}

/// Build a heartbeat wire message.
#[must_use]
pub fn encode_heartbeat(sender: &NodeId, sent_at: DateTime<Utc>) -> WireMessage {
    WireMessage::new()
        .with_property(PROP_HEARTBEAT, PropertyValue::Bool(true))
        .with_property(PROP_NODE_ID, PropertyValue::Str(sender.to_string()))
        .with_property(PROP_TIMESTAMP, PropertyValue::Timestamp(sent_at))
}

/// True if the heartbeat flag is set.
#[must_use]
pub fn is_heartbeat(message: &WireMessage) -> bool {
    message
        .property(PROP_HEARTBEAT)
        .and_then(PropertyValue::as_bool)
        .unwrap_or(false)
}

/// Decode a heartbeat's sender and timestamp.
///
/// # Errors
///
/// Fails if the flag is not set or either property is missing or invalid.
pub fn decode_heartbeat(message: &WireMessage) -> Result<Heartbeat, CodecError> {
    if !is_heartbeat(message) {
        return Err(CodecError::MissingProperty(PROP_HEARTBEAT));
    }
    let sender = required_node_id(message, PROP_NODE_ID)?;
    let sent_at = match message.property(PROP_TIMESTAMP) {
        None => return Err(CodecError::MissingProperty(PROP_TIMESTAMP)),
        Some(value) => value.as_timestamp().ok_or_else(|| CodecError::InvalidProperty {
            name: PROP_TIMESTAMP,
            reason: format!("expected timestamp, got {}", value.type_name()),
        })?,
    };
    Ok(Heartbeat { sender, sent_at })
}

fn required_str<'a>(message: &'a WireMessage, name: &'static str) -> Result<&'a str, CodecError> {
    match message.property(name) {
        None => Err(CodecError::MissingProperty(name)),
        Some(PropertyValue::Str(s)) => Ok(s),
        Some(other) => Err(CodecError::InvalidProperty {
            name,
            reason: format!("expected string, got {}", other.type_name()),
        }),
    }
}

fn required_node_id(message: &WireMessage, name: &'static str) -> Result<NodeId, CodecError> {
    match message.property(name) {
        None => Err(CodecError::MissingProperty(name)),
        Some(value) => node_id_from(value, name),
    }
}

fn node_id_from(value: &PropertyValue, name: &'static str) -> Result<NodeId, CodecError> {
    let raw = value.as_str().ok_or_else(|| CodecError::InvalidProperty {
        name,
        reason: format!("expected string, got {}", value.type_name()),
    })?;
    NodeId::new(raw).map_err(|e| CodecError::InvalidProperty {
        name,
        reason: e.to_string(),
    })
}
