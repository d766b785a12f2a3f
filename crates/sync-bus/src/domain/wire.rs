//! Broker-level message shape.
//!
//! A wire message is what the broker stores and routes: a bag of typed
//! application properties (which the subscription filter can read) plus an
//! opaque body.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Property carrying the sender node id.
pub const PROP_NODE_ID: &str = "NodeId";
/// Property carrying the recipient node id (absent for broadcasts).
pub const PROP_RECIPIENT_ID: &str = "RecipientId";
/// Property carrying the message type tag.
pub const PROP_MESSAGE_TYPE: &str = "MessageType";
/// Flag property set on heartbeat messages only.
pub const PROP_HEARTBEAT: &str = "Heartbeat";
/// Heartbeat send time.
pub const PROP_TIMESTAMP: &str = "Timestamp";

/// Typed application property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Timestamp(DateTime<Utc>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

/// Message as stored and routed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Broker-level message id.
    pub message_id: Uuid,
    /// Application properties visible to subscription filters.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Opaque body.
    pub body: Bytes,
}

impl WireMessage {
    /// Create an empty message with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            properties: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set a property, builder style.
    #[must_use]
    pub fn with_property(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// Set the body, builder style.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// String property, or `None` if absent or of another type.
    pub fn str_property(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(PropertyValue::as_str)
    }
}

impl Default for WireMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// A wire message as handed to a subscription processor.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: WireMessage,
    /// Subscription the message was delivered through.
    pub subscription: String,
    /// 1 on first delivery, incremented on every abandon.
    pub delivery_count: u32,
    /// When the broker accepted the message.
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome a processor reports back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the subscription.
    Complete,
    /// Return the message for redelivery.
    Abandon,
}
