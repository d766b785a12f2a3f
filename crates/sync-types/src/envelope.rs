//! # Node Envelope
//!
//! The wrapper every domain event travels in between nodes.
//!
//! ## Routing Properties
//!
//! - **Sender**: stamped by the bus on send. The transport filter uses it to
//!   keep a node from receiving its own broadcasts.
//! - **Recipient**: absent for broadcasts, present for point-to-point replies.
//! - **Message Type**: selects the payload shape (see [`MessageType::payload_kind`]).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::TypesError;
use crate::node_id::NodeId;

/// Kinds of messages exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A state change of one session (opaque bytes).
    SessionEvent,
    /// A session was created on the sender (opaque bytes).
    SessionCreated,
    /// Ask peers for the names of the sessions they hold.
    RequestSessionList,
    /// Reply to `RequestSessionList`.
    SessionList,
    /// Ask a peer for full snapshots of the named sessions.
    RequestSnapshots,
    /// Full-state snapshot of one session (opaque bytes).
    Snapshot,
}

/// Payload shape carried by a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// No payload.
    Empty,
    /// Opaque bytes.
    Bytes,
    /// List of names.
    Names,
}

impl MessageType {
    /// All message types, in wire-code order.
    pub const ALL: [MessageType; 6] = [
        Self::SessionEvent,
        Self::SessionCreated,
        Self::RequestSessionList,
        Self::SessionList,
        Self::RequestSnapshots,
        Self::Snapshot,
    ];

    /// Stable tag written to the wire.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SessionEvent => "SessionEvent",
            Self::SessionCreated => "SessionCreated",
            Self::RequestSessionList => "RequestSessionList",
            Self::SessionList => "SessionList",
            Self::RequestSnapshots => "RequestSnapshots",
            Self::Snapshot => "Snapshot",
        }
    }

    /// Numeric code, used for compact logging.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::SessionEvent => 0,
            Self::SessionCreated => 1,
            Self::RequestSessionList => 2,
            Self::SessionList => 3,
            Self::RequestSnapshots => 4,
            Self::Snapshot => 5,
        }
    }

    /// The payload shape this message type carries.
    #[must_use]
    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            Self::SessionEvent | Self::SessionCreated | Self::Snapshot => PayloadKind::Bytes,
            Self::SessionList | Self::RequestSnapshots => PayloadKind::Names,
            Self::RequestSessionList => PayloadKind::Empty,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.tag() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Bytes => write!(f, "bytes"),
            Self::Names => write!(f, "name list"),
        }
    }
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    /// Signaling message without content.
    #[default]
    Empty,
    /// Serialized session event or snapshot.
    Bytes(Bytes),
    /// Session names.
    Names(Vec<String>),
}

impl Payload {
    /// Shape of this payload.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Empty => PayloadKind::Empty,
            Self::Bytes(_) => PayloadKind::Bytes,
            Self::Names(_) => PayloadKind::Names,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Vec<String>> for Payload {
    fn from(value: Vec<String>) -> Self {
        Self::Names(value)
    }
}

/// Message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Originating node. `None` until the bus stamps it on send.
    pub sender: Option<NodeId>,
    /// Target node. `None` broadcasts to every node except the sender.
    pub recipient: Option<NodeId>,
    /// Discriminates the payload shape.
    pub message_type: MessageType,
    /// Type-specific content.
    pub payload: Payload,
}

impl Envelope {
    /// Create a broadcast envelope.
    #[must_use]
    pub fn new(message_type: MessageType, payload: impl Into<Payload>) -> Self {
        Self {
            sender: None,
            recipient: None,
            message_type,
            payload: payload.into(),
        }
    }

    /// Create a broadcast envelope with no payload.
    #[must_use]
    pub fn signal(message_type: MessageType) -> Self {
        Self::new(message_type, Payload::Empty)
    }

    /// Address the envelope to a single node.
    #[must_use]
    pub fn to(mut self, recipient: NodeId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Address the envelope from a raw recipient string.
    ///
    /// An empty string leaves the envelope as a broadcast.
    #[must_use]
    pub fn to_raw(mut self, recipient: &str) -> Self {
        self.recipient = NodeId::new(recipient).ok();
        self
    }

    /// Set the sender. Only the bus should call this.
    #[must_use]
    pub fn from_node(mut self, sender: NodeId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// True when the envelope is not addressed to a single node.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Check that the payload shape matches the message type.
    ///
    /// # Errors
    ///
    /// Returns `TypesError::PayloadMismatch` when they disagree.
    pub fn validate(&self) -> Result<(), TypesError> {
        let expected = self.message_type.payload_kind();
        let actual = self.payload.kind();
        if expected != actual {
            return Err(TypesError::PayloadMismatch {
                message_type: self.message_type,
                expected,
                actual,
            });
        }
        Ok(())
    }
}
