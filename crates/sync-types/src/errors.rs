//! # Error Types
//!
//! Validation errors raised while building envelopes.

use thiserror::Error;

use crate::envelope::{MessageType, PayloadKind};

/// Errors that can occur while constructing or validating envelope values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Node identifiers must contain at least one non-whitespace character.
    #[error("Node id must not be empty")]
    EmptyNodeId,

    /// The payload shape does not match what the message type carries.
    #[error("Message type {message_type} expects a {expected} payload, got {actual}")]
    PayloadMismatch {
        message_type: MessageType,
        expected: PayloadKind,
        actual: PayloadKind,
    },
}
