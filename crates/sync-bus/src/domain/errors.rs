//! # Domain Errors
//!
//! Error types for the synchronization bus, split by layer: codec, broker
//! port, and the bus facade that callers see.

use sync_types::{MessageType, TypesError};
use thiserror::Error;

/// Errors while converting envelopes to and from wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The type tag does not name any known message type.
    #[error("Unknown message type tag: {0}")]
    UnknownMessageType(String),

    /// A required property is absent.
    #[error("Missing wire property: {0}")]
    MissingProperty(&'static str),

    /// A property is present with the wrong type or an invalid value.
    #[error("Invalid wire property {name}: {reason}")]
    InvalidProperty {
        /// Property name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// A message type without payload arrived with a body.
    #[error("Message type {0} carries no payload but body has {1} bytes")]
    UnexpectedBody(MessageType, usize),

    /// The name-list body is not a JSON array of strings.
    #[error("Malformed body: {0}")]
    Body(#[from] serde_json::Error),

    /// The envelope itself is invalid.
    #[error(transparent)]
    Types(#[from] TypesError),
}

/// Errors reported by a broker adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The topic does not exist.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The subscription does not exist.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// A subscription with that name already exists.
    #[error("Subscription already exists: {0}")]
    SubscriptionExists(String),

    /// The client handle was closed.
    #[error("Broker client closed")]
    Closed,

    /// Any other transport failure.
    #[error("Broker transport error: {0}")]
    Transport(String),
}

/// Errors surfaced to callers of the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Caller supplied an invalid node id or envelope.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] TypesError),

    /// No connection string configured.
    #[error("Broker connection string is not configured")]
    MissingConnectionString,

    /// The bus is not registered.
    #[error("Bus not initialized")]
    NotInitialized,

    /// `register` called while already registered.
    #[error("Bus already registered as {0}")]
    AlreadyRegistered(String),

    /// Subscription or client setup failed during `register`.
    #[error("Registration failed: {0}")]
    Registration(#[source] BrokerError),

    /// Envelope could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl BusError {
    /// True for the fail-fast "not registered" error.
    #[must_use]
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}
