//! # Driving Ports (Inbound API)
//!
//! The API the session domain layer uses to talk to the bus.

use async_trait::async_trait;
use sync_types::{Envelope, NodeId};

use crate::domain::BusError;
use crate::service::EnvelopeStream;

/// Primary API of the node synchronization bus.
///
/// # Delivery Guarantees
///
/// None beyond best effort. `send` reports success once the envelope was
/// handed to the broker or the failure was logged; consumers of
/// [`SyncBusApi::subscribe`] must tolerate reordering and duplicates.
///
/// # Example
///
/// ```rust,ignore
/// use sync_bus::ports::SyncBusApi;
///
/// async fn announce<B: SyncBusApi>(bus: &B, snapshot: Vec<u8>) -> Result<(), BusError> {
///     bus.send(Envelope::new(MessageType::SessionCreated, snapshot)).await
/// }
/// ```
#[async_trait]
pub trait SyncBusApi: Send + Sync {
    /// Join the bus as `node_id`.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidArgument` for an empty node id
    /// - `BusError::MissingConnectionString` if no broker is configured
    /// - `BusError::AlreadyRegistered` if called twice
    /// - `BusError::Registration` if the subscription or a client cannot be set up
    async fn register(&self, node_id: NodeId) -> Result<(), BusError>;

    /// Leave the bus. Always succeeds; individual teardown failures are logged.
    async fn unregister(&self);

    /// Broadcast or direct an envelope to peers.
    ///
    /// # Errors
    ///
    /// - `BusError::NotInitialized` when not registered
    /// - `BusError::InvalidArgument` when the payload does not fit the message type
    async fn send(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Stream of envelopes received from peers.
    fn subscribe(&self) -> EnvelopeStream;
}
