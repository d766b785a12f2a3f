//! # Node Sync Bus Service
//!
//! Composition root tying the codec, liveness table and subscription manager
//! to a broker. Implements the `SyncBusApi` driving port.
//!
//! ## Lifecycle
//!
//! `Unregistered → Registering → Registered → Unregistering → Unregistered`.
//! Only a registered bus sends; everything else fails fast with
//! `BusError::NotInitialized`.

mod api;
mod core;
mod dispatch;
mod maintenance;
mod stream;
mod subscriptions;

pub use self::core::{BusState, NodeSyncBus};
pub use dispatch::InboundDispatcher;
pub use maintenance::SweepReport;
pub use stream::EnvelopeStream;
pub use subscriptions::SubscriptionManager;

#[cfg(test)]
mod tests;
