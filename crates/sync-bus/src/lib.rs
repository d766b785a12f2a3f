//! # Node Synchronization Bus
//!
//! Publish/subscribe bus that lets the nodes of a replicated session service
//! exchange state-change envelopes, discover each other, and reclaim the
//! broker resources of nodes that vanished without unregistering.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** wire model, envelope codec, subscription filter, peer liveness table
//! - **Ports Layer:** `SyncBusApi` (driving) and the broker / clock traits (driven)
//! - **Service Layer:** `NodeSyncBus`, the composition root
//! - **Adapters Layer:** in-memory broker and clocks
//!
//! ## Flow
//!
//! ```text
//! send ──► codec::encode ──► topic ──► filtered node subscription
//!                                            │
//!                  InboundDispatcher ◄───────┘
//!                   │             │
//!        heartbeat: liveness   envelope: EnvelopeStream
//! ```
//!
//! A maintenance timer re-announces the node every interval and deletes the
//! subscriptions of peers that stayed silent past the inactivity timeout.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use sync_bus::adapters::{InMemoryBroker, SystemTimeSource};
//! use sync_bus::{BusConfig, NodeSyncBus};
//! use sync_types::{Envelope, MessageType, NodeId};
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let config = BusConfig::with_connection_string("memory://local");
//! let bus = NodeSyncBus::new(config, broker, Arc::new(SystemTimeSource::new()));
//!
//! bus.register(NodeId::new("node-a")?).await?;
//! let mut inbound = bus.subscribe();
//! bus.send(Envelope::signal(MessageType::RequestSessionList)).await?;
//!
//! while let Some(envelope) = inbound.next().await {
//!     // hand to the session domain
//! }
//! bus.unregister().await;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use config::{BusConfig, ConfigError, DEFAULT_TOPIC_NAME};
pub use domain::{BrokerError, BusError, CodecError, LivenessTracker};
pub use ports::SyncBusApi;
pub use service::{BusState, EnvelopeStream, NodeSyncBus, SweepReport};
