//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Driving Ports (Inbound):** the bus API consumed by the session domain
//! - **Driven Ports (Outbound):** the broker and clock the bus requires

pub mod inbound;
pub mod outbound;

pub use inbound::SyncBusApi;
pub use outbound::{
    BrokerClient, MessageHandler, SubscriptionAdmin, SubscriptionSpec, TimeSource, TopicAddress,
    TopicReceiver, TopicSender,
};
