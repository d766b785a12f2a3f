//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the bus requires from its host: a topic/subscription broker and
//! a clock.
//!
//! The broker is modelled after managed topic services: one topic shared by
//! every node, one filtered subscription per node, and a processor callback
//! that completes or abandons each delivered message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, Disposition, ReceivedMessage, SubscriptionFilter, WireMessage};

/// Location of a topic: the broker namespace plus the topic name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    pub connection_string: String,
    pub topic: String,
}

impl TopicAddress {
    pub fn new(connection_string: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic: topic.into(),
        }
    }
}

// Connection strings usually embed credentials; keep them out of logs.
impl fmt::Debug for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicAddress")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Everything needed to create a node subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Subscription name (the node id).
    pub name: String,
    /// Routing rule installed as the subscription's only rule.
    pub filter: SubscriptionFilter,
    /// Broker deletes the subscription after this much inactivity.
    pub auto_delete_on_idle: Duration,
    /// Messages older than this are discarded undelivered.
    pub default_message_ttl: Duration,
}

/// Subscription management on a topic.
#[async_trait]
pub trait SubscriptionAdmin: Send + Sync {
    /// Whether a subscription with `name` exists.
    async fn subscription_exists(&self, topic: &TopicAddress, name: &str)
        -> Result<bool, BrokerError>;

    /// Create a subscription.
    ///
    /// # Errors
    ///
    /// `BrokerError::SubscriptionExists` if the name is taken.
    async fn create_subscription(
        &self,
        topic: &TopicAddress,
        spec: &SubscriptionSpec,
    ) -> Result<(), BrokerError>;

    /// Delete a subscription.
    ///
    /// # Errors
    ///
    /// `BrokerError::SubscriptionNotFound` if it does not exist.
    async fn delete_subscription(&self, topic: &TopicAddress, name: &str)
        -> Result<(), BrokerError>;

    /// Names of all subscriptions on the topic.
    async fn list_subscriptions(&self, topic: &TopicAddress) -> Result<Vec<String>, BrokerError>;
}

/// Full broker client: administration plus send/receive handles.
#[async_trait]
pub trait BrokerClient: SubscriptionAdmin {
    /// Open a sender publishing to the topic.
    async fn open_sender(&self, topic: &TopicAddress) -> Result<Arc<dyn TopicSender>, BrokerError>;

    /// Attach `handler` as the processor of `subscription`.
    ///
    /// The broker may invoke the handler concurrently for distinct messages.
    async fn open_receiver(
        &self,
        topic: &TopicAddress,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<dyn TopicReceiver>, BrokerError>;
}

/// Publishing side of a topic.
#[async_trait]
pub trait TopicSender: Send + Sync {
    async fn send(&self, message: WireMessage) -> Result<(), BrokerError>;

    /// Release the sender. Later `send` calls fail with `BrokerError::Closed`.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Handle to a running subscription processor.
#[async_trait]
pub trait TopicReceiver: Send + Sync {
    /// Stop delivering messages to the handler.
    ///
    /// Messages not yet handed to the handler remain in the subscription.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Callback invoked for every message delivered to a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> Disposition;
}

/// Abstract clock, injectable for deterministic tests.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
