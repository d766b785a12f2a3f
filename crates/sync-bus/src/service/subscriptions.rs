//! # Subscription Lifecycle Manager
//!
//! One broker subscription per node, named after the node id and carrying the
//! node's routing filter. Creation and deletion are idempotent so that
//! concurrent nodes racing on the same subscription never surface conflicts.

use std::sync::Arc;
use std::time::Duration;

use sync_types::NodeId;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::domain::{BrokerError, SubscriptionFilter, NODE_FILTER_RULE};
use crate::ports::{SubscriptionAdmin, SubscriptionSpec, TopicAddress};

/// Creates and deletes node subscriptions on one topic.
pub struct SubscriptionManager {
    admin: Arc<dyn SubscriptionAdmin>,
    topic: TopicAddress,
    auto_delete_on_idle: Duration,
    default_message_ttl: Duration,
}

impl SubscriptionManager {
    pub fn new(admin: Arc<dyn SubscriptionAdmin>, topic: TopicAddress, config: &BusConfig) -> Self {
        Self {
            admin,
            topic,
            auto_delete_on_idle: config.subscription_idle_ttl,
            default_message_ttl: config.message_ttl,
        }
    }

    pub fn topic(&self) -> &TopicAddress {
        &self.topic
    }

    /// Make sure `node_id` has its filtered subscription.
    ///
    /// A subscription created concurrently by someone else counts as success.
    pub async fn ensure_own_subscription(&self, node_id: &NodeId) -> Result<(), BrokerError> {
        if self
            .admin
            .subscription_exists(&self.topic, node_id.as_str())
            .await?
        {
            debug!(node_id = %node_id, "Subscription already exists");
            return Ok(());
        }

        let filter = SubscriptionFilter::for_node(node_id.clone());
        let spec = SubscriptionSpec {
            name: node_id.to_string(),
            filter,
            auto_delete_on_idle: self.auto_delete_on_idle,
            default_message_ttl: self.default_message_ttl,
        };

        match self.admin.create_subscription(&self.topic, &spec).await {
            Ok(()) => {
                info!(
                    node_id = %node_id,
                    topic = %self.topic.topic,
                    rule = NODE_FILTER_RULE,
                    filter = %spec.filter.to_sql(),
                    "Created node subscription"
                );
                Ok(())
            }
            Err(BrokerError::SubscriptionExists(_)) => {
                debug!(node_id = %node_id, "Subscription created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete this node's subscription. A missing subscription counts as success.
    pub async fn delete_own_subscription(&self, node_id: &NodeId) -> Result<(), BrokerError> {
        match self
            .admin
            .delete_subscription(&self.topic, node_id.as_str())
            .await
        {
            Ok(()) => {
                info!(node_id = %node_id, "Deleted node subscription");
                Ok(())
            }
            Err(BrokerError::SubscriptionNotFound(_)) => {
                debug!(node_id = %node_id, "Subscription already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a peer's subscription.
    ///
    /// Returns `false` if the deletion failed; the next sweep retries.
    pub async fn delete_peer_subscription(&self, peer: &NodeId) -> bool {
        match self
            .admin
            .delete_subscription(&self.topic, peer.as_str())
            .await
        {
            Ok(()) | Err(BrokerError::SubscriptionNotFound(_)) => true,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to delete peer subscription");
                false
            }
        }
    }

    /// All node ids that currently own a subscription on the topic.
    ///
    /// Subscriptions whose names are not valid node ids are skipped.
    pub async fn list_subscriptions(&self) -> Result<Vec<NodeId>, BrokerError> {
        let names = self.admin.list_subscriptions(&self.topic).await?;
        Ok(names
            .into_iter()
            .filter_map(|name| match NodeId::new(&name) {
                Ok(id) => Some(id),
                Err(_) => {
                    debug!(subscription = %name, "Skipping subscription with invalid name");
                    None
                }
            })
            .collect())
    }
}
