//! Per-node subscription filter.
//!
//! Every node subscription carries one rule:
//!
//! ```text
//! NodeId <> '<self>' AND (RecipientId IS NULL OR RecipientId = '<self>')
//! ```
//!
//! The rule is kept structured so an in-process broker can evaluate it
//! directly, and rendered to SQL for brokers that evaluate filter expressions
//! themselves. String comparison is case-insensitive on both sides, matching
//! how node ids compare everywhere else.

use sync_types::NodeId;

use super::wire::{WireMessage, PROP_NODE_ID, PROP_RECIPIENT_ID};

/// Name of the single rule attached to each node subscription.
pub const NODE_FILTER_RULE: &str = "NodeFilter";

/// Routing rule for one node's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    node_id: NodeId,
}

impl SubscriptionFilter {
    /// Rule selecting broadcasts from other nodes and messages addressed to `node_id`.
    #[must_use]
    pub fn for_node(node_id: NodeId) -> Self {
        Self { node_id }
    }

    /// Node the rule was built for.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// SQL filter expression for the broker.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let id = escape_sql_literal(self.node_id.as_str());
        format!(
            "{PROP_NODE_ID} <> '{id}' AND ({PROP_RECIPIENT_ID} IS NULL OR {PROP_RECIPIENT_ID} = '{id}')"
        )
    }

    /// Evaluate the rule against a message.
    ///
    /// A missing `NodeId` compares as NULL, and `NULL <> x` is not true, so
    /// unsigned messages are rejected.
    #[must_use]
    pub fn matches(&self, message: &WireMessage) -> bool {
        let from_other = match message.str_property(PROP_NODE_ID) {
            Some(sender) => !self.node_id.matches(sender),
            None => false,
        };
        let for_us = match message.property(PROP_RECIPIENT_ID) {
            None => true,
            Some(value) => value
                .as_str()
                .map(|recipient| self.node_id.matches(recipient))
                .unwrap_or(false),
        };
        from_other && for_us
    }
}

fn escape_sql_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}
