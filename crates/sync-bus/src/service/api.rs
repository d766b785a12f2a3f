use async_trait::async_trait;
use sync_telemetry::metrics;
use sync_types::{Envelope, NodeId};
use tracing::{debug, error};

use crate::domain::{encode, BusError};
use crate::ports::SyncBusApi;
use crate::service::{EnvelopeStream, NodeSyncBus};

impl NodeSyncBus {
    /// Publish an envelope to peers.
    ///
    /// The sender is always stamped with the local node id. A broker failure
    /// is logged and counted but not returned: delivery is best effort and
    /// callers recover through the session-list exchange.
    pub async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        let (registration, sender) = self.inner.active()?;
        envelope.validate()?;

        let envelope = envelope.from_node(registration.node_id.clone());
        let message_type = envelope.message_type;
        let message = encode(&envelope)?;

        match sender.send(message).await {
            Ok(()) => {
                metrics::MESSAGES_SENT
                    .with_label_values(&[message_type.tag()])
                    .inc();
                debug!(
                    node_id = %registration.node_id,
                    message_type = %message_type,
                    recipient = ?envelope.recipient.as_ref().map(NodeId::as_str),
                    "Envelope sent"
                );
            }
            Err(e) => {
                metrics::SEND_FAILURES.inc();
                error!(
                    node_id = %registration.node_id,
                    message_type = %message_type,
                    error = %e,
                    "Failed to send envelope, dropped"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncBusApi for NodeSyncBus {
    async fn register(&self, node_id: NodeId) -> Result<(), BusError> {
        NodeSyncBus::register(self, node_id).await
    }

    async fn unregister(&self) {
        NodeSyncBus::unregister(self).await
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        NodeSyncBus::send(self, envelope).await
    }

    fn subscribe(&self) -> EnvelopeStream {
        NodeSyncBus::subscribe(self)
    }
}
