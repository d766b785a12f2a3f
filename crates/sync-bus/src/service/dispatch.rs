//! # Inbound Dispatcher
//!
//! Processor callback attached to this node's subscription. Heartbeats update
//! the liveness table; everything else is decoded and published on the
//! inbound stream. Anything that cannot be handled is abandoned so the broker
//! redelivers it.

use std::sync::Arc;

use async_trait::async_trait;
use sync_telemetry::metrics;
use sync_types::{Envelope, NodeId};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::domain::{
    decode, decode_heartbeat, is_heartbeat, CodecError, Disposition, LivenessTracker,
    ReceivedMessage, WireMessage,
};
use crate::ports::MessageHandler;
use crate::service::core::InboundSlot;

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Inbound stream closed")]
    StreamClosed,
}

/// Handles messages delivered to the local subscription.
pub struct InboundDispatcher {
    local: NodeId,
    liveness: Arc<LivenessTracker>,
    inbound: InboundSlot,
}

impl InboundDispatcher {
    pub(crate) fn new(local: NodeId, liveness: Arc<LivenessTracker>, inbound: InboundSlot) -> Self {
        Self {
            local,
            liveness,
            inbound,
        }
    }

    fn dispatch(&self, message: &WireMessage) -> Result<(), DispatchError> {
        if is_heartbeat(message) {
            let heartbeat = decode_heartbeat(message)?;
            if heartbeat.sender == self.local {
                return Ok(());
            }
            self.liveness.touch(&heartbeat.sender, heartbeat.sent_at);
            metrics::HEARTBEATS_RECEIVED.inc();
            trace!(peer = %heartbeat.sender, sent_at = %heartbeat.sent_at, "Heartbeat received");
            return Ok(());
        }

        let envelope = decode(message)?;
        if envelope.sender.as_ref() == Some(&self.local) {
            debug!(message_id = %message.message_id, "Ignoring own envelope");
            return Ok(());
        }
        self.publish(envelope)
    }

    fn publish(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let message_type = envelope.message_type;

        // Send while holding the read guard: once `unregister` has taken the
        // sender, no envelope can reach the stream.
        let receivers = {
            let slot = self.inbound.read();
            let sender = slot.as_ref().ok_or(DispatchError::StreamClosed)?;
            // Zero subscribers is not a failure; the envelope is simply unobserved.
            sender.send(envelope).unwrap_or(0)
        };
        metrics::MESSAGES_RECEIVED
            .with_label_values(&[message_type.tag()])
            .inc();
        debug!(message_type = %message_type, receivers, "Envelope received");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for InboundDispatcher {
    async fn handle(&self, received: ReceivedMessage) -> Disposition {
        match self.dispatch(&received.message) {
            Ok(()) => Disposition::Complete,
            Err(e) => {
                warn!(
                    node_id = %self.local,
                    message_id = %received.message.message_id,
                    delivery_count = received.delivery_count,
                    error = %e,
                    "Failed to process inbound message, abandoning"
                );
                metrics::MESSAGES_ABANDONED.inc();
                Disposition::Abandon
            }
        }
    }
}

/// Inbound channel sender shared between the bus and the dispatcher.
pub(crate) fn new_inbound(capacity: usize) -> broadcast::Sender<Envelope> {
    let (sender, _) = broadcast::channel(capacity.max(1));
    sender
}
