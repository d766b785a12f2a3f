//! Prometheus metrics for the node synchronization bus.
//!
//! All metrics follow the naming convention: `sync_bus_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., messages_sent_total)
//! - **Gauge**: Value that can go up or down (e.g., peers_tracked)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // SEND PATH
    // =========================================================================

    /// Envelopes handed to the broker, by message type
    pub static ref MESSAGES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_bus_messages_sent_total", "Envelopes published to the topic"),
        &["message_type"]
    ).expect("metric creation failed");

    /// Envelopes lost because the broker rejected the send
    pub static ref SEND_FAILURES: IntCounter = IntCounter::new(
        "sync_bus_send_failures_total",
        "Envelopes dropped after a failed broker send"
    ).expect("metric creation failed");

    /// Heartbeats published
    pub static ref HEARTBEATS_SENT: IntCounter = IntCounter::new(
        "sync_bus_heartbeats_sent_total",
        "Heartbeats published to the topic"
    ).expect("metric creation failed");

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    /// Envelopes forwarded to the inbound stream, by message type
    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_bus_messages_received_total", "Envelopes delivered to the inbound stream"),
        &["message_type"]
    ).expect("metric creation failed");

    /// Messages returned to the broker for redelivery
    pub static ref MESSAGES_ABANDONED: IntCounter = IntCounter::new(
        "sync_bus_messages_abandoned_total",
        "Inbound messages abandoned for redelivery"
    ).expect("metric creation failed");

    /// Envelopes skipped by a subscriber that fell behind the inbound stream
    pub static ref INBOUND_LAGGED: IntCounter = IntCounter::new(
        "sync_bus_inbound_lagged_total",
        "Envelopes dropped because a stream subscriber lagged"
    ).expect("metric creation failed");

    /// Heartbeats received from peers
    pub static ref HEARTBEATS_RECEIVED: IntCounter = IntCounter::new(
        "sync_bus_heartbeats_received_total",
        "Heartbeats received from peers"
    ).expect("metric creation failed");

    // =========================================================================
    // PEERS
    // =========================================================================

    /// Peers currently in the liveness table
    pub static ref PEERS_TRACKED: IntGauge = IntGauge::new(
        "sync_bus_peers_tracked",
        "Peers currently tracked for liveness"
    ).expect("metric creation failed");

    /// Stale peers whose subscription was deleted
    pub static ref PEERS_EVICTED: IntCounter = IntCounter::new(
        "sync_bus_peers_evicted_total",
        "Stale peers evicted by the maintenance sweep"
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Send
        Box::new(MESSAGES_SENT.clone()),
        Box::new(SEND_FAILURES.clone()),
        Box::new(HEARTBEATS_SENT.clone()),
        // Receive
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(MESSAGES_ABANDONED.clone()),
        Box::new(INBOUND_LAGGED.clone()),
        Box::new(HEARTBEATS_RECEIVED.clone()),
        // Peers
        Box::new(PEERS_TRACKED.clone()),
        Box::new(PEERS_EVICTED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_counter_increment() {
        SEND_FAILURES.inc();
        assert!(SEND_FAILURES.get() >= 1);

        MESSAGES_SENT.with_label_values(&["SessionEvent"]).inc();
        assert!(MESSAGES_SENT.with_label_values(&["SessionEvent"]).get() >= 1);
    }

    #[test]
    fn test_encode_contains_send_failures() {
        register_metrics().unwrap();
        SEND_FAILURES.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("sync_bus_send_failures_total"));
    }
}
