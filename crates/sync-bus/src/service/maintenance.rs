//! # Maintenance
//!
//! Periodic heartbeat and peer sweep.
//!
//! The broker's subscription list is the source of truth for which nodes
//! exist; the liveness table records how recently each proved it is alive.
//! Every tick reconciles the two.

use std::collections::HashSet;
use std::sync::Weak;
use std::time::Duration;

use sync_telemetry::metrics;
use sync_types::NodeId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::domain::{encode_heartbeat, BrokerError, BusError};
use crate::ports::TopicSender;
use crate::service::core::{BusInner, Registration};
use crate::service::NodeSyncBus;

/// Outcome of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers seen for the first time and seeded with the current time.
    pub discovered: usize,
    /// Stale peers whose subscription was deleted.
    pub evicted: usize,
    /// Peers left in place, including stale ones whose deletion failed.
    pub retained: usize,
    /// Tracked peers that no longer own a subscription.
    pub forgotten: usize,
}

impl NodeSyncBus {
    /// Run one heartbeat + sweep cycle now.
    ///
    /// The timer calls this every `maintenance_interval`. Broker failures are
    /// logged and do not fail the tick.
    ///
    /// # Errors
    ///
    /// `BusError::NotInitialized` when not registered.
    pub async fn maintenance_tick(&self) -> Result<SweepReport, BusError> {
        self.inner.tick().await
    }
}

impl BusInner {
    pub(crate) async fn send_heartbeat(
        &self,
        registration: &Registration,
        sender: &dyn TopicSender,
    ) -> Result<(), BrokerError> {
        let message = encode_heartbeat(&registration.node_id, self.time_source.now());
        sender.send(message).await?;
        metrics::HEARTBEATS_SENT.inc();
        trace!(node_id = %registration.node_id, "Heartbeat sent");
        Ok(())
    }

    pub(crate) async fn tick(&self) -> Result<SweepReport, BusError> {
        let (registration, sender) = self.active()?;

        if let Err(e) = self.send_heartbeat(&registration, sender.as_ref()).await {
            warn!(node_id = %registration.node_id, error = %e, "Heartbeat failed");
        }

        let mut report = SweepReport::default();
        let peers = match registration.subscriptions.list_subscriptions().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(node_id = %registration.node_id, error = %e, "Failed to list subscriptions");
                return Ok(report);
            }
        };

        let now = self.time_source.now();
        let timeout = self.config.inactivity_timeout;

        for peer in peers.iter().filter(|p| **p != registration.node_id) {
            if self.liveness.seed(peer, now) {
                debug!(peer = %peer, "Discovered peer");
                report.discovered += 1;
                continue;
            }
            if !self.liveness.is_stale(peer, now, timeout) {
                report.retained += 1;
                continue;
            }

            let last_seen = self.liveness.last_seen(peer);
            if registration.subscriptions.delete_peer_subscription(peer).await {
                self.liveness.forget(peer);
                metrics::PEERS_EVICTED.inc();
                info!(peer = %peer, last_seen = ?last_seen, "Evicted stale peer");
                report.evicted += 1;
            } else {
                report.retained += 1;
            }
        }

        let listed: HashSet<NodeId> = peers.into_iter().collect();
        for tracked in self.liveness.peers() {
            if !listed.contains(&tracked) {
                self.liveness.forget(&tracked);
                report.forgotten += 1;
            }
        }

        metrics::PEERS_TRACKED.set(self.liveness.len() as i64);
        debug!(
            discovered = report.discovered,
            evicted = report.evicted,
            retained = report.retained,
            forgotten = report.forgotten,
            "Maintenance sweep complete"
        );
        Ok(report)
    }
}

/// Background task driving [`BusInner::tick`].
pub(crate) struct MaintenanceTimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MaintenanceTimer {
    /// Start ticking every `period`, first tick one period from now.
    ///
    /// Holds the bus weakly so a dropped bus also ends the task.
    pub(crate) fn spawn(bus: Weak<BusInner>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (shutdown, mut signal) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = signal.changed() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = bus.upgrade() else { break };
                        match inner.tick().await {
                            Ok(report) => trace!(?report, "Maintenance tick"),
                            Err(e) => debug!(error = %e, "Maintenance tick skipped"),
                        }
                    }
                }
            }
            debug!("Maintenance timer stopped");
        });

        Self { shutdown, handle }
    }

    /// Ask the task to stop without waiting for it.
    pub(crate) fn signal_stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the task and wait for an in-flight tick to finish.
    pub(crate) async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Maintenance timer task failed");
        }
    }
}
