use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sync_telemetry::metrics;
use sync_types::{Envelope, NodeId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::domain::{BusError, LivenessTracker};
use crate::ports::{
    BrokerClient, SubscriptionAdmin, TimeSource, TopicAddress, TopicReceiver, TopicSender,
};
use crate::service::dispatch::{new_inbound, InboundDispatcher};
use crate::service::maintenance::MaintenanceTimer;
use crate::service::stream::EnvelopeStream;
use crate::service::subscriptions::SubscriptionManager;

/// Slot holding the inbound channel while registered.
///
/// Shared with the dispatcher so that emptying the slot closes the stream for
/// everyone.
pub(crate) type InboundSlot = Arc<RwLock<Option<broadcast::Sender<Envelope>>>>;

/// Lifecycle of a bus instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::Unregistering => "unregistering",
        };
        f.write_str(name)
    }
}

/// Identity and subscription handle of the current registration.
pub(crate) struct Registration {
    pub(crate) node_id: NodeId,
    pub(crate) subscriptions: SubscriptionManager,
}

/// Node synchronization bus.
///
/// Owns the send path, the subscription processor, the maintenance timer and
/// the inbound envelope stream of one node.
///
/// # Example
///
/// ```rust,ignore
/// use sync_bus::adapters::{InMemoryBroker, SystemTimeSource};
/// use sync_bus::{BusConfig, NodeSyncBus};
///
/// let bus = NodeSyncBus::new(
///     BusConfig::with_connection_string("memory://local"),
///     Arc::new(InMemoryBroker::new()),
///     Arc::new(SystemTimeSource::new()),
/// );
/// bus.register(NodeId::new("node-a")?).await?;
/// let mut inbound = bus.subscribe();
/// ```
pub struct NodeSyncBus {
    pub(crate) inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) broker: Arc<dyn BrokerClient>,
    pub(crate) admin: Arc<dyn SubscriptionAdmin>,
    pub(crate) time_source: Arc<dyn TimeSource>,
    pub(crate) state: Mutex<BusState>,
    pub(crate) registration: RwLock<Option<Arc<Registration>>>,
    pub(crate) sender: RwLock<Option<Arc<dyn TopicSender>>>,
    pub(crate) receiver: RwLock<Option<Arc<dyn TopicReceiver>>>,
    pub(crate) inbound: InboundSlot,
    pub(crate) timer: Mutex<Option<MaintenanceTimer>>,
    pub(crate) liveness: Arc<LivenessTracker>,
}

impl BusInner {
    pub(crate) fn state(&self) -> BusState {
        *self.state.lock()
    }

    fn set_state(&self, state: BusState) {
        *self.state.lock() = state;
    }

    /// Registration and sender of a fully registered bus.
    pub(crate) fn active(&self) -> Result<(Arc<Registration>, Arc<dyn TopicSender>), BusError> {
        if self.state() != BusState::Registered {
            return Err(BusError::NotInitialized);
        }
        let registration = self
            .registration
            .read()
            .clone()
            .ok_or(BusError::NotInitialized)?;
        let sender = self.sender.read().clone().ok_or(BusError::NotInitialized)?;
        Ok((registration, sender))
    }
}

impl NodeSyncBus {
    /// Create an unregistered bus.
    pub fn new<B>(config: BusConfig, broker: Arc<B>, time_source: Arc<dyn TimeSource>) -> Self
    where
        B: BrokerClient + 'static,
    {
        let admin: Arc<dyn SubscriptionAdmin> = broker.clone();
        Self {
            inner: Arc::new(BusInner {
                config,
                broker,
                admin,
                time_source,
                state: Mutex::new(BusState::Unregistered),
                registration: RwLock::new(None),
                sender: RwLock::new(None),
                receiver: RwLock::new(None),
                inbound: Arc::new(RwLock::new(None)),
                timer: Mutex::new(None),
                liveness: Arc::new(LivenessTracker::new()),
            }),
        }
    }

    pub fn state(&self) -> BusState {
        self.inner.state()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == BusState::Registered
    }

    /// Node id of the current registration.
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.inner
            .registration
            .read()
            .as_ref()
            .map(|r| r.node_id.clone())
    }

    /// Effective topic name.
    pub fn topic_name(&self) -> &str {
        self.inner.config.topic_name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Peer liveness table.
    pub fn liveness(&self) -> &LivenessTracker {
        &self.inner.liveness
    }

    /// Join the bus as `node_id`.
    ///
    /// Steps, in order: ensure the node subscription, attach the inbound
    /// processor, open the sender, announce with a heartbeat, start the
    /// maintenance timer. If any of the first three fail, everything acquired
    /// so far is released and the bus returns to `Unregistered`.
    pub async fn register(&self, node_id: NodeId) -> Result<(), BusError> {
        if self.inner.config.connection_string.trim().is_empty() {
            return Err(BusError::MissingConnectionString);
        }
        self.begin_registering(&node_id)?;

        let topic = TopicAddress::new(
            self.inner.config.connection_string.clone(),
            self.inner.config.topic_name(),
        );
        let subscriptions =
            SubscriptionManager::new(Arc::clone(&self.inner.admin), topic, &self.inner.config);

        if let Err(e) = subscriptions.ensure_own_subscription(&node_id).await {
            warn!(node_id = %node_id, error = %e, "Registration failed creating subscription");
            self.inner.set_state(BusState::Unregistered);
            return Err(BusError::Registration(e));
        }

        *self.inner.inbound.write() = Some(new_inbound(self.inner.config.inbound_capacity));
        let dispatcher = Arc::new(InboundDispatcher::new(
            node_id.clone(),
            Arc::clone(&self.inner.liveness),
            Arc::clone(&self.inner.inbound),
        ));

        let receiver = match self
            .inner
            .broker
            .open_receiver(subscriptions.topic(), node_id.as_str(), dispatcher)
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Registration failed opening receiver");
                self.rollback(&subscriptions, &node_id, None).await;
                return Err(BusError::Registration(e));
            }
        };

        let sender = match self.inner.broker.open_sender(subscriptions.topic()).await {
            Ok(sender) => sender,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Registration failed opening sender");
                self.rollback(&subscriptions, &node_id, Some(receiver)).await;
                return Err(BusError::Registration(e));
            }
        };

        let registration = Arc::new(Registration {
            node_id: node_id.clone(),
            subscriptions,
        });
        *self.inner.receiver.write() = Some(receiver);
        *self.inner.sender.write() = Some(Arc::clone(&sender));
        *self.inner.registration.write() = Some(Arc::clone(&registration));

        if let Err(e) = self.inner.send_heartbeat(&registration, sender.as_ref()).await {
            warn!(node_id = %node_id, error = %e, "Initial heartbeat failed");
        }

        self.inner.set_state(BusState::Registered);
        let timer = MaintenanceTimer::spawn(
            Arc::downgrade(&self.inner),
            self.inner.config.maintenance_interval,
        );
        *self.inner.timer.lock() = Some(timer);

        info!(
            node_id = %node_id,
            topic = %self.inner.config.topic_name(),
            "Registered on node sync bus"
        );
        Ok(())
    }

    /// Parse `node_id` and register.
    pub async fn register_as(&self, node_id: &str) -> Result<(), BusError> {
        let node_id = NodeId::new(node_id)?;
        self.register(node_id).await
    }

    fn begin_registering(&self, node_id: &NodeId) -> Result<(), BusError> {
        let mut state = self.inner.state.lock();
        if *state != BusState::Unregistered {
            let current = self
                .inner
                .registration
                .read()
                .as_ref()
                .map(|r| r.node_id.to_string())
                .unwrap_or_else(|| node_id.to_string());
            return Err(BusError::AlreadyRegistered(current));
        }
        *state = BusState::Registering;
        Ok(())
    }

    /// Undo a partial registration.
    async fn rollback(
        &self,
        subscriptions: &SubscriptionManager,
        node_id: &NodeId,
        receiver: Option<Arc<dyn TopicReceiver>>,
    ) {
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.close().await {
                warn!(node_id = %node_id, error = %e, "Rollback: failed to close receiver");
            }
        }
        self.inner.inbound.write().take();
        if let Err(e) = subscriptions.delete_own_subscription(node_id).await {
            warn!(node_id = %node_id, error = %e, "Rollback: failed to delete subscription");
        }
        self.inner.set_state(BusState::Unregistered);
    }

    /// Leave the bus.
    ///
    /// Every teardown step runs even if an earlier one failed. A no-op unless
    /// registered.
    pub async fn unregister(&self) {
        {
            let mut state = self.inner.state.lock();
            let current = *state;
            if current != BusState::Registered {
                debug!(state = %current, "Unregister ignored");
                return;
            }
            *state = BusState::Unregistering;
        }

        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop().await;
        }

        let receiver = self.inner.receiver.write().take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.close().await {
                warn!(error = %e, "Failed to close receiver");
            }
        }

        // Dropping the only sender ends every EnvelopeStream.
        self.inner.inbound.write().take();

        let sender = self.inner.sender.write().take();
        if let Some(sender) = sender {
            if let Err(e) = sender.close().await {
                warn!(error = %e, "Failed to close sender");
            }
        }

        let registration = self.inner.registration.write().take();
        if let Some(registration) = &registration {
            if let Err(e) = registration
                .subscriptions
                .delete_own_subscription(&registration.node_id)
                .await
            {
                warn!(node_id = %registration.node_id, error = %e, "Failed to delete own subscription");
            }
        }

        self.inner.liveness.clear();
        metrics::PEERS_TRACKED.set(0);
        self.inner.set_state(BusState::Unregistered);

        info!(
            node_id = ?registration.as_ref().map(|r| r.node_id.to_string()),
            "Unregistered from node sync bus"
        );
    }

    /// Stream of envelopes from peers. Ends on unregister; a stream taken
    /// while unregistered is already finished.
    pub fn subscribe(&self) -> EnvelopeStream {
        match self.inner.inbound.read().as_ref() {
            Some(sender) => EnvelopeStream::new(sender.subscribe()),
            None => EnvelopeStream::closed(),
        }
    }
}

impl Drop for NodeSyncBus {
    fn drop(&mut self) {
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.signal_stop();
        }
    }
}
