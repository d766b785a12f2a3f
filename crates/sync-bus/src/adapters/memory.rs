//! # In-Memory Broker
//!
//! In-process implementation of [`BrokerClient`] with the semantics of a
//! managed topic service:
//!
//! - namespaces are keyed by connection string, topics are created on demand
//! - subscription names are case-insensitive
//! - a published message is copied into every subscription whose filter
//!   matches it
//! - each subscription has one processor; every delivery runs on its own task
//! - `Abandon` requeues the message with an incremented delivery count, and a
//!   message abandoned on its last allowed delivery is dead-lettered
//! - messages older than the subscription's TTL are dropped undelivered
//! - subscriptions with no processor are auto-deleted once idle past their
//!   `auto_delete_on_idle`, either by [`InMemoryBroker::sweep_idle`] or by the
//!   background task from [`InMemoryBroker::spawn_idle_sweeper`]
//!
//! The broker also exposes failure-injection and inspection hooks for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::adapters::time::SystemTimeSource;
use crate::domain::{BrokerError, Disposition, ReceivedMessage, WireMessage};
use crate::ports::{
    BrokerClient, MessageHandler, SubscriptionAdmin, SubscriptionSpec, TimeSource, TopicAddress,
    TopicReceiver, TopicSender,
};

/// Deliveries allowed before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Process-local topic broker.
///
/// Cloning is cheap and every clone shares the same namespaces.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Broker on the wall clock with the default delivery limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(Arc::new(SystemTimeSource::new()), DEFAULT_MAX_DELIVERY_COUNT)
    }

    /// Broker with an explicit clock and delivery limit.
    ///
    /// A `max_delivery_count` of 0 is treated as 1.
    #[must_use]
    pub fn with_options(clock: Arc<dyn TimeSource>, max_delivery_count: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: DashMap::new(),
                clock,
                max_delivery_count: max_delivery_count.max(1),
                faults: FaultPlan::default(),
                creates: AtomicUsize::new(0),
            }),
        }
    }

    /// Delete every subscription with no attached processor that has been
    /// idle longer than its `auto_delete_on_idle`.
    ///
    /// Returns the names of the deleted subscriptions.
    pub fn sweep_idle(&self) -> Vec<String> {
        self.state.sweep_idle()
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `period` on a background
    /// task until the returned handle is stopped or dropped.
    ///
    /// The task holds the broker weakly and ends once every clone is gone.
    pub fn spawn_idle_sweeper(&self, period: Duration) -> IdleSweeper {
        IdleSweeper::spawn(Arc::downgrade(&self.state), period)
    }

    // =========================================================================
    // TEST HOOKS
    // =========================================================================

    /// Fail the next `n` subscription creations.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.faults.creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscription deletions.
    pub fn fail_next_deletes(&self, n: usize) {
        self.state.faults.deletes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends, across all senders.
    pub fn fail_next_sends(&self, n: usize) {
        self.state.faults.sends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sender opens.
    pub fn fail_next_sender_opens(&self, n: usize) {
        self.state.faults.sender_opens.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` receiver opens.
    pub fn fail_next_receiver_opens(&self, n: usize) {
        self.state.faults.receiver_opens.store(n, Ordering::SeqCst);
    }

    /// Successful subscription creations since the broker was built.
    pub fn create_count(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    /// Messages dead-lettered on a subscription.
    pub fn dead_letters(&self, topic: &TopicAddress, subscription: &str) -> Vec<ReceivedMessage> {
        self.state
            .subscription(topic, subscription)
            .map(|sub| sub.dead_letters.lock().clone())
            .unwrap_or_default()
    }

    /// Messages enqueued on a subscription and not yet settled.
    pub fn pending_count(&self, topic: &TopicAddress, subscription: &str) -> usize {
        self.state
            .subscription(topic, subscription)
            .map(|sub| sub.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Whether a processor is attached to a subscription.
    pub fn has_processor(&self, topic: &TopicAddress, subscription: &str) -> bool {
        self.state
            .subscription(topic, subscription)
            .map(|sub| sub.is_attached())
            .unwrap_or(false)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicKey {
    connection_string: String,
    topic: String,
}

#[derive(Default)]
struct FaultPlan {
    creates: AtomicUsize,
    deletes: AtomicUsize,
    sends: AtomicUsize,
    sender_opens: AtomicUsize,
    receiver_opens: AtomicUsize,
}

/// Consume one pending injected failure, if any.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct BrokerState {
    topics: DashMap<TopicKey, Arc<TopicState>>,
    clock: Arc<dyn TimeSource>,
    max_delivery_count: u32,
    faults: FaultPlan,
    creates: AtomicUsize,
}

impl BrokerState {
    fn sweep_idle(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut removed = Vec::new();

        for topic in self.topics.iter() {
            let mut subscriptions = topic.subscriptions.write();
            subscriptions.retain(|_, sub| {
                if sub.is_attached() || !sub.is_idle(now) {
                    return true;
                }
                sub.detach();
                removed.push(sub.name.clone());
                false
            });
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), subscriptions = ?removed, "Idle subscriptions auto-deleted");
        }
        removed
    }

    /// Resolve a topic, creating it on first use.
    fn topic(&self, address: &TopicAddress) -> Result<Arc<TopicState>, BrokerError> {
        if address.connection_string.trim().is_empty() {
            return Err(BrokerError::Transport("empty connection string".into()));
        }
        if address.topic.trim().is_empty() {
            return Err(BrokerError::TopicNotFound(address.topic.clone()));
        }
        let key = TopicKey {
            connection_string: address.connection_string.clone(),
            topic: address.topic.clone(),
        };
        Ok(self.topics.entry(key).or_default().clone())
    }

    fn subscription(
        &self,
        address: &TopicAddress,
        name: &str,
    ) -> Option<Arc<SubscriptionState>> {
        let key = TopicKey {
            connection_string: address.connection_string.clone(),
            topic: address.topic.clone(),
        };
        let topic = self.topics.get(&key)?.clone();
        topic.get(name)
    }
}

#[derive(Default)]
struct TopicState {
    /// Keyed by lowercased subscription name.
    subscriptions: RwLock<HashMap<String, Arc<SubscriptionState>>>,
}

impl TopicState {
    fn get(&self, name: &str) -> Option<Arc<SubscriptionState>> {
        self.subscriptions
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<SubscriptionState>> {
        self.subscriptions.read().values().cloned().collect()
    }
}

struct Delivery {
    message: WireMessage,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

impl Delivery {
    fn to_received(&self, subscription: &str) -> ReceivedMessage {
        ReceivedMessage {
            message: self.message.clone(),
            subscription: subscription.to_string(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
        }
    }
}

struct SubscriptionState {
    name: String,
    spec: SubscriptionSpec,
    queue_tx: mpsc::UnboundedSender<Delivery>,
    /// `None` while a processor owns the queue.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    /// Shutdown signal of the attached processor.
    processor: Mutex<Option<watch::Sender<bool>>>,
    pending: AtomicUsize,
    dead_letters: Mutex<Vec<ReceivedMessage>>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl SubscriptionState {
    fn new(spec: SubscriptionSpec, now: DateTime<Utc>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            name: spec.name.clone(),
            spec,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            processor: Mutex::new(None),
            pending: AtomicUsize::new(0),
            dead_letters: Mutex::new(Vec::new()),
            last_activity: Mutex::new(now),
        }
    }

    fn is_attached(&self) -> bool {
        self.processor.lock().is_some()
    }

    /// Signal the attached processor, if any, to stop.
    fn detach(&self) {
        let shutdown = self.processor.lock().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_activity.lock() = now;
    }

    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let last = *self.last_activity.lock();
        now.signed_duration_since(last)
            .to_std()
            .map(|idle| idle > self.spec.auto_delete_on_idle)
            .unwrap_or(false)
    }

    fn is_expired(&self, delivery: &Delivery, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(delivery.enqueued_at)
            .to_std()
            .map(|age| age > self.spec.default_message_ttl)
            .unwrap_or(false)
    }

    fn enqueue(&self, delivery: Delivery) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(delivery).is_err() {
            self.settle();
        }
    }

    /// Remove one message from the pending count.
    fn settle(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn abandon(&self, mut delivery: Delivery, max_delivery_count: u32) {
        if delivery.delivery_count >= max_delivery_count {
            warn!(
                subscription = %self.name,
                message_id = %delivery.message.message_id,
                delivery_count = delivery.delivery_count,
                "Message exceeded max delivery count, dead-lettered"
            );
            self.dead_letters.lock().push(delivery.to_received(&self.name));
            self.settle();
            return;
        }

        delivery.delivery_count += 1;
        if self.queue_tx.send(delivery).is_err() {
            self.settle();
        }
    }
}

#[async_trait]
impl SubscriptionAdmin for InMemoryBroker {
    async fn subscription_exists(
        &self,
        topic: &TopicAddress,
        name: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self.state.topic(topic)?.get(name).is_some())
    }

    async fn create_subscription(
        &self,
        topic: &TopicAddress,
        spec: &SubscriptionSpec,
    ) -> Result<(), BrokerError> {
        let topic_state = self.state.topic(topic)?;
        if take_fault(&self.state.faults.creates) {
            return Err(BrokerError::Transport("injected create failure".into()));
        }

        let key = spec.name.to_ascii_lowercase();
        let mut subscriptions = topic_state.subscriptions.write();
        if subscriptions.contains_key(&key) {
            return Err(BrokerError::SubscriptionExists(spec.name.clone()));
        }
        subscriptions.insert(
            key,
            Arc::new(SubscriptionState::new(spec.clone(), self.state.clock.now())),
        );
        self.state.creates.fetch_add(1, Ordering::SeqCst);

        debug!(topic = %topic.topic, subscription = %spec.name, "Subscription created");
        Ok(())
    }

    async fn delete_subscription(
        &self,
        topic: &TopicAddress,
        name: &str,
    ) -> Result<(), BrokerError> {
        let topic_state = self.state.topic(topic)?;
        if take_fault(&self.state.faults.deletes) {
            return Err(BrokerError::Transport("injected delete failure".into()));
        }

        let removed = topic_state
            .subscriptions
            .write()
            .remove(&name.to_ascii_lowercase());
        match removed {
            Some(sub) => {
                sub.detach();
                debug!(topic = %topic.topic, subscription = %name, "Subscription deleted");
                Ok(())
            }
            None => Err(BrokerError::SubscriptionNotFound(name.to_string())),
        }
    }

    async fn list_subscriptions(&self, topic: &TopicAddress) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<String> = self
            .state
            .topic(topic)?
            .snapshot()
            .iter()
            .map(|sub| sub.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn open_sender(&self, topic: &TopicAddress) -> Result<Arc<dyn TopicSender>, BrokerError> {
        let topic_state = self.state.topic(topic)?;
        if take_fault(&self.state.faults.sender_opens) {
            return Err(BrokerError::Transport("injected sender open failure".into()));
        }
        Ok(Arc::new(MemorySender {
            state: Arc::clone(&self.state),
            topic: topic_state,
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_receiver(
        &self,
        topic: &TopicAddress,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<dyn TopicReceiver>, BrokerError> {
        let topic_state = self.state.topic(topic)?;
        if take_fault(&self.state.faults.receiver_opens) {
            return Err(BrokerError::Transport("injected receiver open failure".into()));
        }

        let sub = topic_state
            .get(subscription)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(subscription.to_string()))?;
        let queue = sub.queue_rx.lock().take().ok_or_else(|| {
            BrokerError::Transport(format!("subscription {subscription} already has a processor"))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *sub.processor.lock() = Some(shutdown_tx);
        sub.touch(self.state.clock.now());

        let task = tokio::spawn(run_processor(
            Arc::clone(&self.state),
            Arc::clone(&sub),
            queue,
            handler,
            shutdown_rx,
        ));

        debug!(topic = %topic.topic, subscription = %sub.name, "Processor attached");
        Ok(Arc::new(MemoryReceiver {
            subscription: sub,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// Pull deliveries off the queue until shut down, then hand the queue back
/// to the subscription.
async fn run_processor(
    state: Arc<BrokerState>,
    sub: Arc<SubscriptionState>,
    mut queue: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = queue.recv() => {
                let Some(delivery) = next else { break };
                let now = state.clock.now();

                if sub.is_expired(&delivery, now) {
                    debug!(
                        subscription = %sub.name,
                        message_id = %delivery.message.message_id,
                        "Message expired before delivery"
                    );
                    sub.settle();
                    continue;
                }
                sub.touch(now);

                let state = Arc::clone(&state);
                let sub = Arc::clone(&sub);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let received = delivery.to_received(&sub.name);
                    match handler.handle(received).await {
                        Disposition::Complete => sub.settle(),
                        Disposition::Abandon => sub.abandon(delivery, state.max_delivery_count),
                    }
                });
            }
        }
    }

    *sub.queue_rx.lock() = Some(queue);
    debug!(subscription = %sub.name, "Processor stopped");
}

struct MemorySender {
    state: Arc<BrokerState>,
    topic: Arc<TopicState>,
    closed: AtomicBool,
}

#[async_trait]
impl TopicSender for MemorySender {
    async fn send(&self, message: WireMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if take_fault(&self.state.faults.sends) {
            return Err(BrokerError::Transport("injected send failure".into()));
        }

        let now = self.state.clock.now();
        for sub in self.topic.snapshot() {
            if sub.spec.filter.matches(&message) {
                sub.enqueue(Delivery {
                    message: message.clone(),
                    delivery_count: 1,
                    enqueued_at: now,
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryReceiver {
    subscription: Arc<SubscriptionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MemoryReceiver {
    // A receiver dropped without `close` must not keep the subscription
    // attached, or idle auto-delete never reclaims it. After `close` the
    // slot may belong to a newer processor, so leave it alone.
    fn drop(&mut self) {
        if self.task.get_mut().take().is_some() {
            self.subscription.detach();
        }
    }
}

#[async_trait]
impl TopicReceiver for MemoryReceiver {
    async fn close(&self) -> Result<(), BrokerError> {
        self.subscription.detach();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| BrokerError::Transport(format!("processor task failed: {e}")))?;
        }
        Ok(())
    }
}

/// Background task driving idle auto-delete for one broker.
pub struct IdleSweeper {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    fn spawn(state: Weak<BrokerState>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (shutdown, mut signal) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = signal.changed() => break,
                    _ = ticker.tick() => {
                        let Some(state) = state.upgrade() else { break };
                        let removed = state.sweep_idle();
                        trace!(removed = removed.len(), "Idle sweep");
                    }
                }
            }
            debug!("Idle sweeper stopped");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Idle sweeper task failed");
            }
        }
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
