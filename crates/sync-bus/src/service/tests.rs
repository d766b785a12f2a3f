//! Tests for NodeSyncBus

use super::*;
use crate::adapters::{
    InMemoryBroker, ManualTimeSource, SystemTimeSource, DEFAULT_MAX_DELIVERY_COUNT,
};
use crate::config::{BusConfig, DEFAULT_TOPIC_NAME};
use crate::domain::{encode, encode_heartbeat, BrokerError, BusError, SubscriptionFilter};
use crate::ports::{
    BrokerClient, SubscriptionAdmin, SubscriptionSpec, SyncBusApi, TimeSource, TopicAddress,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{Envelope, MessageType, NodeId, TypesError};
use tokio::time::timeout;

const CONNECTION: &str = "memory://service-tests";

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

fn topic() -> TopicAddress {
    TopicAddress::new(CONNECTION, DEFAULT_TOPIC_NAME)
}

fn bus_with(broker: &InMemoryBroker, clock: Arc<dyn TimeSource>) -> NodeSyncBus {
    NodeSyncBus::new(
        BusConfig::with_connection_string(CONNECTION),
        Arc::new(broker.clone()),
        clock,
    )
}

fn bus(broker: &InMemoryBroker) -> NodeSyncBus {
    bus_with(broker, Arc::new(SystemTimeSource::new()))
}

/// Subscription for a peer that never runs a processor.
fn peer_spec(name: &str) -> SubscriptionSpec {
    SubscriptionSpec {
        name: name.to_string(),
        filter: SubscriptionFilter::for_node(node(name)),
        auto_delete_on_idle: Duration::from_secs(300),
        default_message_ttl: Duration::from_secs(60),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[tokio::test]
async fn test_send_before_register_fails_fast() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    let result = bus.send(Envelope::signal(MessageType::RequestSessionList)).await;
    assert!(matches!(result, Err(BusError::NotInitialized)));
    assert_eq!(bus.state(), BusState::Unregistered);
}

#[tokio::test]
async fn test_register_requires_connection_string() {
    let broker = InMemoryBroker::new();
    let bus = NodeSyncBus::new(
        BusConfig::default(),
        Arc::new(broker.clone()),
        Arc::new(SystemTimeSource::new()),
    );

    let result = bus.register(node("node-a")).await;
    assert!(matches!(result, Err(BusError::MissingConnectionString)));
    assert_eq!(broker.create_count(), 0);
}

#[tokio::test]
async fn test_register_as_rejects_blank_id() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    let result = bus.register_as("   ").await;
    assert!(matches!(
        result,
        Err(BusError::InvalidArgument(TypesError::EmptyNodeId))
    ));
}

#[tokio::test]
async fn test_register_creates_subscription_and_announces() {
    let broker = InMemoryBroker::new();
    broker
        .create_subscription(&topic(), &peer_spec("observer"))
        .await
        .unwrap();
    let bus = bus(&broker);

    bus.register(node("node-a")).await.unwrap();

    assert_eq!(bus.state(), BusState::Registered);
    assert!(bus.is_registered());
    assert_eq!(bus.local_node_id(), Some(node("node-a")));
    assert_eq!(bus.topic_name(), DEFAULT_TOPIC_NAME);
    assert!(broker.subscription_exists(&topic(), "node-a").await.unwrap());
    assert!(broker.has_processor(&topic(), "node-a"));
    // The initial heartbeat is waiting on the observer's subscription.
    assert_eq!(broker.pending_count(&topic(), "observer"), 1);

    bus.unregister().await;
}

#[tokio::test]
async fn test_register_twice_is_rejected() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();

    let result = bus.register(node("node-b")).await;
    match result {
        Err(BusError::AlreadyRegistered(current)) => assert_eq!(current, "node-a"),
        other => panic!("expected AlreadyRegistered, got {other:?}"),
    }
    assert_eq!(bus.local_node_id(), Some(node("node-a")));
    assert_eq!(broker.create_count(), 1);

    bus.unregister().await;
}

#[tokio::test]
async fn test_register_reuses_existing_subscription() {
    let broker = InMemoryBroker::new();
    broker
        .create_subscription(&topic(), &peer_spec("node-a"))
        .await
        .unwrap();
    let bus = bus(&broker);

    bus.register(node("node-a")).await.unwrap();
    assert_eq!(broker.create_count(), 1);

    bus.unregister().await;
}

#[tokio::test]
async fn test_failed_initial_heartbeat_does_not_fail_register() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    broker.fail_next_sends(1);
    bus.register(node("node-a")).await.unwrap();
    assert!(bus.is_registered());

    bus.unregister().await;
}

// =============================================================================
// ROLLBACK
// =============================================================================

#[tokio::test]
async fn test_rollback_when_subscription_creation_fails() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    broker.fail_next_creates(1);
    let result = bus.register(node("node-a")).await;

    assert!(matches!(
        result,
        Err(BusError::Registration(BrokerError::Transport(_)))
    ));
    assert_eq!(bus.state(), BusState::Unregistered);
    assert_eq!(broker.create_count(), 0);
}

#[tokio::test]
async fn test_rollback_when_receiver_fails() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    broker.fail_next_receiver_opens(1);
    let result = bus.register(node("node-a")).await;

    assert!(matches!(result, Err(BusError::Registration(_))));
    assert_eq!(bus.state(), BusState::Unregistered);
    assert!(!broker.subscription_exists(&topic(), "node-a").await.unwrap());
    assert!(bus.local_node_id().is_none());
}

#[tokio::test]
async fn test_rollback_when_sender_fails() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    broker.fail_next_sender_opens(1);
    let result = bus.register(node("node-a")).await;

    assert!(matches!(result, Err(BusError::Registration(_))));
    assert_eq!(bus.state(), BusState::Unregistered);
    assert!(!broker.subscription_exists(&topic(), "node-a").await.unwrap());
    assert!(bus.subscribe().next().await.is_none());

    // A clean retry succeeds.
    bus.register(node("node-a")).await.unwrap();
    assert!(broker.has_processor(&topic(), "node-a"));
    bus.unregister().await;
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn test_send_rejects_mismatched_payload() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();

    let result = bus
        .send(Envelope::new(MessageType::SessionList, vec![1u8, 2]))
        .await;
    assert!(matches!(
        result,
        Err(BusError::InvalidArgument(TypesError::PayloadMismatch { .. }))
    ));

    bus.unregister().await;
}

#[tokio::test]
async fn test_send_failure_is_swallowed() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();

    broker.fail_next_sends(1);
    let before = sync_telemetry::metrics::SEND_FAILURES.get();
    let result = bus
        .send(Envelope::new(MessageType::SessionEvent, vec![9u8]))
        .await;

    assert!(result.is_ok());
    assert!(sync_telemetry::metrics::SEND_FAILURES.get() > before);

    bus.unregister().await;
}

#[tokio::test]
async fn test_send_reaches_peer_subscription() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();
    broker
        .create_subscription(&topic(), &peer_spec("node-b"))
        .await
        .unwrap();

    bus.send(Envelope::new(MessageType::SessionCreated, vec![1u8]))
        .await
        .unwrap();
    bus.send(Envelope::signal(MessageType::RequestSessionList).to(node("node-c")))
        .await
        .unwrap();

    // Only the broadcast matches node-b's filter.
    assert_eq!(broker.pending_count(&topic(), "node-b"), 1);

    bus.unregister().await;
}

// =============================================================================
// UNREGISTER
// =============================================================================

#[tokio::test]
async fn test_unregister_tears_everything_down() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();
    let mut inbound = bus.subscribe();

    bus.unregister().await;

    assert_eq!(bus.state(), BusState::Unregistered);
    assert!(bus.local_node_id().is_none());
    assert!(bus.liveness().is_empty());
    assert!(!broker.subscription_exists(&topic(), "node-a").await.unwrap());
    assert!(timeout(Duration::from_secs(1), inbound.next())
        .await
        .unwrap()
        .is_none());

    let result = bus.send(Envelope::signal(MessageType::RequestSessionList)).await;
    assert!(result.unwrap_err().is_not_initialized());
}

#[tokio::test]
async fn test_unregister_is_idempotent_and_bus_reusable() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    bus.unregister().await;
    bus.register(node("node-a")).await.unwrap();
    bus.unregister().await;
    bus.unregister().await;

    bus.register(node("node-b")).await.unwrap();
    assert_eq!(bus.local_node_id(), Some(node("node-b")));
    bus.unregister().await;
}

#[tokio::test]
async fn test_unregister_survives_delete_failure() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();

    broker.fail_next_deletes(1);
    bus.unregister().await;

    assert_eq!(bus.state(), BusState::Unregistered);
    // Left for the broker's idle auto-delete or a peer's sweep.
    assert!(broker.subscription_exists(&topic(), "node-a").await.unwrap());
    assert!(!broker.has_processor(&topic(), "node-a"));
}

#[tokio::test]
async fn test_stream_taken_while_unregistered_ends() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    assert!(bus.subscribe().next().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_with_messages_in_flight_ends_stream() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("node-a")).await.unwrap();
    let mut inbound = bus.subscribe();

    let peer = broker.open_sender(&topic()).await.unwrap();
    let envelope = Envelope::new(MessageType::SessionEvent, vec![9u8]).from_node(node("node-b"));
    for _ in 0..200 {
        peer.send(encode(&envelope).unwrap()).await.unwrap();
    }
    bus.unregister().await;

    let drained = timeout(Duration::from_secs(2), async {
        let mut count = 0;
        while inbound.next().await.is_some() {
            count += 1;
        }
        count
    })
    .await
    .expect("stream did not end after unregister");

    assert!(drained <= 200);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbound.next().await.is_none());
    assert!(bus.subscribe().next().await.is_none());
}

#[tokio::test]
async fn test_dropped_bus_is_reclaimed_by_idle_auto_delete() {
    let clock = Arc::new(ManualTimeSource::starting_now());
    let broker = InMemoryBroker::with_options(clock.clone(), DEFAULT_MAX_DELIVERY_COUNT);
    let bus = bus_with(&broker, clock.clone());
    bus.register(node("crashed")).await.unwrap();

    // No unregister, as after a crash.
    drop(bus);
    assert!(!broker.has_processor(&topic(), "crashed"));

    clock.advance(Duration::from_secs(3600));
    assert_eq!(broker.sweep_idle(), vec!["crashed".to_string()]);
    assert!(!broker.subscription_exists(&topic(), "crashed").await.unwrap());
}

// =============================================================================
// MAINTENANCE
// =============================================================================

#[tokio::test]
async fn test_tick_requires_registration() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    assert!(matches!(
        bus.maintenance_tick().await,
        Err(BusError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_sweep_keeps_fresh_evicts_stale_seeds_unseen() {
    let broker = InMemoryBroker::new();
    let clock = Arc::new(ManualTimeSource::starting_now());
    let bus = bus_with(&broker, clock.clone());
    bus.register(node("sweeper")).await.unwrap();

    for peer in ["fresh", "stale", "unseen"] {
        broker
            .create_subscription(&topic(), &peer_spec(peer))
            .await
            .unwrap();
    }
    let raw = broker.open_sender(&topic()).await.unwrap();

    raw.send(encode_heartbeat(&node("stale"), clock.now()))
        .await
        .unwrap();
    wait_until(|| bus.liveness().contains(&node("stale"))).await;

    clock.advance(Duration::from_secs(181));
    raw.send(encode_heartbeat(&node("fresh"), clock.now()))
        .await
        .unwrap();
    wait_until(|| bus.liveness().contains(&node("fresh"))).await;

    let report = bus.maintenance_tick().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            discovered: 1,
            evicted: 1,
            retained: 1,
            forgotten: 0,
        }
    );
    assert!(!bus.liveness().contains(&node("stale")));
    assert_eq!(bus.liveness().last_seen(&node("unseen")), Some(clock.now()));
    assert_eq!(
        broker.list_subscriptions(&topic()).await.unwrap(),
        vec![
            "fresh".to_string(),
            "sweeper".to_string(),
            "unseen".to_string()
        ]
    );

    bus.unregister().await;
}

#[tokio::test]
async fn test_stale_boundary_is_not_evicted() {
    let broker = InMemoryBroker::new();
    let clock = Arc::new(ManualTimeSource::starting_now());
    let bus = bus_with(&broker, clock.clone());
    bus.register(node("sweeper")).await.unwrap();
    broker
        .create_subscription(&topic(), &peer_spec("peer"))
        .await
        .unwrap();

    let first = bus.maintenance_tick().await.unwrap();
    assert_eq!(first.discovered, 1);

    clock.advance(Duration::from_secs(180));
    let second = bus.maintenance_tick().await.unwrap();
    assert_eq!(second.retained, 1);
    assert_eq!(second.evicted, 0);

    clock.advance(Duration::from_secs(1));
    let third = bus.maintenance_tick().await.unwrap();
    assert_eq!(third.evicted, 1);

    bus.unregister().await;
}

#[tokio::test]
async fn test_failed_eviction_is_retried_next_tick() {
    let broker = InMemoryBroker::new();
    let clock = Arc::new(ManualTimeSource::starting_now());
    let bus = bus_with(&broker, clock.clone());
    bus.register(node("sweeper")).await.unwrap();
    broker
        .create_subscription(&topic(), &peer_spec("peer"))
        .await
        .unwrap();

    bus.maintenance_tick().await.unwrap();
    clock.advance(Duration::from_secs(200));

    broker.fail_next_deletes(1);
    let report = bus.maintenance_tick().await.unwrap();
    assert_eq!(report.evicted, 0);
    assert_eq!(report.retained, 1);
    assert!(bus.liveness().contains(&node("peer")));

    let report = bus.maintenance_tick().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert!(!bus.liveness().contains(&node("peer")));

    bus.unregister().await;
}

#[tokio::test]
async fn test_vanished_peer_is_forgotten() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.register(node("sweeper")).await.unwrap();
    broker
        .create_subscription(&topic(), &peer_spec("ghost"))
        .await
        .unwrap();

    assert_eq!(bus.maintenance_tick().await.unwrap().discovered, 1);

    broker.delete_subscription(&topic(), "ghost").await.unwrap();
    let report = bus.maintenance_tick().await.unwrap();
    assert_eq!(report.forgotten, 1);
    assert!(bus.liveness().is_empty());

    bus.unregister().await;
}

#[tokio::test]
async fn test_timer_runs_sweep() {
    let broker = InMemoryBroker::new();
    let config = BusConfig {
        maintenance_interval: Duration::from_millis(20),
        ..BusConfig::with_connection_string(CONNECTION)
    };
    let bus = NodeSyncBus::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(SystemTimeSource::new()),
    );
    bus.register(node("node-a")).await.unwrap();
    broker
        .create_subscription(&topic(), &peer_spec("node-c"))
        .await
        .unwrap();

    wait_until(|| bus.liveness().contains(&node("node-c"))).await;

    bus.unregister().await;
    assert!(bus.liveness().is_empty());
}

// =============================================================================
// DRIVING PORT
// =============================================================================

#[tokio::test]
async fn test_usable_through_api_trait() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let api: &dyn SyncBusApi = &bus;

    api.register(node("node-a")).await.unwrap();
    api.send(Envelope::signal(MessageType::RequestSessionList))
        .await
        .unwrap();
    let mut stream = api.subscribe();
    api.unregister().await;

    assert!(stream.next().await.is_none());
}
