//! Several nodes sharing one in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use sync_bus::adapters::{InMemoryBroker, SystemTimeSource, DEFAULT_MAX_DELIVERY_COUNT};
use sync_bus::domain::wire::{PROP_MESSAGE_TYPE, PROP_NODE_ID};
use sync_bus::domain::{PropertyValue, WireMessage};
use sync_bus::ports::{BrokerClient, SubscriptionAdmin, TopicAddress};
use sync_bus::{BusConfig, BusError, EnvelopeStream, NodeSyncBus, DEFAULT_TOPIC_NAME};
use sync_types::{Envelope, MessageType, NodeId, Payload};
use tokio::time::timeout;

const CONNECTION: &str = "memory://cluster";

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

fn topic() -> TopicAddress {
    TopicAddress::new(CONNECTION, DEFAULT_TOPIC_NAME)
}

async fn join(broker: &InMemoryBroker, id: &str) -> (NodeSyncBus, EnvelopeStream) {
    let bus = NodeSyncBus::new(
        BusConfig::with_connection_string(CONNECTION),
        Arc::new(broker.clone()),
        Arc::new(SystemTimeSource::new()),
    );
    bus.register(node(id)).await.unwrap();
    let stream = bus.subscribe();
    (bus, stream)
}

async fn next(stream: &mut EnvelopeStream) -> Envelope {
    timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("no envelope received")
        .expect("stream ended")
}

async fn assert_silent(stream: &mut EnvelopeStream) {
    let result = timeout(Duration::from_millis(100), stream.next()).await;
    assert!(result.is_err(), "unexpected envelope: {result:?}");
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_reaches_everyone_but_sender() {
    let broker = InMemoryBroker::new();
    let (a, mut a_in) = join(&broker, "node-a").await;
    let (b, mut b_in) = join(&broker, "node-b").await;
    let (c, mut c_in) = join(&broker, "node-c").await;

    a.send(Envelope::new(MessageType::SessionEvent, vec![1u8, 2, 3]))
        .await
        .unwrap();

    for stream in [&mut b_in, &mut c_in] {
        let envelope = next(stream).await;
        assert_eq!(envelope.sender, Some(node("node-a")));
        assert_eq!(envelope.message_type, MessageType::SessionEvent);
        assert_eq!(envelope.payload, Payload::Bytes(Bytes::from_static(&[1, 2, 3])));
        assert!(envelope.is_broadcast());
    }
    assert_silent(&mut a_in).await;

    for bus in [&a, &b, &c] {
        bus.unregister().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_directed_message_reaches_only_recipient() {
    let broker = InMemoryBroker::new();
    let (a, mut a_in) = join(&broker, "node-a").await;
    let (b, mut b_in) = join(&broker, "node-b").await;
    let (c, mut c_in) = join(&broker, "node-c").await;

    let names = vec!["table, one".to_string(), "table;two".to_string()];
    a.send(Envelope::new(MessageType::SessionList, names.clone()).to_raw("NODE-B"))
        .await
        .unwrap();

    let envelope = next(&mut b_in).await;
    assert_eq!(envelope.payload, Payload::Names(names));
    assert_eq!(envelope.recipient, Some(node("node-b")));

    assert_silent(&mut c_in).await;
    assert_silent(&mut a_in).await;

    for bus in [&a, &b, &c] {
        bus.unregister().await;
    }
}

#[tokio::test]
async fn test_request_reply_exchange() {
    let broker = InMemoryBroker::new();
    let (a, mut a_in) = join(&broker, "node-a").await;
    let (b, mut b_in) = join(&broker, "node-b").await;

    a.send(Envelope::signal(MessageType::RequestSessionList))
        .await
        .unwrap();
    let request = next(&mut b_in).await;
    assert_eq!(request.payload, Payload::Empty);

    let requester = request.sender.unwrap();
    b.send(Envelope::new(MessageType::SessionList, vec!["lobby".to_string()]).to(requester))
        .await
        .unwrap();

    let reply = next(&mut a_in).await;
    assert_eq!(reply.message_type, MessageType::SessionList);
    assert_eq!(reply.sender, Some(node("node-b")));
    assert_eq!(reply.payload, Payload::Names(vec!["lobby".to_string()]));

    a.unregister().await;
    b.unregister().await;
}

#[tokio::test]
async fn test_float_sentinels_survive_transport() {
    let broker = InMemoryBroker::new();
    let (a, _a_in) = join(&broker, "node-a").await;
    let (b, mut b_in) = join(&broker, "node-b").await;

    let mut snapshot = Vec::new();
    for value in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN, -0.0] {
        snapshot.extend_from_slice(&value.to_le_bytes());
    }
    a.send(Envelope::new(MessageType::Snapshot, snapshot.clone()))
        .await
        .unwrap();

    let envelope = next(&mut b_in).await;
    assert_eq!(envelope.payload, Payload::Bytes(Bytes::from(snapshot)));

    a.unregister().await;
    b.unregister().await;
}

#[tokio::test]
async fn test_join_announces_liveness() {
    let broker = InMemoryBroker::new();
    let (a, _a_in) = join(&broker, "node-a").await;
    let (b, _b_in) = join(&broker, "node-b").await;

    wait_until(|| a.liveness().contains(&node("node-b"))).await;

    a.unregister().await;
    b.unregister().await;
}

#[tokio::test]
async fn test_unregistered_node_stops_receiving() {
    let broker = InMemoryBroker::new();
    let (a, mut a_in) = join(&broker, "node-a").await;
    let (b, _b_in) = join(&broker, "node-b").await;

    a.unregister().await;
    b.send(Envelope::new(MessageType::SessionEvent, vec![5u8]))
        .await
        .unwrap();

    assert!(timeout(Duration::from_secs(1), a_in.next())
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        a.send(Envelope::signal(MessageType::RequestSessionList)).await,
        Err(BusError::NotInitialized)
    ));
    assert_eq!(broker.pending_count(&topic(), "node-a"), 0);

    b.unregister().await;
}

#[tokio::test]
async fn test_peer_evicts_crashed_node() {
    let broker = InMemoryBroker::new();
    let config = BusConfig {
        maintenance_interval: Duration::from_millis(20),
        inactivity_timeout: Duration::from_millis(100),
        ..BusConfig::with_connection_string(CONNECTION)
    };
    let survivor = NodeSyncBus::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(SystemTimeSource::new()),
    );
    survivor.register(node("survivor")).await.unwrap();

    // Dropping without unregister leaves the subscription behind, as a crash would.
    let (crashed, _in) = join(&broker, "crashed").await;
    wait_until(|| survivor.liveness().contains(&node("crashed"))).await;
    drop(crashed);

    let evicted = timeout(Duration::from_secs(2), async {
        while broker
            .list_subscriptions(&topic())
            .await
            .unwrap()
            .iter()
            .any(|name| name == "crashed")
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "crashed node was never evicted");
    assert!(!survivor.liveness().contains(&node("crashed")));

    survivor.unregister().await;
}

#[tokio::test]
async fn test_undecodable_message_is_dead_lettered() {
    let broker = InMemoryBroker::new();
    let (a, mut a_in) = join(&broker, "node-a").await;

    let garbage = WireMessage::new()
        .with_property(PROP_NODE_ID, PropertyValue::Str("node-x".into()))
        .with_property(PROP_MESSAGE_TYPE, PropertyValue::Str("Teleport".into()));
    broker.open_sender(&topic()).await.unwrap().send(garbage).await.unwrap();

    wait_until(|| broker.dead_letters(&topic(), "node-a").len() == 1).await;
    let dead = broker.dead_letters(&topic(), "node-a");
    assert_eq!(dead[0].delivery_count, DEFAULT_MAX_DELIVERY_COUNT);
    assert_silent(&mut a_in).await;

    a.unregister().await;
}
