//! Gossip propagation end-to-end over the in-process network.

use starling_api::registry::{DefaultTrackerRegistry, DynTrackerRegistry};
use starling_api::{MessageId, MessageRef, NodeId, StreamMessage, StreamPartition};
use starling_node::config::NodeConfig;
use starling_node::events::NodeEvent;
use starling_node::{Node, NodeOptions};
use starling_test_utils::{FullMeshTopologyFactory, MemNetwork};
use starling_tracker::{Tracker, TrackerOptions};
use std::time::Duration;

fn sp() -> StreamPartition {
    StreamPartition::new("stream-1", 0)
}

fn message(timestamp: i64, prev: Option<i64>) -> StreamMessage {
    StreamMessage {
        message_id: MessageId {
            stream_id: "stream-1".into(),
            stream_partition: 0,
            timestamp,
            sequence_number: 0,
            publisher_id: "publisher-1".into(),
            msg_chain_id: "chain-1".into(),
        },
        prev_msg_ref: prev.map(|t| MessageRef::new(t, 0)),
        payload: bytes::Bytes::from_static(b"payload"),
    }
}

fn registry() -> DynTrackerRegistry {
    DefaultTrackerRegistry::create(vec![MemNetwork::tracker_info(
        "tracker-1",
    )])
    .unwrap()
}

fn start_tracker(net: &MemNetwork) -> Tracker {
    starling_test_utils::enable_tracing();
    let tracker = Tracker::new(TrackerOptions {
        tracker_id: "tracker-1".into(),
        server: net.create_tracker("tracker-1"),
        topology_factory: FullMeshTopologyFactory::create(),
        location_resolver: None,
    });
    tracker.start();
    tracker
}

fn start_node(net: &MemNetwork, id: &str) -> Node {
    let (node_transport, tracker_transport) = net.create_node(id, false);
    let node = Node::new(NodeOptions {
        node_transport,
        tracker_transport,
        tracker_registry: registry(),
        storage: None,
        storage_config: None,
        location: None,
        config: NodeConfig::default(),
    });
    node.start();
    node
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn tracker_instructions_connect_subscribed_nodes() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let node_a = start_node(&net, "a");
    let node_b = start_node(&net, "b");
    settle().await;

    node_a.subscribe_to_stream(&sp());
    node_b.subscribe_to_stream(&sp());
    settle().await;

    assert!(net.are_connected("a", "b"));
    assert_eq!(vec![NodeId::from("b")], node_a.neighbors());
    assert_eq!(vec![NodeId::from("a")], node_b.neighbors());
}

#[tokio::test(start_paused = true)]
async fn published_messages_gossip_to_neighbors() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let node_a = start_node(&net, "a");
    let node_b = start_node(&net, "b");
    let mut events_b = node_b.take_events().unwrap();
    settle().await;

    node_a.subscribe_to_stream(&sp());
    node_b.subscribe_to_stream(&sp());
    settle().await;

    node_a.publish(message(1, None));
    node_a.publish(message(2, Some(1)));
    settle().await;

    let unseen: Vec<i64> = drain(&mut events_b)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::UnseenMessageReceived { message, .. } => {
                Some(message.message_id.timestamp)
            }
            _ => None,
        })
        .collect();
    assert_eq!(vec![1, 2], unseen);
}

#[tokio::test(start_paused = true)]
async fn replayed_message_is_suppressed_as_duplicate() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let node_a = start_node(&net, "a");
    let node_b = start_node(&net, "b");
    let mut events_a = node_a.take_events().unwrap();
    settle().await;

    node_a.subscribe_to_stream(&sp());
    node_b.subscribe_to_stream(&sp());
    settle().await;

    node_a.publish(message(1, None));
    settle().await;
    node_a.publish(message(1, None));
    settle().await;

    let events = drain(&mut events_a);
    let unseen = events
        .iter()
        .filter(|e| matches!(e, NodeEvent::UnseenMessageReceived { .. }))
        .count();
    let duplicates = events
        .iter()
        .filter(|e| matches!(e, NodeEvent::DuplicateMessageReceived { .. }))
        .count();
    assert_eq!(1, unseen);
    assert_eq!(1, duplicates);
}

#[tokio::test(start_paused = true)]
async fn buffered_messages_flush_once_a_neighbor_appears() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let node_a = start_node(&net, "a");
    let node_b = start_node(&net, "b");
    let mut events_b = node_b.take_events().unwrap();
    settle().await;

    // published with nobody to deliver to: parked in the buffer
    node_a.subscribe_to_stream(&sp());
    settle().await;
    node_a.publish(message(1, None));
    settle().await;

    node_b.subscribe_to_stream(&sp());
    settle().await;

    let delivered = drain(&mut events_b).into_iter().any(|event| {
        matches!(
            event,
            NodeEvent::UnseenMessageReceived { message, .. }
                if message.message_id.timestamp == 1
        )
    });
    assert!(delivered, "buffered message should reach the late neighbor");
}

#[tokio::test(start_paused = true)]
async fn neighbor_disconnect_cleans_up_and_retracks() {
    let net = MemNetwork::new();
    let tracker = start_tracker(&net);
    let node_a = start_node(&net, "a");
    let node_b = start_node(&net, "b");
    settle().await;

    node_a.subscribe_to_stream(&sp());
    node_b.subscribe_to_stream(&sp());
    settle().await;
    assert!(!node_a.neighbors().is_empty());

    net.drop_node("b");
    settle().await;

    assert!(node_a.neighbors().is_empty());
    let topology = tracker.topology(&sp()).unwrap();
    assert!(!topology.contains_key(&NodeId::from("b")));
}
