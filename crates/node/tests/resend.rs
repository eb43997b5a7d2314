//! Tiered resend fulfillment end-to-end over the in-process network.

use starling_api::protocol::ResendRequest;
use starling_api::registry::{DefaultTrackerRegistry, DynTrackerRegistry};
use starling_api::{MessageId, StreamMessage, StreamPartition};
use starling_node::config::NodeConfig;
use starling_node::resend::{ResendOutcome, ResendResponseItem};
use starling_node::{Node, NodeOptions};
use starling_test_utils::{FullMeshTopologyFactory, MemNetwork, MemStorage};
use starling_tracker::{Tracker, TrackerOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn sp() -> StreamPartition {
    StreamPartition::new("stream-x", 0)
}

fn message(timestamp: i64) -> StreamMessage {
    StreamMessage {
        message_id: MessageId {
            stream_id: "stream-x".into(),
            stream_partition: 0,
            timestamp,
            sequence_number: 0,
            publisher_id: "publisher-1".into(),
            msg_chain_id: "chain-1".into(),
        },
        prev_msg_ref: None,
        payload: bytes::Bytes::from_static(b"payload"),
    }
}

fn last_request(count: u64) -> ResendRequest {
    ResendRequest::ResendLastRequest {
        request_id: "req-1".into(),
        stream_id: "stream-x".to_string(),
        stream_partition: 0,
        number_last: count,
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

fn start_node(
    net: &MemNetwork,
    id: &str,
    storage: Option<Arc<MemStorage>>,
) -> Node {
    let (node_transport, tracker_transport) =
        net.create_node(id, storage.is_some());
    let node = Node::new(NodeOptions {
        node_transport,
        tracker_transport,
        tracker_registry: registry(),
        storage: storage.map(|s| s as starling_api::storage::DynStorage),
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

async fn collect(
    mut rx: mpsc::Receiver<ResendResponseItem>,
) -> (Vec<StreamMessage>, ResendOutcome) {
    let mut messages = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            ResendResponseItem::Message(unicast) => {
                assert_eq!("req-1", &*unicast.request_id);
                messages.push(unicast.stream_message);
            }
            ResendResponseItem::Done(outcome) => return (messages, outcome),
        }
    }
    panic!("response stream ended without a terminal marker");
}

#[tokio::test(start_paused = true)]
async fn local_storage_answers_request_last() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let storage = MemStorage::create();
    for t in 1..=15 {
        storage.insert(message(t));
    }
    let node = start_node(&net, "storage-1", Some(storage));
    settle().await;

    let (messages, outcome) = collect(node.request_resend(last_request(10))).await;

    assert_eq!(ResendOutcome::Fulfilled, outcome);
    let timestamps: Vec<i64> =
        messages.iter().map(|m| m.message_id.timestamp).collect();
    assert_eq!((6..=15).collect::<Vec<i64>>(), timestamps);
}

#[tokio::test(start_paused = true)]
async fn empty_local_storage_is_a_distinguishable_no_resend() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let node = start_node(&net, "storage-1", Some(MemStorage::create()));
    settle().await;

    let (messages, outcome) = collect(node.request_resend(last_request(10))).await;
    assert!(messages.is_empty());
    assert_eq!(ResendOutcome::NoResend, outcome);
}

#[tokio::test(start_paused = true)]
async fn resend_escalates_to_a_storage_node_and_releases_the_connection() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let storage = MemStorage::create();
    for t in 1..=3 {
        storage.insert(message(t));
    }
    let _storage_node = start_node(&net, "storage-1", Some(storage));
    let requester = start_node(&net, "requester", None);
    settle().await;

    let (messages, outcome) =
        collect(requester.request_resend(last_request(3))).await;

    assert_eq!(ResendOutcome::Fulfilled, outcome);
    let timestamps: Vec<i64> =
        messages.iter().map(|m| m.message_id.timestamp).collect();
    assert_eq!(vec![1, 2, 3], timestamps);

    // the temporary connection to the storage node gets torn down
    settle().await;
    assert!(!net.are_connected("requester", "storage-1"));
}

#[tokio::test(start_paused = true)]
async fn no_storage_anywhere_resolves_to_no_resend_without_hanging() {
    let net = MemNetwork::new();
    let _tracker = start_tracker(&net);
    let requester = start_node(&net, "requester", None);
    let _bystander = start_node(&net, "bystander", None);
    settle().await;

    let (messages, outcome) =
        collect(requester.request_resend(last_request(5))).await;
    assert!(messages.is_empty());
    assert_eq!(ResendOutcome::NoResend, outcome);
}
