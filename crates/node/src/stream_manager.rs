//! Per-node registry of subscribed streams and their neighbor sets.

use crate::detector::{DetectorError, DuplicateMessageDetector};
use starling_api::protocol::StreamStatus;
use starling_api::{MessageId, MessageRef, NodeId, StreamPartition};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A stream operation referenced a stream in the wrong lifecycle state, or
/// fed the duplicate detector inconsistent numbers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream has not been set up.
    #[error("stream {0} is not set up")]
    NotSetUp(StreamPartition),

    /// The stream is already set up.
    #[error("stream {0} already set up")]
    AlreadySetUp(StreamPartition),

    /// The duplicate detector rejected the message numbering.
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// State held per subscribed stream.
#[derive(Debug, Default)]
struct StreamState {
    /// One detector per `"publisherId|msgChainId"`.
    detectors: HashMap<String, DuplicateMessageDetector>,
    inbound_nodes: BTreeSet<NodeId>,
    outbound_nodes: BTreeSet<NodeId>,
    /// Counter of the last tracker instruction applied.
    counter: u64,
}

/// Registry of the streams this node is subscribed to, each stream's
/// inbound/outbound neighbor sets, and the duplicate detectors feeding the
/// gossip dedup decision. Single-owner: the node wraps this in its own
/// lock, there is no interior concurrency.
#[derive(Debug)]
pub struct StreamManager {
    streams: BTreeMap<StreamPartition, StreamState>,
    max_gap_count: usize,
}

impl StreamManager {
    /// Construct a manager whose detectors are bounded to `max_gap_count`
    /// gaps each.
    pub fn new(max_gap_count: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            max_gap_count,
        }
    }

    /// Begin tracking a stream with empty neighbor sets and counter 0.
    pub fn set_up_stream(
        &mut self,
        stream: StreamPartition,
    ) -> Result<(), StreamError> {
        if self.streams.contains_key(&stream) {
            return Err(StreamError::AlreadySetUp(stream));
        }
        self.streams.insert(stream, StreamState::default());
        Ok(())
    }

    /// Stop tracking a stream, dropping its detectors and neighbor sets.
    pub fn remove_stream(
        &mut self,
        stream: &StreamPartition,
    ) -> Result<(), StreamError> {
        self.streams
            .remove(stream)
            .map(|_| ())
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))
    }

    /// Whether the stream is currently set up.
    pub fn is_set_up(&self, stream: &StreamPartition) -> bool {
        self.streams.contains_key(stream)
    }

    /// Run the duplicate check for a message, lazily creating the detector
    /// for its publisher/chain. Returns true if the message was unseen.
    pub fn mark_numbers_and_check_that_is_not_duplicate(
        &mut self,
        message_id: &MessageId,
        previous_ref: Option<MessageRef>,
    ) -> Result<bool, StreamError> {
        let stream = message_id.stream_partition();
        let max_gap_count = self.max_gap_count;
        let state = self
            .streams
            .get_mut(&stream)
            .ok_or(StreamError::NotSetUp(stream))?;
        let detector_key = format!(
            "{}|{}",
            message_id.publisher_id, message_id.msg_chain_id
        );
        let detector = state
            .detectors
            .entry(detector_key)
            .or_insert_with(|| DuplicateMessageDetector::new(max_gap_count));
        Ok(detector.mark_and_check(previous_ref, message_id.message_ref())?)
    }

    /// Record the counter of an applied tracker instruction.
    pub fn update_counter(
        &mut self,
        stream: &StreamPartition,
        counter: u64,
    ) -> Result<(), StreamError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        state.counter = counter;
        Ok(())
    }

    /// Add a neighbor the stream is received from.
    pub fn add_inbound_node(
        &mut self,
        stream: &StreamPartition,
        node: NodeId,
    ) -> Result<(), StreamError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        state.inbound_nodes.insert(node);
        Ok(())
    }

    /// Add a neighbor the stream is forwarded to.
    pub fn add_outbound_node(
        &mut self,
        stream: &StreamPartition,
        node: NodeId,
    ) -> Result<(), StreamError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        state.outbound_nodes.insert(node);
        Ok(())
    }

    /// Remove a neighbor from both directions of one stream.
    pub fn remove_node_from_stream(
        &mut self,
        stream: &StreamPartition,
        node: &NodeId,
    ) -> Result<(), StreamError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        state.inbound_nodes.remove(node);
        state.outbound_nodes.remove(node);
        Ok(())
    }

    /// Remove a neighbor everywhere, returning the streams it was part of.
    pub fn remove_node_from_all_streams(
        &mut self,
        node: &NodeId,
    ) -> Vec<StreamPartition> {
        let mut affected = Vec::new();
        for (stream, state) in self.streams.iter_mut() {
            let inbound = state.inbound_nodes.remove(node);
            let outbound = state.outbound_nodes.remove(node);
            if inbound || outbound {
                affected.push(stream.clone());
            }
        }
        affected
    }

    /// Neighbors the stream is received from.
    pub fn inbound_nodes(
        &self,
        stream: &StreamPartition,
    ) -> Result<Vec<NodeId>, StreamError> {
        let state = self
            .streams
            .get(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        Ok(state.inbound_nodes.iter().cloned().collect())
    }

    /// Neighbors the stream is forwarded to.
    pub fn outbound_nodes(
        &self,
        stream: &StreamPartition,
    ) -> Result<Vec<NodeId>, StreamError> {
        let state = self
            .streams
            .get(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        Ok(state.outbound_nodes.iter().cloned().collect())
    }

    /// All neighbors of a stream, either direction, deduplicated.
    pub fn all_nodes_for_stream(
        &self,
        stream: &StreamPartition,
    ) -> Result<Vec<NodeId>, StreamError> {
        let state = self
            .streams
            .get(stream)
            .ok_or_else(|| StreamError::NotSetUp(stream.clone()))?;
        Ok(state
            .inbound_nodes
            .union(&state.outbound_nodes)
            .cloned()
            .collect())
    }

    /// Every neighbor across all streams, deduplicated.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes = BTreeSet::new();
        for state in self.streams.values() {
            nodes.extend(state.inbound_nodes.iter().cloned());
            nodes.extend(state.outbound_nodes.iter().cloned());
        }
        nodes.into_iter().collect()
    }

    /// Whether the node is a neighbor on any stream.
    pub fn is_node_present(&self, node: &NodeId) -> bool {
        self.streams.values().any(|state| {
            state.inbound_nodes.contains(node)
                || state.outbound_nodes.contains(node)
        })
    }

    /// All subscribed streams.
    pub fn streams(&self) -> Vec<StreamPartition> {
        self.streams.keys().cloned().collect()
    }

    /// Status snapshot of the streams accepted by `include`, used to build
    /// the per-tracker portion of a status report.
    pub fn streams_with_connections(
        &self,
        include: impl Fn(&StreamPartition) -> bool,
    ) -> HashMap<StreamPartition, StreamStatus> {
        self.streams
            .iter()
            .filter(|(stream, _)| include(stream))
            .map(|(stream, state)| {
                (
                    stream.clone(),
                    StreamStatus {
                        inbound_nodes: state
                            .inbound_nodes
                            .iter()
                            .cloned()
                            .collect(),
                        outbound_nodes: state
                            .outbound_nodes
                            .iter()
                            .cloned()
                            .collect(),
                        counter: state.counter,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::detector::DEFAULT_MAX_GAP_COUNT;

    fn sp(id: &str, partition: u32) -> StreamPartition {
        StreamPartition::new(id, partition)
    }

    fn manager() -> StreamManager {
        StreamManager::new(DEFAULT_MAX_GAP_COUNT)
    }

    fn message_id(
        stream: &str,
        publisher: &str,
        chain: &str,
        timestamp: i64,
    ) -> MessageId {
        MessageId {
            stream_id: stream.into(),
            stream_partition: 0,
            timestamp,
            sequence_number: 0,
            publisher_id: publisher.into(),
            msg_chain_id: chain.into(),
        }
    }

    #[test]
    fn starts_out_empty() {
        let manager = manager();
        assert!(!manager.is_set_up(&sp("streamId", 0)));
        assert!(manager.streams().is_empty());
    }

    #[test]
    fn setting_up_streams_and_testing_values() {
        let mut manager = manager();
        manager.set_up_stream(sp("stream-1", 0)).unwrap();
        manager.set_up_stream(sp("stream-2", 0)).unwrap();
        manager.set_up_stream(sp("stream-1", 1)).unwrap();

        assert!(manager.is_set_up(&sp("stream-1", 0)));
        assert!(manager.is_set_up(&sp("stream-1", 1)));
        assert!(manager.is_set_up(&sp("stream-2", 0)));

        assert_eq!(
            vec![sp("stream-1", 0), sp("stream-1", 1), sp("stream-2", 0)],
            manager.streams()
        );
        for stream in manager.streams() {
            assert!(manager.inbound_nodes(&stream).unwrap().is_empty());
            assert!(manager.outbound_nodes(&stream).unwrap().is_empty());
        }
    }

    #[test]
    fn cannot_re_setup_same_stream() {
        let mut manager = manager();
        manager.set_up_stream(sp("stream-id", 0)).unwrap();
        assert_eq!(
            Err(StreamError::AlreadySetUp(sp("stream-id", 0))),
            manager.set_up_stream(sp("stream-id", 0))
        );
    }

    #[test]
    fn can_duplicate_detect_on_set_up_stream_only() {
        let mut manager = manager();
        let id = message_id("stream-id", "publisher", "chain", 10);
        assert_eq!(
            Err(StreamError::NotSetUp(sp("stream-id", 0))),
            manager.mark_numbers_and_check_that_is_not_duplicate(
                &id,
                Some(MessageRef::new(5, 0))
            )
        );

        manager.set_up_stream(sp("stream-id", 0)).unwrap();
        assert!(manager
            .mark_numbers_and_check_that_is_not_duplicate(
                &id,
                Some(MessageRef::new(5, 0))
            )
            .unwrap());
    }

    #[test]
    fn duplicate_detection_is_per_publisher_and_chain() {
        let mut manager = manager();
        manager.set_up_stream(sp("stream-id", 0)).unwrap();
        let prev = Some(MessageRef::new(5, 0));

        assert!(manager
            .mark_numbers_and_check_that_is_not_duplicate(
                &message_id("stream-id", "publisher-1", "chain-1", 10),
                prev
            )
            .unwrap());
        assert!(!manager
            .mark_numbers_and_check_that_is_not_duplicate(
                &message_id("stream-id", "publisher-1", "chain-1", 10),
                prev
            )
            .unwrap());
        assert!(manager
            .mark_numbers_and_check_that_is_not_duplicate(
                &message_id("stream-id", "publisher-2", "chain-1", 10),
                prev
            )
            .unwrap());
        assert!(manager
            .mark_numbers_and_check_that_is_not_duplicate(
                &message_id("stream-id", "publisher-1", "chain-2", 10),
                prev
            )
            .unwrap());
    }

    #[test]
    fn adding_inbound_and_outbound_nodes() {
        let mut manager = manager();
        let stream = sp("stream-id", 0);
        manager.set_up_stream(stream.clone()).unwrap();
        manager.add_inbound_node(&stream, "node-1".into()).unwrap();
        manager.add_inbound_node(&stream, "node-2".into()).unwrap();
        manager.add_outbound_node(&stream, "node-1".into()).unwrap();
        manager.add_outbound_node(&stream, "node-3".into()).unwrap();

        assert_eq!(
            vec![NodeId::from("node-1"), "node-2".into()],
            manager.inbound_nodes(&stream).unwrap()
        );
        assert_eq!(
            vec![NodeId::from("node-1"), "node-3".into()],
            manager.outbound_nodes(&stream).unwrap()
        );
        assert_eq!(
            vec![NodeId::from("node-1"), "node-2".into(), "node-3".into()],
            manager.all_nodes_for_stream(&stream).unwrap()
        );

        assert!(manager.is_node_present(&"node-1".into()));
        assert!(manager.is_node_present(&"node-3".into()));
        assert!(!manager.is_node_present(&"node-absent".into()));

        let snapshot = manager.streams_with_connections(|_| true);
        assert_eq!(
            &StreamStatus {
                inbound_nodes: vec!["node-1".into(), "node-2".into()],
                outbound_nodes: vec!["node-1".into(), "node-3".into()],
                counter: 0,
            },
            snapshot.get(&stream).unwrap()
        );
    }

    #[test]
    fn removing_node_from_stream_removes_both_directions() {
        let mut manager = manager();
        let stream = sp("stream-id", 0);
        let stream2 = sp("stream-id-2", 0);
        manager.set_up_stream(stream.clone()).unwrap();
        manager.add_inbound_node(&stream, "node-1".into()).unwrap();
        manager.add_outbound_node(&stream, "node-1".into()).unwrap();
        manager.add_outbound_node(&stream, "node-3".into()).unwrap();
        manager.set_up_stream(stream2.clone()).unwrap();
        manager.add_inbound_node(&stream2, "node-1".into()).unwrap();

        manager.remove_node_from_stream(&stream, &"node-1".into()).unwrap();

        assert_eq!(
            vec![NodeId::from("node-3")],
            manager.all_nodes_for_stream(&stream).unwrap()
        );
        // still present on the other stream
        assert!(manager.is_node_present(&"node-1".into()));

        manager
            .remove_node_from_stream(&stream2, &"node-1".into())
            .unwrap();
        assert!(!manager.is_node_present(&"node-1".into()));
    }

    #[test]
    fn remove_node_from_all_streams() {
        let mut manager = manager();
        for stream in [sp("stream-1", 0), sp("stream-1", 1), sp("stream-2", 0)] {
            manager.set_up_stream(stream.clone()).unwrap();
            manager.add_inbound_node(&stream, "node".into()).unwrap();
            manager
                .add_outbound_node(&stream, "should-stay".into())
                .unwrap();
        }

        let affected = manager.remove_node_from_all_streams(&"node".into());
        assert_eq!(
            vec![sp("stream-1", 0), sp("stream-1", 1), sp("stream-2", 0)],
            affected
        );
        assert!(!manager.is_node_present(&"node".into()));
        assert!(manager.is_node_present(&"should-stay".into()));
    }

    #[test]
    fn remove_stream_then_queries_fail_then_re_setup_is_fresh() {
        let mut manager = manager();
        let stream = sp("stream-1", 0);
        manager.set_up_stream(stream.clone()).unwrap();
        manager.add_inbound_node(&stream, "n1".into()).unwrap();
        manager.update_counter(&stream, 7).unwrap();

        manager.remove_stream(&stream).unwrap();
        assert!(!manager.is_set_up(&stream));
        assert_eq!(
            Err(StreamError::NotSetUp(stream.clone())),
            manager.inbound_nodes(&stream)
        );
        assert_eq!(
            Err(StreamError::NotSetUp(stream.clone())),
            manager.remove_stream(&stream)
        );

        manager.set_up_stream(stream.clone()).unwrap();
        assert!(manager.inbound_nodes(&stream).unwrap().is_empty());
        assert!(manager.outbound_nodes(&stream).unwrap().is_empty());
        assert_eq!(
            0,
            manager
                .streams_with_connections(|_| true)
                .get(&stream)
                .unwrap()
                .counter
        );
    }

    #[test]
    fn updating_counter() {
        let mut manager = manager();
        manager.set_up_stream(sp("stream-1", 0)).unwrap();
        manager.set_up_stream(sp("stream-2", 0)).unwrap();
        manager.update_counter(&sp("stream-1", 0), 50).unwrap();
        manager.update_counter(&sp("stream-2", 0), 100).unwrap();

        let snapshot = manager.streams_with_connections(|_| true);
        assert_eq!(50, snapshot.get(&sp("stream-1", 0)).unwrap().counter);
        assert_eq!(100, snapshot.get(&sp("stream-2", 0)).unwrap().counter);
    }

    #[test]
    fn status_snapshot_filters_by_predicate() {
        let mut manager = manager();
        manager.set_up_stream(sp("stream-1", 0)).unwrap();
        manager.set_up_stream(sp("stream-2", 0)).unwrap();

        let snapshot = manager
            .streams_with_connections(|stream| stream.stream_id() == "stream-1");
        assert_eq!(1, snapshot.len());
        assert!(snapshot.contains_key(&sp("stream-1", 0)));
    }
}
