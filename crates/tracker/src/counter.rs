//! Monotonic per-(node, stream) instruction counters.

use starling_api::protocol::{Status, StreamStatus};
use starling_api::{NodeId, StreamPartition};
use std::collections::HashMap;

/// Stamps outgoing instructions with monotonically increasing counters and
/// filters incoming statuses against them, so a status reordered over the
/// wire can never roll the tracker's view of a node backwards.
#[derive(Debug, Default)]
pub struct InstructionCounter {
    counters: HashMap<NodeId, HashMap<StreamPartition, u64>>,
}

impl InstructionCounter {
    /// Construct an empty counter registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter value to stamp on the next instruction to `node` for
    /// `stream`. Starts at 1 for a fresh (node, stream) pair.
    pub fn set_or_increment(
        &mut self,
        node: &NodeId,
        stream: &StreamPartition,
    ) -> u64 {
        let counter = self
            .counters
            .entry(node.clone())
            .or_default()
            .entry(stream.clone())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Drop every stream entry of `status` whose counter is behind the
    /// last value issued to `source` for that stream. Entries for streams
    /// never instructed pass through (their slot materializes at 0).
    pub fn filter_status(
        &mut self,
        status: &Status,
        source: &NodeId,
    ) -> HashMap<StreamPartition, StreamStatus> {
        status
            .streams
            .iter()
            .filter(|(stream, stream_status)| {
                let current = *self
                    .counters
                    .entry(source.clone())
                    .or_default()
                    .entry((*stream).clone())
                    .or_insert(0);
                let fresh = stream_status.counter >= current;
                if !fresh {
                    tracing::debug!(
                        node = %source,
                        %stream,
                        got = stream_status.counter,
                        expected = current,
                        "filtered stale status entry"
                    );
                }
                fresh
            })
            .map(|(stream, stream_status)| {
                (stream.clone(), stream_status.clone())
            })
            .collect()
    }

    /// Forget every counter for a node that left.
    pub fn remove_node(&mut self, node: &NodeId) {
        self.counters.remove(node);
    }

    /// Forget every node's counter for a stream whose topology was deleted.
    pub fn remove_stream(&mut self, stream: &StreamPartition) {
        for per_node in self.counters.values_mut() {
            per_node.remove(stream);
        }
        self.counters.retain(|_, per_node| !per_node.is_empty());
    }
}
