//! The tracker-side topology coordinator.

use crate::counter::InstructionCounter;
use crate::location::{DynLocationResolver, LocationManager};
use starling_api::protocol::{
    InstructionMessage, Location, Status, StorageNodesRequest,
    StorageNodesResponse, StreamStatus,
};
use starling_api::topology::{
    DynOverlayTopologyFactory, OverlayTopology, TopologyState,
};
use starling_api::transport::{DynTrackerServer, TrackerServerHandler};
use starling_api::{NodeId, StreamPartition, TrackerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Collaborators for constructing a [Tracker].
pub struct TrackerOptions {
    /// This tracker's own id.
    pub tracker_id: TrackerId,
    /// The endpoint nodes connect to.
    pub server: DynTrackerServer,
    /// Builds one topology per stream-partition.
    pub topology_factory: DynOverlayTopologyFactory,
    /// Optional address → location fallback.
    pub location_resolver: Option<DynLocationResolver>,
}

/// A starling tracker.
///
/// Ingests node status reports, maintains one [OverlayTopology] per
/// stream-partition, and dispatches counter-stamped instructions to every
/// node whose desired neighbor set changed. All mutable state lives behind
/// one lock, applied atomically per inbound event; instruction sends
/// happen outside it, fire-and-forget.
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("tracker_id", &self.inner.tracker_id)
            .finish_non_exhaustive()
    }
}

struct TrackerInner {
    me: Weak<TrackerInner>,
    tracker_id: TrackerId,
    server: DynTrackerServer,
    topology_factory: DynOverlayTopologyFactory,
    state: Mutex<TrackerState>,
    instruction_seq: AtomicU64,
}

struct TrackerState {
    topologies: HashMap<StreamPartition, Box<dyn OverlayTopology>>,
    rtts: HashMap<NodeId, HashMap<NodeId, u32>>,
    storage_nodes: BTreeSet<NodeId>,
    counters: InstructionCounter,
    locations: LocationManager,
}

/// An instruction computed under the state lock, dispatched after it.
type Outgoing = (NodeId, InstructionMessage);

impl Tracker {
    /// Construct a tracker over its collaborators. Call [Tracker::start]
    /// to register the server handler.
    pub fn new(opts: TrackerOptions) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| TrackerInner {
                me: weak.clone(),
                tracker_id: opts.tracker_id,
                server: opts.server,
                topology_factory: opts.topology_factory,
                state: Mutex::new(TrackerState {
                    topologies: HashMap::new(),
                    rtts: HashMap::new(),
                    storage_nodes: BTreeSet::new(),
                    counters: InstructionCounter::new(),
                    locations: LocationManager::new(opts.location_resolver),
                }),
                instruction_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register for node events on the server endpoint.
    pub fn start(&self) {
        tracing::debug!(tracker_id = %self.inner.tracker_id, "starting tracker");
        self.inner.server.register_handler(Arc::new(TrackerServerEvents {
            inner: Arc::downgrade(&self.inner),
        }));
    }

    /// This tracker's id.
    pub fn tracker_id(&self) -> TrackerId {
        self.inner.tracker_id.clone()
    }

    /// The stream-partitions with a live topology.
    pub fn streams(&self) -> Vec<StreamPartition> {
        let state = self.inner.state.lock().unwrap();
        let mut streams: Vec<_> = state.topologies.keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Snapshot of one stream's topology, if it exists.
    pub fn topology(&self, stream: &StreamPartition) -> Option<TopologyState> {
        let state = self.inner.state.lock().unwrap();
        state.topologies.get(stream).map(|topology| topology.state())
    }

    /// Snapshot of every topology.
    pub fn overlay_per_stream(
        &self,
    ) -> HashMap<StreamPartition, TopologyState> {
        let state = self.inner.state.lock().unwrap();
        state
            .topologies
            .iter()
            .map(|(stream, topology)| (stream.clone(), topology.state()))
            .collect()
    }

    /// Known storage nodes.
    pub fn storage_nodes(&self) -> Vec<NodeId> {
        let state = self.inner.state.lock().unwrap();
        state.storage_nodes.iter().cloned().collect()
    }

    /// Last known location of one node.
    pub fn node_location(&self, node: &NodeId) -> Option<Location> {
        let state = self.inner.state.lock().unwrap();
        state.locations.node_location(node).cloned()
    }

    /// Every known node location.
    pub fn all_node_locations(&self) -> HashMap<NodeId, Location> {
        let state = self.inner.state.lock().unwrap();
        state.locations.all_node_locations().clone()
    }

    /// The reported RTT matrix: node → (peer → rtt ms).
    pub fn rtts(&self) -> HashMap<NodeId, HashMap<NodeId, u32>> {
        let state = self.inner.state.lock().unwrap();
        state.rtts.clone()
    }
}

impl TrackerInner {
    /// The owning Arc; infallible while any strong reference is alive,
    /// which a `&self` borrow guarantees.
    fn to_arc(&self) -> Arc<TrackerInner> {
        self.me.upgrade().expect("TrackerInner is alive")
    }

    fn next_request_id(&self) -> String {
        let seq = self.instruction_seq.fetch_add(1, Ordering::Relaxed);
        format!("instruction-{}-{seq}", self.tracker_id)
    }

    fn on_node_connected(&self, node: NodeId, is_storage: bool) {
        if is_storage {
            tracing::debug!(%node, "storage node connected");
            self.state.lock().unwrap().storage_nodes.insert(node);
        }
    }

    fn on_node_disconnected(&self, node: NodeId) {
        tracing::debug!(%node, "unregistering node from tracker");
        let outgoing = {
            let mut state = self.state.lock().unwrap();
            state.storage_nodes.remove(&node);
            state.rtts.remove(&node);
            state.locations.remove_node(&node);

            let mut outgoing = Vec::new();
            let streams: Vec<StreamPartition> =
                state.topologies.keys().cloned().collect();
            for stream in streams {
                self.leave_and_check_empty_topology(
                    &mut state,
                    &stream,
                    &node,
                    &mut outgoing,
                );
            }
            outgoing
        };
        self.dispatch_instructions(outgoing);
    }

    /// Ingest one status report. See the struct docs for the single-stream
    /// versus full-report reconciliation semantics.
    fn process_node_status(&self, status: Status, source: NodeId) {
        let outgoing = {
            let mut state = self.state.lock().unwrap();
            let filtered = state.counters.filter_status(&status, &source);

            if let Some(rtts) = &status.rtts {
                state.rtts.insert(source.clone(), rtts.clone());
            }
            let address = self.server.resolve_address(&source);
            state.locations.update_location(
                &source,
                status.location.clone(),
                address,
            );

            for stream in status.streams.keys() {
                if !state.topologies.contains_key(stream) {
                    state.topologies.insert(
                        stream.clone(),
                        self.topology_factory.create(),
                    );
                }
            }
            attach_storage_nodes(&mut state);

            let mut outgoing = Vec::new();
            if !state.storage_nodes.contains(&source) {
                self.update_node(
                    &mut state,
                    &source,
                    &filtered,
                    &status,
                    &mut outgoing,
                );
                let streams: Vec<StreamPartition> =
                    status.streams.keys().cloned().collect();
                self.form_instructions(
                    &mut state,
                    &source,
                    &streams,
                    false,
                    &mut outgoing,
                );
            } else {
                // a storage node participates in every stream
                let streams: Vec<StreamPartition> =
                    state.topologies.keys().cloned().collect();
                self.form_instructions(
                    &mut state,
                    &source,
                    &streams,
                    false,
                    &mut outgoing,
                );
            }
            outgoing
        };
        self.dispatch_instructions(outgoing);
    }

    /// Record a node's self-reported neighbor sets, and for a full report
    /// remove the node from every topology its report no longer mentions.
    fn update_node(
        &self,
        state: &mut TrackerState,
        node: &NodeId,
        filtered: &HashMap<StreamPartition, StreamStatus>,
        status: &Status,
        outgoing: &mut Vec<Outgoing>,
    ) {
        for (stream, stream_status) in filtered {
            let neighbors: BTreeSet<NodeId> = stream_status
                .inbound_nodes
                .iter()
                .chain(stream_status.outbound_nodes.iter())
                .cloned()
                .collect();
            if let Some(topology) = state.topologies.get_mut(stream) {
                topology
                    .update(node.clone(), neighbors.into_iter().collect());
            }
        }

        if !status.single_stream {
            let reported: HashSet<&StreamPartition> =
                status.streams.keys().collect();
            let left: Vec<StreamPartition> = state
                .topologies
                .keys()
                .filter(|stream| !reported.contains(stream))
                .cloned()
                .collect();
            for stream in left {
                self.leave_and_check_empty_topology(
                    state, &stream, node, outgoing,
                );
            }
        }
        tracing::debug!(%node, streams = status.streams.len(), "updated node");
    }

    /// Compute instructions centered on `node` for the given streams and
    /// queue them, each stamped with a fresh per-(target, stream) counter.
    fn form_instructions(
        &self,
        state: &mut TrackerState,
        node: &NodeId,
        streams: &[StreamPartition],
        force: bool,
        outgoing: &mut Vec<Outgoing>,
    ) {
        for stream in streams {
            let Some(topology) = state.topologies.get_mut(stream) else {
                continue;
            };
            for (target, neighbors) in topology.form_instructions(node, force)
            {
                let counter =
                    state.counters.set_or_increment(&target, stream);
                outgoing.push((
                    target,
                    InstructionMessage {
                        request_id: self.next_request_id().into(),
                        stream_id: stream.stream_id().to_string(),
                        stream_partition: stream.partition(),
                        node_ids: neighbors,
                        counter,
                    },
                ));
            }
        }
    }

    /// Remove a node from one topology. An emptied topology is deleted
    /// along with its counters; otherwise the node's former neighbors get
    /// forced fresh instructions.
    fn leave_and_check_empty_topology(
        &self,
        state: &mut TrackerState,
        stream: &StreamPartition,
        node: &NodeId,
        outgoing: &mut Vec<Outgoing>,
    ) {
        let Some(topology) = state.topologies.get_mut(stream) else {
            return;
        };
        if !topology.has_node(node) {
            return;
        }
        let neighbors = topology.leave(node);
        state.counters.remove_node(node);

        if state.topologies.get(stream).is_some_and(|t| t.is_empty()) {
            tracing::debug!(%stream, "topology emptied, deleting");
            state.topologies.remove(stream);
            state.counters.remove_stream(stream);
        } else {
            for neighbor in neighbors {
                self.form_instructions(
                    state,
                    &neighbor,
                    std::slice::from_ref(stream),
                    true,
                    outgoing,
                );
            }
        }
    }

    fn find_storage_nodes(
        &self,
        request: StorageNodesRequest,
        source: NodeId,
    ) {
        let node_ids: Vec<NodeId> = {
            let state = self.state.lock().unwrap();
            state
                .storage_nodes
                .iter()
                .filter(|node| **node != source)
                .cloned()
                .collect()
        };
        let response = StorageNodesResponse {
            stream_id: request.stream_id,
            stream_partition: request.stream_partition,
            node_ids,
        };
        let this = self.to_arc();
        tokio::spawn(async move {
            if let Err(e) = this
                .server
                .send_storage_nodes_response(source.clone(), response)
                .await
            {
                tracing::warn!(
                    %source,
                    "failed to send storage nodes response: {e}"
                );
            }
        });
    }

    fn dispatch_instructions(&self, outgoing: Vec<Outgoing>) {
        for (target, instruction) in outgoing {
            tracing::debug!(
                %target,
                stream = %instruction.stream_partition(),
                counter = instruction.counter,
                neighbors = ?instruction.node_ids,
                "sending instruction"
            );
            let this = self.to_arc();
            tokio::spawn(async move {
                if let Err(e) = this
                    .server
                    .send_instruction(target.clone(), instruction)
                    .await
                {
                    tracing::warn!(
                        %target,
                        "failed to send instruction: {e}"
                    );
                }
            });
        }
    }
}

/// Every known storage node participates in every topology, so resend
/// traffic can always reach one.
fn attach_storage_nodes(state: &mut TrackerState) {
    let storage_nodes: Vec<NodeId> =
        state.storage_nodes.iter().cloned().collect();
    for topology in state.topologies.values_mut() {
        for storage_node in &storage_nodes {
            if !topology.has_node(storage_node) {
                topology.update(storage_node.clone(), Vec::new());
            }
        }
    }
}

/// Routes server endpoint events into the tracker.
struct TrackerServerEvents {
    inner: Weak<TrackerInner>,
}

impl std::fmt::Debug for TrackerServerEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerServerEvents").finish_non_exhaustive()
    }
}

impl TrackerServerHandler for TrackerServerEvents {
    fn on_node_connected(&self, node: NodeId, is_storage: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_node_connected(node, is_storage);
        }
    }

    fn on_node_disconnected(&self, node: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_node_disconnected(node);
        }
    }

    fn on_status(&self, status: Status, source: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.process_node_status(status, source);
        }
    }

    fn on_storage_nodes_request(
        &self,
        request: StorageNodesRequest,
        source: NodeId,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.find_storage_nodes(request, source);
        }
    }
}
