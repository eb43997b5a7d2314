//! An in-process network wiring node and tracker endpoints together.

use starling_api::protocol::{
    InstructionMessage, NodeMessage, Status, StorageNodesRequest,
    StorageNodesResponse,
};
use starling_api::registry::TrackerInfo;
use starling_api::transport::{
    DisconnectionReason, DynNodeTransport, DynNodeTransportHandler,
    DynTrackerServer, DynTrackerServerHandler, DynTrackerTransport,
    DynTrackerTransportHandler, NodeTransport, TrackerServer,
    TrackerTransport,
};
use starling_api::{BoxFut, NodeId, SlError, SlResult, TrackerId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct NodeEndpoint {
    is_storage: bool,
    node_handler: Option<DynNodeTransportHandler>,
    tracker_handler: Option<DynTrackerTransportHandler>,
    connected_trackers: HashSet<TrackerId>,
    rtts: HashMap<NodeId, u32>,
}

struct TrackerEndpoint {
    id: TrackerId,
    handler: Option<DynTrackerServerHandler>,
    connected_nodes: HashSet<NodeId>,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<NodeId, NodeEndpoint>,
    trackers: HashMap<String, TrackerEndpoint>,
    /// directed pairs, both directions inserted together
    connections: HashSet<(NodeId, NodeId)>,
}

/// An in-process "network" connecting [NodeTransport]/[TrackerTransport]/
/// [TrackerServer] endpoints within one test. Handler callbacks run
/// synchronously on the caller's task, with no lock held.
#[derive(Clone, Default)]
pub struct MemNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemNetwork {
    /// Construct an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its two client-side endpoints.
    pub fn create_node(
        &self,
        id: &str,
        is_storage: bool,
    ) -> (DynNodeTransport, DynTrackerTransport) {
        let node_id = NodeId::from(id);
        self.state.lock().unwrap().nodes.insert(
            node_id.clone(),
            NodeEndpoint {
                is_storage,
                ..Default::default()
            },
        );
        let node_transport = Arc::new(MemNodeTransport {
            node_id: node_id.clone(),
            state: self.state.clone(),
        });
        let tracker_transport = Arc::new(MemTrackerTransport {
            node_id,
            state: self.state.clone(),
        });
        (node_transport, tracker_transport)
    }

    /// Register a tracker, returning its server-side endpoint. The tracker
    /// is reachable at [MemNetwork::tracker_address]`(id)`.
    pub fn create_tracker(&self, id: &str) -> DynTrackerServer {
        let tracker_id = TrackerId::from(id);
        let address = Self::tracker_address(id);
        self.state.lock().unwrap().trackers.insert(
            address.clone(),
            TrackerEndpoint {
                id: tracker_id.clone(),
                handler: None,
                connected_nodes: HashSet::new(),
            },
        );
        Arc::new(MemTrackerServer {
            tracker_id,
            address,
            state: self.state.clone(),
        })
    }

    /// The dialable address of a tracker registered under `id`.
    pub fn tracker_address(id: &str) -> String {
        format!("mem://{id}")
    }

    /// Registry entry for a tracker registered under `id`.
    pub fn tracker_info(id: &str) -> TrackerInfo {
        TrackerInfo {
            id: id.into(),
            address: Self::tracker_address(id),
        }
    }

    /// Seed an RTT measurement reported by `node` about `peer`.
    pub fn set_rtt(&self, node: &str, peer: &str, rtt_ms: u32) {
        if let Some(endpoint) =
            self.state.lock().unwrap().nodes.get_mut(&NodeId::from(node))
        {
            endpoint.rtts.insert(peer.into(), rtt_ms);
        }
    }

    /// Tear a node out of the network: every peer and tracker sees it
    /// disconnect.
    pub fn drop_node(&self, id: &str) {
        let node_id = NodeId::from(id);
        let mut peer_callbacks: Vec<(DynNodeTransportHandler, NodeId)> =
            Vec::new();
        let mut tracker_callbacks: Vec<DynTrackerServerHandler> = Vec::new();
        let mut own_handler: Option<DynNodeTransportHandler> = None;
        let mut own_peers: Vec<NodeId> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let peers: Vec<NodeId> = state
                .connections
                .iter()
                .filter(|(a, _)| *a == node_id)
                .map(|(_, b)| b.clone())
                .collect();
            state
                .connections
                .retain(|(a, b)| *a != node_id && *b != node_id);
            for peer in &peers {
                if let Some(endpoint) = state.nodes.get(peer) {
                    if let Some(handler) = &endpoint.node_handler {
                        peer_callbacks.push((handler.clone(), node_id.clone()));
                    }
                }
            }
            for tracker in state.trackers.values_mut() {
                if tracker.connected_nodes.remove(&node_id) {
                    if let Some(handler) = &tracker.handler {
                        tracker_callbacks.push(handler.clone());
                    }
                }
            }
            if let Some(endpoint) = state.nodes.get_mut(&node_id) {
                endpoint.connected_trackers.clear();
                own_handler = endpoint.node_handler.clone();
                own_peers = peers;
            }
        }
        for (handler, node) in peer_callbacks {
            handler.on_node_disconnected(node);
        }
        for handler in tracker_callbacks {
            handler.on_node_disconnected(node_id.clone());
        }
        if let Some(handler) = own_handler {
            for peer in own_peers {
                handler.on_node_disconnected(peer);
            }
        }
    }

    /// Whether a node ↔ node connection currently exists.
    pub fn are_connected(&self, a: &str, b: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .connections
            .contains(&(a.into(), b.into()))
    }
}

struct MemNodeTransport {
    node_id: NodeId,
    state: Arc<Mutex<NetState>>,
}

impl std::fmt::Debug for MemNodeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNodeTransport")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl NodeTransport for MemNodeTransport {
    fn local_node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn register_handler(&self, handler: DynNodeTransportHandler) {
        let mut state = self.state.lock().unwrap();
        let endpoint = state
            .nodes
            .get_mut(&self.node_id)
            .expect("node endpoint registered");
        if endpoint.node_handler.replace(handler).is_some() {
            panic!(
                "attempted to register duplicate node handler: {}",
                self.node_id
            );
        }
    }

    fn connect_to_node(
        &self,
        node: NodeId,
        _via: TrackerId,
    ) -> BoxFut<'_, SlResult<NodeId>> {
        Box::pin(async move {
            let callbacks = {
                let mut state = self.state.lock().unwrap();
                if !state.nodes.contains_key(&node) {
                    return Err(SlError::other(format!(
                        "no such node: {node}"
                    )));
                }
                if state
                    .connections
                    .contains(&(self.node_id.clone(), node.clone()))
                {
                    None
                } else {
                    state
                        .connections
                        .insert((self.node_id.clone(), node.clone()));
                    state
                        .connections
                        .insert((node.clone(), self.node_id.clone()));
                    let local = state
                        .nodes
                        .get(&self.node_id)
                        .and_then(|e| e.node_handler.clone());
                    let remote = state
                        .nodes
                        .get(&node)
                        .and_then(|e| e.node_handler.clone());
                    Some((local, remote))
                }
            };
            if let Some((local, remote)) = callbacks {
                if let Some(handler) = local {
                    handler.on_node_connected(node.clone());
                }
                if let Some(handler) = remote {
                    handler.on_node_connected(self.node_id.clone());
                }
            }
            Ok(node)
        })
    }

    fn disconnect_from_node(
        &self,
        node: NodeId,
        reason: DisconnectionReason,
    ) -> BoxFut<'_, ()> {
        Box::pin(async move {
            tracing::trace!(from = %self.node_id, to = %node, %reason, "disconnect");
            let callbacks = {
                let mut state = self.state.lock().unwrap();
                let was_connected = state
                    .connections
                    .remove(&(self.node_id.clone(), node.clone()));
                state.connections.remove(&(node.clone(), self.node_id.clone()));
                if was_connected {
                    let local = state
                        .nodes
                        .get(&self.node_id)
                        .and_then(|e| e.node_handler.clone());
                    let remote = state
                        .nodes
                        .get(&node)
                        .and_then(|e| e.node_handler.clone());
                    Some((local, remote))
                } else {
                    None
                }
            };
            if let Some((local, remote)) = callbacks {
                if let Some(handler) = local {
                    handler.on_node_disconnected(node.clone());
                }
                if let Some(handler) = remote {
                    handler.on_node_disconnected(self.node_id.clone());
                }
            }
        })
    }

    fn send(
        &self,
        to: NodeId,
        message: NodeMessage,
    ) -> BoxFut<'_, SlResult<()>> {
        Box::pin(async move {
            let handler = {
                let state = self.state.lock().unwrap();
                if !state
                    .connections
                    .contains(&(self.node_id.clone(), to.clone()))
                {
                    return Err(SlError::other(format!(
                        "not connected to {to}"
                    )));
                }
                state.nodes.get(&to).and_then(|e| e.node_handler.clone())
            };
            match handler {
                Some(handler) => {
                    handler.on_message(message, self.node_id.clone());
                    Ok(())
                }
                None => Err(SlError::other(format!(
                    "no handler registered on {to}"
                ))),
            }
        })
    }

    fn rtts(&self) -> HashMap<NodeId, u32> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(&self.node_id)
            .map(|e| e.rtts.clone())
            .unwrap_or_default()
    }
}

struct MemTrackerTransport {
    node_id: NodeId,
    state: Arc<Mutex<NetState>>,
}

impl std::fmt::Debug for MemTrackerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTrackerTransport")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl TrackerTransport for MemTrackerTransport {
    fn register_handler(&self, handler: DynTrackerTransportHandler) {
        let mut state = self.state.lock().unwrap();
        let endpoint = state
            .nodes
            .get_mut(&self.node_id)
            .expect("node endpoint registered");
        if endpoint.tracker_handler.replace(handler).is_some() {
            panic!(
                "attempted to register duplicate tracker handler: {}",
                self.node_id
            );
        }
    }

    fn connect_to_tracker(
        &self,
        address: &str,
    ) -> BoxFut<'_, SlResult<TrackerId>> {
        let address = address.to_string();
        Box::pin(async move {
            let (tracker_id, callbacks) = {
                let mut state = self.state.lock().unwrap();
                let Some(tracker) = state.trackers.get_mut(&address) else {
                    return Err(SlError::other(format!(
                        "no tracker at {address}"
                    )));
                };
                let tracker_id = tracker.id.clone();
                let fresh = tracker.connected_nodes.insert(self.node_id.clone());
                let tracker_handler = tracker.handler.clone();
                let endpoint = state
                    .nodes
                    .get_mut(&self.node_id)
                    .expect("node endpoint registered");
                endpoint.connected_trackers.insert(tracker_id.clone());
                let callbacks = fresh.then(|| {
                    (
                        tracker_handler,
                        endpoint.tracker_handler.clone(),
                        endpoint.is_storage,
                    )
                });
                (tracker_id, callbacks)
            };
            if let Some((tracker_handler, node_handler, is_storage)) =
                callbacks
            {
                if let Some(handler) = tracker_handler {
                    handler.on_node_connected(self.node_id.clone(), is_storage);
                }
                if let Some(handler) = node_handler {
                    handler.on_tracker_connected(tracker_id.clone());
                }
            }
            Ok(tracker_id)
        })
    }

    fn send_status(
        &self,
        tracker: TrackerId,
        status: Status,
    ) -> BoxFut<'_, SlResult<()>> {
        Box::pin(async move {
            let handler = self.tracker_handler_if_connected(&tracker)?;
            handler.on_status(status, self.node_id.clone());
            Ok(())
        })
    }

    fn send_storage_nodes_request(
        &self,
        tracker: TrackerId,
        request: StorageNodesRequest,
    ) -> BoxFut<'_, SlResult<()>> {
        Box::pin(async move {
            let handler = self.tracker_handler_if_connected(&tracker)?;
            handler.on_storage_nodes_request(request, self.node_id.clone());
            Ok(())
        })
    }
}

impl MemTrackerTransport {
    fn tracker_handler_if_connected(
        &self,
        tracker: &TrackerId,
    ) -> SlResult<DynTrackerServerHandler> {
        let state = self.state.lock().unwrap();
        let connected = state
            .nodes
            .get(&self.node_id)
            .map(|e| e.connected_trackers.contains(tracker))
            .unwrap_or(false);
        if !connected {
            return Err(SlError::other(format!(
                "not connected to tracker {tracker}"
            )));
        }
        state
            .trackers
            .values()
            .find(|t| t.id == *tracker)
            .and_then(|t| t.handler.clone())
            .ok_or_else(|| {
                SlError::other(format!("no handler on tracker {tracker}"))
            })
    }
}

struct MemTrackerServer {
    tracker_id: TrackerId,
    address: String,
    state: Arc<Mutex<NetState>>,
}

impl std::fmt::Debug for MemTrackerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTrackerServer")
            .field("tracker_id", &self.tracker_id)
            .finish_non_exhaustive()
    }
}

impl MemTrackerServer {
    fn node_tracker_handler(
        &self,
        node: &NodeId,
    ) -> SlResult<DynTrackerTransportHandler> {
        let state = self.state.lock().unwrap();
        let endpoint = state
            .nodes
            .get(node)
            .ok_or_else(|| SlError::other(format!("no such node: {node}")))?;
        if !endpoint.connected_trackers.contains(&self.tracker_id) {
            return Err(SlError::other(format!(
                "{node} is not connected to tracker {}",
                self.tracker_id
            )));
        }
        endpoint.tracker_handler.clone().ok_or_else(|| {
            SlError::other(format!("no handler registered on {node}"))
        })
    }
}

impl TrackerServer for MemTrackerServer {
    fn register_handler(&self, handler: DynTrackerServerHandler) {
        let mut state = self.state.lock().unwrap();
        let tracker = state
            .trackers
            .get_mut(&self.address)
            .expect("tracker endpoint registered");
        if tracker.handler.replace(handler).is_some() {
            panic!(
                "attempted to register duplicate tracker server handler: {}",
                self.tracker_id
            );
        }
    }

    fn send_instruction(
        &self,
        node: NodeId,
        instruction: InstructionMessage,
    ) -> BoxFut<'_, SlResult<()>> {
        Box::pin(async move {
            let handler = self.node_tracker_handler(&node)?;
            handler.on_instruction(instruction, self.tracker_id.clone());
            Ok(())
        })
    }

    fn send_storage_nodes_response(
        &self,
        node: NodeId,
        response: StorageNodesResponse,
    ) -> BoxFut<'_, SlResult<()>> {
        Box::pin(async move {
            let handler = self.node_tracker_handler(&node)?;
            handler.on_storage_nodes_response(
                response,
                self.tracker_id.clone(),
            );
            Ok(())
        })
    }

    fn resolve_address(&self, node: &NodeId) -> Option<String> {
        Some(format!("mem://{node}"))
    }
}
