//! Starling transport related traits.
//!
//! The physical layer (connection establishment, keepalive, back-pressure
//! measurement, byte encoding) is implemented by the embedder; these traits
//! only fix the contract the node and tracker state machines drive it
//! through. All sends are fire-and-forget: a returned `Ok(())` means the
//! message was handed to the transport backend, not that the remote peer
//! received it.

use crate::protocol::*;
use crate::{BoxFut, NodeId, SlResult, TrackerId};
use std::collections::HashMap;
use std::sync::Arc;

/// Why a connection is being closed, communicated to the remote peer on a
/// best-effort basis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectionReason {
    /// No stream is shared with the peer anymore.
    NoSharedStreams,
    /// A temporary resend connection is no longer needed.
    ResendDone,
    /// The peer kept failing to accept deliveries.
    DeadConnection,
    /// Local shutdown.
    GracefulShutdown,
}

impl std::fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSharedStreams => f.write_str("no shared streams"),
            Self::ResendDone => f.write_str("resend done"),
            Self::DeadConnection => f.write_str("dead connection"),
            Self::GracefulShutdown => f.write_str("graceful shutdown"),
        }
    }
}

/// The node ↔ node endpoint.
pub trait NodeTransport: 'static + Send + Sync + std::fmt::Debug {
    /// The id the transport layer assigned to this node.
    fn local_node_id(&self) -> NodeId;

    /// Register the single handler for incoming node events.
    ///
    /// Panics if a handler is already registered.
    fn register_handler(&self, handler: DynNodeTransportHandler);

    /// Open a connection to a peer, using the given tracker for signalling.
    /// Returns the id of the connected peer. Callers bound the wait with
    /// their own timeout; timing out abandons the attempt.
    fn connect_to_node(
        &self,
        node: NodeId,
        via: TrackerId,
    ) -> BoxFut<'_, SlResult<NodeId>>;

    /// Close any connection to the peer, telling it why on a best effort.
    fn disconnect_from_node(
        &self,
        node: NodeId,
        reason: DisconnectionReason,
    ) -> BoxFut<'_, ()>;

    /// Send a message to a connected peer.
    fn send(&self, to: NodeId, message: NodeMessage)
        -> BoxFut<'_, SlResult<()>>;

    /// Latest round-trip time measurements per connected peer, in ms.
    fn rtts(&self) -> HashMap<NodeId, u32>;
}

/// Trait-object [NodeTransport].
pub type DynNodeTransport = Arc<dyn NodeTransport>;

/// Handler for node ↔ node transport events.
pub trait NodeTransportHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A peer connected (either side initiated).
    fn on_node_connected(&self, node: NodeId) {
        drop(node);
    }

    /// A peer disconnected.
    fn on_node_disconnected(&self, node: NodeId) {
        drop(node);
    }

    /// A message arrived from a connected peer.
    fn on_message(&self, message: NodeMessage, source: NodeId);

    /// The send buffer towards a peer filled up.
    fn on_back_pressure_high(&self, node: NodeId) {
        drop(node);
    }

    /// The send buffer towards a peer drained again.
    fn on_back_pressure_low(&self, node: NodeId) {
        drop(node);
    }
}

/// Trait-object [NodeTransportHandler].
pub type DynNodeTransportHandler = Arc<dyn NodeTransportHandler>;

/// The node → tracker endpoint.
pub trait TrackerTransport: 'static + Send + Sync + std::fmt::Debug {
    /// Register the single handler for incoming tracker events.
    ///
    /// Panics if a handler is already registered.
    fn register_handler(&self, handler: DynTrackerTransportHandler);

    /// Connect to a tracker at the given address, returning its id.
    /// Connecting to an already-connected tracker is a cheap no-op that
    /// returns the known id.
    fn connect_to_tracker(&self, address: &str)
        -> BoxFut<'_, SlResult<TrackerId>>;

    /// Report status to a connected tracker.
    fn send_status(
        &self,
        tracker: TrackerId,
        status: Status,
    ) -> BoxFut<'_, SlResult<()>>;

    /// Ask a connected tracker for storage nodes.
    fn send_storage_nodes_request(
        &self,
        tracker: TrackerId,
        request: StorageNodesRequest,
    ) -> BoxFut<'_, SlResult<()>>;
}

/// Trait-object [TrackerTransport].
pub type DynTrackerTransport = Arc<dyn TrackerTransport>;

/// Handler for node → tracker transport events.
pub trait TrackerTransportHandler:
    'static + Send + Sync + std::fmt::Debug
{
    /// A tracker connection was established.
    fn on_tracker_connected(&self, tracker: TrackerId) {
        drop(tracker);
    }

    /// A tracker connection was lost.
    fn on_tracker_disconnected(&self, tracker: TrackerId) {
        drop(tracker);
    }

    /// The tracker issued an instruction.
    fn on_instruction(&self, instruction: InstructionMessage, tracker: TrackerId);

    /// The tracker answered a storage nodes request.
    fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        drop((response, tracker));
    }
}

/// Trait-object [TrackerTransportHandler].
pub type DynTrackerTransportHandler = Arc<dyn TrackerTransportHandler>;

/// The tracker-side endpoint serving node connections.
pub trait TrackerServer: 'static + Send + Sync + std::fmt::Debug {
    /// Register the single handler for incoming node events.
    ///
    /// Panics if a handler is already registered.
    fn register_handler(&self, handler: DynTrackerServerHandler);

    /// Send an instruction to a connected node.
    fn send_instruction(
        &self,
        node: NodeId,
        instruction: InstructionMessage,
    ) -> BoxFut<'_, SlResult<()>>;

    /// Answer a storage nodes request.
    fn send_storage_nodes_response(
        &self,
        node: NodeId,
        response: StorageNodesResponse,
    ) -> BoxFut<'_, SlResult<()>>;

    /// The network address a node connected from, if known. Used for
    /// address-derived location fallback.
    fn resolve_address(&self, node: &NodeId) -> Option<String>;
}

/// Trait-object [TrackerServer].
pub type DynTrackerServer = Arc<dyn TrackerServer>;

/// Handler for tracker-side node events.
pub trait TrackerServerHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A node connected to this tracker.
    fn on_node_connected(&self, node: NodeId, is_storage: bool) {
        drop((node, is_storage));
    }

    /// A node disconnected from this tracker.
    fn on_node_disconnected(&self, node: NodeId) {
        drop(node);
    }

    /// A node reported status.
    fn on_status(&self, status: Status, source: NodeId);

    /// A node asked for storage nodes.
    fn on_storage_nodes_request(
        &self,
        request: StorageNodesRequest,
        source: NodeId,
    ) {
        drop((request, source));
    }
}

/// Trait-object [TrackerServerHandler].
pub type DynTrackerServerHandler = Arc<dyn TrackerServerHandler>;
