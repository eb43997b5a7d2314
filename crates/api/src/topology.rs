//! Starling overlay topology traits.
//!
//! One topology object tracks which nodes gossip with which for a single
//! stream-partition. The concrete neighbor-selection algorithm (how many
//! neighbors, who gets paired with whom) is the implementer's choice; the
//! tracker only drives the interface.

use crate::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Full topology state: every node mapped to its current neighbor set.
pub type TopologyState = HashMap<NodeId, Vec<NodeId>>;

/// The tracker's view of one stream-partition's gossip mesh.
pub trait OverlayTopology: 'static + Send + std::fmt::Debug {
    /// Record a node's self-reported neighbor set, adding the node if it is
    /// new to the topology.
    fn update(&mut self, node: NodeId, neighbors: Vec<NodeId>);

    /// Remove a node, returning the neighbors it was connected to (the
    /// nodes whose neighbor sets the departure invalidated).
    fn leave(&mut self, node: &NodeId) -> Vec<NodeId>;

    /// Whether the node participates in this topology.
    fn has_node(&self, node: &NodeId) -> bool;

    /// Whether no node participates anymore.
    fn is_empty(&self) -> bool;

    /// Compute desired neighbor sets after a change centered on `node`,
    /// addressed to every node whose desired set changed since it was last
    /// instructed. With `force`, `node`'s own instruction is included even
    /// if unchanged.
    fn form_instructions(
        &mut self,
        node: &NodeId,
        force: bool,
    ) -> HashMap<NodeId, Vec<NodeId>>;

    /// The current neighbors of a node.
    fn neighbors(&self, node: &NodeId) -> Vec<NodeId>;

    /// A snapshot of the whole mesh.
    fn state(&self) -> TopologyState;
}

/// A factory constructing one [OverlayTopology] per stream-partition.
pub trait OverlayTopologyFactory:
    'static + Send + Sync + std::fmt::Debug
{
    /// Construct a topology for a newly seen stream-partition.
    fn create(&self) -> Box<dyn OverlayTopology>;
}

/// Trait-object [OverlayTopologyFactory].
pub type DynOverlayTopologyFactory = Arc<dyn OverlayTopologyFactory>;
