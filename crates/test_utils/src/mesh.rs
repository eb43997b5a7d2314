//! A trivial everyone-with-everyone topology for tests.

use starling_api::topology::{
    DynOverlayTopologyFactory, OverlayTopology, OverlayTopologyFactory,
    TopologyState,
};
use starling_api::NodeId;
use std::collections::{BTreeSet, HashMap};

/// Full-mesh neighbor selection: every node's desired neighbor set is all
/// other nodes. Instructions are formed only for nodes whose desired set
/// changed since the last time they were instructed, which damps the
/// status/instruction feedback loop just like a real selection algorithm.
#[derive(Debug, Default)]
pub struct FullMeshTopology {
    nodes: BTreeSet<NodeId>,
    last_instructed: HashMap<NodeId, Vec<NodeId>>,
}

impl FullMeshTopology {
    fn desired(&self, node: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|other| *other != node)
            .cloned()
            .collect()
    }
}

impl OverlayTopology for FullMeshTopology {
    fn update(&mut self, node: NodeId, _neighbors: Vec<NodeId>) {
        self.nodes.insert(node);
    }

    fn leave(&mut self, node: &NodeId) -> Vec<NodeId> {
        if !self.nodes.remove(node) {
            return Vec::new();
        }
        self.last_instructed.remove(node);
        self.nodes.iter().cloned().collect()
    }

    fn has_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn form_instructions(
        &mut self,
        node: &NodeId,
        force: bool,
    ) -> HashMap<NodeId, Vec<NodeId>> {
        let mut out = HashMap::new();
        for target in self.nodes.clone() {
            let desired = self.desired(&target);
            let changed =
                self.last_instructed.get(&target) != Some(&desired);
            if changed || (force && target == *node) {
                self.last_instructed.insert(target.clone(), desired.clone());
                out.insert(target, desired);
            }
        }
        out
    }

    fn neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        if self.nodes.contains(node) {
            self.desired(node)
        } else {
            Vec::new()
        }
    }

    fn state(&self) -> TopologyState {
        self.nodes
            .iter()
            .map(|node| (node.clone(), self.desired(node)))
            .collect()
    }
}

/// Factory for [FullMeshTopology].
#[derive(Debug)]
pub struct FullMeshTopologyFactory;

impl FullMeshTopologyFactory {
    /// Construct a new FullMeshTopologyFactory.
    pub fn create() -> DynOverlayTopologyFactory {
        std::sync::Arc::new(Self)
    }
}

impl OverlayTopologyFactory for FullMeshTopologyFactory {
    fn create(&self) -> Box<dyn OverlayTopology> {
        Box::<FullMeshTopology>::default()
    }
}
