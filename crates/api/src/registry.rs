//! Starling tracker registry traits.
//!
//! Every stream-partition is the responsibility of exactly one tracker,
//! chosen deterministically so all nodes agree without coordination.

use crate::{StreamPartition, TrackerId};
use std::sync::Arc;

/// A tracker's identity and dialable address.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerInfo {
    /// The tracker's id.
    pub id: TrackerId,
    /// Where to reach it.
    pub address: String,
}

/// Deterministic mapping from stream-partition to responsible tracker.
pub trait TrackerRegistry: 'static + Send + Sync + std::fmt::Debug {
    /// The tracker responsible for a stream-partition.
    fn tracker_for(&self, stream: &StreamPartition) -> TrackerInfo;

    /// Every tracker in the registry.
    fn all_trackers(&self) -> Vec<TrackerInfo>;
}

/// Trait-object [TrackerRegistry].
pub type DynTrackerRegistry = Arc<dyn TrackerRegistry>;

/// The default registry: hashes the stream key onto a fixed tracker list.
///
/// The hash is a plain FNV-1a over the key bytes, stable across processes
/// so every participant derives the same assignment.
#[derive(Debug)]
pub struct DefaultTrackerRegistry {
    trackers: Vec<TrackerInfo>,
}

impl DefaultTrackerRegistry {
    /// Construct a registry over a non-empty tracker list.
    pub fn create(trackers: Vec<TrackerInfo>) -> crate::SlResult<DynTrackerRegistry> {
        if trackers.is_empty() {
            return Err(crate::SlError::other("no trackers given"));
        }
        Ok(Arc::new(Self { trackers }))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl TrackerRegistry for DefaultTrackerRegistry {
    fn tracker_for(&self, stream: &StreamPartition) -> TrackerInfo {
        let index = fnv1a(stream.key().as_bytes()) as usize % self.trackers.len();
        self.trackers[index].clone()
    }

    fn all_trackers(&self) -> Vec<TrackerInfo> {
        self.trackers.clone()
    }
}
