#![deny(missing_docs)]
//! The tracker side of the starling pub/sub overlay network.
//!
//! A tracker coordinates the gossip mesh: nodes report their per-stream
//! neighbor view, the tracker feeds it through one [OverlayTopology]
//! object per stream-partition, and every node whose desired neighbor set
//! changed gets a counter-stamped instruction back. See [Tracker].
//!
//! [OverlayTopology]: starling_api::topology::OverlayTopology

pub mod counter;
pub mod location;

mod tracker;
pub use tracker::{Tracker, TrackerOptions};
