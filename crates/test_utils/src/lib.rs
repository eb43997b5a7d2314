#![deny(missing_docs)]
//! In-process starling testing modules.
//!
//! These are NOT production modules. [MemNetwork] only "connects" endpoints
//! within the same process, [MemStorage] keeps messages in a Vec, and
//! [FullMeshTopology] pairs everyone with everyone. Together they let node
//! and tracker logic run end-to-end in a plain tokio test.

mod mem_network;
pub use mem_network::MemNetwork;

/// Install a process-wide tracing subscriber honoring `RUST_LOG`, once.
/// Call at the top of integration tests that want log output.
pub fn enable_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env(),
            )
            .with_test_writer()
            .init();
    });
}

mod mem_storage;
pub use mem_storage::MemStorage;

mod mesh;
pub use mesh::{FullMeshTopology, FullMeshTopologyFactory};
