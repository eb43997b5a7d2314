//! Starling storage related traits.
//!
//! Query execution and persistence durability live behind these traits;
//! the node only translates resend requests into queries and streams the
//! results back out.

use crate::{
    BoxFut, MessageRef, SlResult, StreamMessage, StreamPartition,
};
use std::sync::Arc;

/// A stream of historical messages in ascending chain order.
///
/// Dropping the stream cancels the underlying query.
pub type MessageStream =
    futures::stream::BoxStream<'static, SlResult<StreamMessage>>;

/// Access to a local message store.
pub trait Storage: 'static + Send + Sync + std::fmt::Debug {
    /// Fetch the last `count` messages of a stream-partition, ascending.
    fn request_last(
        &self,
        stream: &StreamPartition,
        count: u64,
    ) -> MessageStream;

    /// Fetch all messages at or after `from`, optionally restricted to one
    /// publisher.
    fn request_from(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        publisher_id: Option<&str>,
    ) -> MessageStream;

    /// Fetch one publisher chain's messages between `from` and `to`,
    /// inclusive.
    #[allow(clippy::too_many_arguments)]
    fn request_range(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        to: MessageRef,
        publisher_id: &str,
        msg_chain_id: &str,
    ) -> MessageStream;

    /// Persist a message.
    fn store(&self, message: StreamMessage) -> BoxFut<'_, SlResult<()>>;
}

/// Trait-object [Storage].
pub type DynStorage = Arc<dyn Storage>;

/// The set of streams a storage node is assigned to persist, with change
/// notifications driving automatic subscribe/unsubscribe.
pub trait StorageConfig: 'static + Send + Sync + std::fmt::Debug {
    /// The currently assigned streams.
    fn streams(&self) -> Vec<StreamPartition>;

    /// Register a listener for assignment changes.
    fn register_listener(&self, listener: DynStorageConfigListener);
}

/// Trait-object [StorageConfig].
pub type DynStorageConfig = Arc<dyn StorageConfig>;

/// Listener for storage assignment changes.
pub trait StorageConfigListener: 'static + Send + Sync + std::fmt::Debug {
    /// A stream was assigned to this storage node.
    fn on_stream_added(&self, stream: StreamPartition);

    /// A stream was unassigned from this storage node.
    fn on_stream_removed(&self, stream: StreamPartition);
}

/// Trait-object [StorageConfigListener].
pub type DynStorageConfigListener = Arc<dyn StorageConfigListener>;
