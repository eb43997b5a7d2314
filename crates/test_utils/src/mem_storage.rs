//! A Vec-backed storage implementation for tests.

use futures::StreamExt;
use starling_api::storage::{MessageStream, Storage};
use starling_api::{
    BoxFut, MessageRef, SlResult, StreamMessage, StreamPartition,
};
use std::sync::{Arc, Mutex};

/// Keeps everything in memory, answering queries in ascending
/// (timestamp, sequence number) order the way a real store would.
#[derive(Debug, Default)]
pub struct MemStorage {
    messages: Mutex<Vec<StreamMessage>>,
}

impl MemStorage {
    /// Construct an empty store.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a message directly, bypassing the async [Storage::store].
    pub fn insert(&self, message: StreamMessage) {
        self.messages.lock().unwrap().push(message);
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }

    fn select(
        &self,
        stream: &StreamPartition,
        filter: impl Fn(&StreamMessage) -> bool,
    ) -> Vec<StreamMessage> {
        let mut selected: Vec<StreamMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.message_id.stream_partition() == *stream)
            .filter(|m| filter(m))
            .cloned()
            .collect();
        selected.sort_by_key(|m| m.message_id.message_ref());
        selected
    }
}

impl Storage for MemStorage {
    fn request_last(
        &self,
        stream: &StreamPartition,
        count: u64,
    ) -> MessageStream {
        let mut selected = self.select(stream, |_| true);
        let skip = selected.len().saturating_sub(count as usize);
        selected.drain(..skip);
        futures::stream::iter(selected.into_iter().map(Ok)).boxed()
    }

    fn request_from(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        publisher_id: Option<&str>,
    ) -> MessageStream {
        let selected = self.select(stream, |m| {
            m.message_id.message_ref() >= from
                && publisher_id
                    .map(|p| &*m.message_id.publisher_id == p)
                    .unwrap_or(true)
        });
        futures::stream::iter(selected.into_iter().map(Ok)).boxed()
    }

    fn request_range(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        to: MessageRef,
        publisher_id: &str,
        msg_chain_id: &str,
    ) -> MessageStream {
        let selected = self.select(stream, |m| {
            let message_ref = m.message_id.message_ref();
            message_ref >= from
                && message_ref <= to
                && &*m.message_id.publisher_id == publisher_id
                && &*m.message_id.msg_chain_id == msg_chain_id
        });
        futures::stream::iter(selected.into_iter().map(Ok)).boxed()
    }

    fn store(&self, message: StreamMessage) -> BoxFut<'_, SlResult<()>> {
        self.insert(message);
        Box::pin(async { Ok(()) })
    }
}
