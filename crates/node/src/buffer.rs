//! Holding areas for messages that could not be propagated yet.

use starling_api::{MessageId, NodeId, StreamMessage, StreamPartition};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A message parked because its stream had no eligible outbound neighbor,
/// together with where it came from.
type BufferedMessage = (StreamMessage, Option<NodeId>);

#[derive(Debug)]
struct BufferedEntry {
    message: BufferedMessage,
    buffered_at: Instant,
}

/// Per-stream bounded buffer of undeliverable messages.
///
/// Entries expire by age and by per-stream count; expiry is enforced on
/// every access and by the owner's periodic sweep. Dropped entries are
/// logged, they are a normal consequence of having no neighbors yet.
#[derive(Debug)]
pub struct MessageBuffer {
    timeout: Duration,
    max_size: usize,
    buffer: HashMap<StreamPartition, VecDeque<BufferedEntry>>,
}

impl MessageBuffer {
    /// Construct a buffer holding up to `max_size` messages per stream for
    /// at most `timeout`.
    pub fn new(timeout: Duration, max_size: usize) -> Self {
        Self {
            timeout,
            max_size,
            buffer: HashMap::new(),
        }
    }

    /// Park a message for its stream, evicting the oldest entry if full.
    pub fn put(
        &mut self,
        stream: StreamPartition,
        message: StreamMessage,
        source: Option<NodeId>,
    ) {
        let entries = self.buffer.entry(stream.clone()).or_default();
        if entries.len() >= self.max_size {
            entries.pop_front();
            tracing::debug!(%stream, "message buffer full, dropped oldest entry");
        }
        entries.push_back(BufferedEntry {
            message: (message, source),
            buffered_at: Instant::now(),
        });
    }

    /// Take every still-fresh message buffered for a stream.
    pub fn pop_all(&mut self, stream: &StreamPartition) -> Vec<BufferedMessage> {
        let now = Instant::now();
        match self.buffer.remove(stream) {
            Some(entries) => entries
                .into_iter()
                .filter(|e| now.duration_since(e.buffered_at) < self.timeout)
                .map(|e| e.message)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop expired entries across all streams.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let timeout = self.timeout;
        self.buffer.retain(|stream, entries| {
            let before = entries.len();
            entries.retain(|e| now.duration_since(e.buffered_at) < timeout);
            if entries.len() < before {
                tracing::debug!(
                    %stream,
                    dropped = before - entries.len(),
                    "failed to deliver buffered messages of stream"
                );
            }
            !entries.is_empty()
        });
    }

    /// Total buffered message count.
    pub fn size(&self) -> usize {
        self.buffer.values().map(VecDeque::len).sum()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Remembers messages that passed the duplicate check but found no outbound
/// neighbor, so a redelivery can still be propagated once one appears.
/// Size-bounded, oldest first out.
#[derive(Debug)]
pub struct SeenButNotPropagatedSet {
    max_size: usize,
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl SeenButNotPropagatedSet {
    /// Construct a set bounded to `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember a message as seen-but-not-propagated.
    pub fn add(&mut self, message_id: &MessageId) {
        if self.set.insert(message_id.clone()) {
            self.order.push_back(message_id.clone());
            while self.order.len() > self.max_size {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }

    /// Whether the message is pending propagation.
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.set.contains(message_id)
    }

    /// Forget a message, typically because it was finally propagated.
    pub fn remove(&mut self, message_id: &MessageId) {
        if self.set.remove(message_id) {
            self.order.retain(|id| id != message_id);
        }
    }

    /// Current entry count.
    pub fn size(&self) -> usize {
        self.set.len()
    }
}
