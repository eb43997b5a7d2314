//! Stream message identity types.

use crate::StreamPartition;
use std::sync::Arc;

/// A `(timestamp, sequenceNumber)` pair locating a message within one
/// publisher's message chain. Ordered lexicographically, timestamp first.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    /// Milliseconds since the unix epoch, assigned by the publisher.
    pub timestamp: i64,
    /// Disambiguates messages sharing a timestamp.
    pub sequence_number: u32,
}

impl MessageRef {
    /// Construct a new MessageRef.
    pub fn new(timestamp: i64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.timestamp, self.sequence_number)
    }
}

impl std::fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Globally identifies one message: which stream-partition it belongs to,
/// where it sits in its publisher's chain, and who published it.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct MessageId {
    /// The stream this message was published to.
    pub stream_id: Arc<str>,
    /// The partition within the stream.
    pub stream_partition: u32,
    /// Publisher-assigned timestamp.
    pub timestamp: i64,
    /// Publisher-assigned sequence number within the timestamp.
    pub sequence_number: u32,
    /// The publisher of the message.
    pub publisher_id: Arc<str>,
    /// The message chain, scoping ordering per publisher session.
    pub msg_chain_id: Arc<str>,
}

impl MessageId {
    /// The stream-partition this message belongs to.
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.clone(), self.stream_partition)
    }

    /// The chain-relative position of this message.
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }
}

/// A data message as gossiped between nodes.
///
/// `prev_msg_ref` links the message to its predecessor in the same
/// publisher/chain, letting receivers detect duplicates and gaps without
/// any coordination. It is absent for the first message of a chain and for
/// publishers that do not track their own history.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    /// The identity of this message.
    pub message_id: MessageId,
    /// Reference to the previous message in the chain, if any.
    pub prev_msg_ref: Option<MessageRef>,
    /// Opaque message content.
    #[serde(with = "crate::serde_bytes_base64")]
    pub payload: bytes::Bytes,
}
