//! Typed node events.
//!
//! Everything observable about a running node flows through one bounded
//! channel of these; when nobody is listening, or the listener lags, events
//! are dropped rather than blocking the node.

use starling_api::protocol::ResendRequest;
use starling_api::{MessageId, NodeId, StreamMessage, StreamPartition};

/// Something a [Node](crate::Node) did or observed.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer connection was established.
    NodeConnected {
        /// The peer.
        node: NodeId,
    },
    /// A peer connection went away.
    NodeDisconnected {
        /// The peer.
        node: NodeId,
    },
    /// A data message arrived (duplicate or not).
    MessageReceived {
        /// The message.
        message: StreamMessage,
        /// Where it came from; None when locally published.
        source: Option<NodeId>,
    },
    /// A data message passed the duplicate check.
    UnseenMessageReceived {
        /// The message.
        message: StreamMessage,
        /// Where it came from; None when locally published.
        source: Option<NodeId>,
    },
    /// A data message was dropped as a duplicate.
    DuplicateMessageReceived {
        /// The duplicate's identity.
        message_id: MessageId,
        /// Where it came from.
        source: Option<NodeId>,
    },
    /// A data message was forwarded to at least one neighbor.
    MessagePropagated {
        /// The propagated message's identity.
        message_id: MessageId,
    },
    /// Forwarding to one neighbor failed.
    MessagePropagationFailed {
        /// The affected message.
        message_id: MessageId,
        /// The neighbor that could not be reached.
        node: NodeId,
    },
    /// A neighbor was added to a stream.
    NodeSubscribed {
        /// The neighbor.
        node: NodeId,
        /// The stream.
        stream: StreamPartition,
    },
    /// A neighbor was removed from a stream.
    NodeUnsubscribed {
        /// The neighbor.
        node: NodeId,
        /// The stream.
        stream: StreamPartition,
    },
    /// A resend request arrived.
    ResendRequestReceived {
        /// The request.
        request: ResendRequest,
        /// The requesting peer; None when locally originated.
        source: Option<NodeId>,
    },
}
