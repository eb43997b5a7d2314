//! Starling wire protocol shapes.
//!
//! These types define the field sets exchanged between nodes and trackers.
//! Byte-level encoding is the transport implementation's concern; everything
//! here is serde-derived so a transport can pick whatever codec it likes.

use crate::{MessageRef, NodeId, RequestId, StreamMessage, StreamPartition};
use std::collections::HashMap;

/// A node's view of one stream it is subscribed to, as reported to the
/// tracker responsible for that stream.
#[derive(
    Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    /// Neighbors the node receives the stream from.
    pub inbound_nodes: Vec<NodeId>,
    /// Neighbors the node forwards the stream to.
    pub outbound_nodes: Vec<NodeId>,
    /// The counter of the last tracker instruction applied to this stream.
    pub counter: u64,
}

/// Geographic location of a node, self-reported or derived from its address.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
    /// ISO country code.
    pub country: Option<String>,
    /// City name.
    pub city: Option<String>,
}

impl Location {
    /// True if any location component is present.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_some()
            || self.longitude.is_some()
            || self.country.is_some()
            || self.city.is_some()
    }
}

/// A status report, sent node → tracker.
///
/// When `single_stream` is set, `streams` holds exactly the one stream the
/// report is about and the tracker must not treat missing streams as left.
/// A full report (the default) is authoritative: any stream the tracker
/// knows the node by that is absent here means the node has left it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// The node's per-stream neighbor view, keyed by stream key.
    pub streams: HashMap<StreamPartition, StreamStatus>,
    /// Round-trip times to connected peers, attached periodically.
    pub rtts: Option<HashMap<NodeId, u32>>,
    /// Self-reported location, if the node knows it.
    pub location: Option<Location>,
    /// When the node started, as an opaque human-readable string.
    pub started: String,
    /// Whether this report covers a single stream only.
    #[serde(default)]
    pub single_stream: bool,
}

/// A tracker-issued desired neighbor set for one node on one stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionMessage {
    /// Correlates the instruction with status reports it provokes.
    pub request_id: RequestId,
    /// The stream the instruction is about.
    pub stream_id: String,
    /// The partition within the stream.
    pub stream_partition: u32,
    /// The neighbors the node should be connected to, and nothing else.
    pub node_ids: Vec<NodeId>,
    /// Monotonically increasing per (node, stream); stale status filtering
    /// keys off this.
    pub counter: u64,
}

impl InstructionMessage {
    /// The stream-partition this instruction addresses.
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.as_str(), self.stream_partition)
    }
}

/// A request for historical stream data.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResendRequest {
    /// Request the last `number_last` messages of a stream-partition.
    #[serde(rename_all = "camelCase")]
    ResendLastRequest {
        /// Correlates response messages with this request.
        request_id: RequestId,
        /// The stream to resend from.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
        /// How many trailing messages to resend.
        number_last: u64,
    },
    /// Request all messages from a chain position onward.
    #[serde(rename_all = "camelCase")]
    ResendFromRequest {
        /// Correlates response messages with this request.
        request_id: RequestId,
        /// The stream to resend from.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
        /// Resend everything at or after this position.
        from_msg_ref: MessageRef,
        /// Restrict to one publisher, if given.
        publisher_id: Option<String>,
    },
    /// Request a bounded range of one publisher's chain.
    #[serde(rename_all = "camelCase")]
    ResendRangeRequest {
        /// Correlates response messages with this request.
        request_id: RequestId,
        /// The stream to resend from.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
        /// Start of the range, inclusive.
        from_msg_ref: MessageRef,
        /// End of the range, inclusive.
        to_msg_ref: MessageRef,
        /// The publisher whose chain is requested.
        publisher_id: String,
        /// The message chain within the publisher.
        msg_chain_id: String,
    },
}

impl ResendRequest {
    /// The request id correlating responses with this request.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::ResendLastRequest { request_id, .. }
            | Self::ResendFromRequest { request_id, .. }
            | Self::ResendRangeRequest { request_id, .. } => request_id,
        }
    }

    /// The stream-partition the resend is about.
    pub fn stream_partition(&self) -> StreamPartition {
        match self {
            Self::ResendLastRequest {
                stream_id,
                stream_partition,
                ..
            }
            | Self::ResendFromRequest {
                stream_id,
                stream_partition,
                ..
            }
            | Self::ResendRangeRequest {
                stream_id,
                stream_partition,
                ..
            } => StreamPartition::new(stream_id.as_str(), *stream_partition),
        }
    }
}

/// Control responses framing a resend answer.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResendResponse {
    /// Data is about to flow for the request.
    #[serde(rename_all = "camelCase")]
    Resending {
        /// The request being answered.
        request_id: RequestId,
        /// The stream the resend is about.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
    },
    /// The request was fulfilled; no more data will follow.
    #[serde(rename_all = "camelCase")]
    Resent {
        /// The request being answered.
        request_id: RequestId,
        /// The stream the resend is about.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
    },
    /// The responder has nothing to resend for the request.
    #[serde(rename_all = "camelCase")]
    NoResend {
        /// The request being answered.
        request_id: RequestId,
        /// The stream the resend is about.
        stream_id: String,
        /// The partition within the stream.
        stream_partition: u32,
    },
}

impl ResendResponse {
    /// The request id this response is answering.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Resending { request_id, .. }
            | Self::Resent { request_id, .. }
            | Self::NoResend { request_id, .. } => request_id,
        }
    }
}

/// One historical message, addressed to a single requester.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnicastMessage {
    /// The resend request this message answers.
    pub request_id: RequestId,
    /// The historical message itself.
    pub stream_message: StreamMessage,
}

/// Ask a tracker which storage nodes it knows for a stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodesRequest {
    /// The stream storage is needed for.
    pub stream_id: String,
    /// The partition within the stream.
    pub stream_partition: u32,
}

impl StorageNodesRequest {
    /// The stream-partition storage is needed for.
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.as_str(), self.stream_partition)
    }
}

/// The tracker's answer to a [StorageNodesRequest].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodesResponse {
    /// The stream the request was about.
    pub stream_id: String,
    /// The partition within the stream.
    pub stream_partition: u32,
    /// Known storage nodes, excluding the requester.
    pub node_ids: Vec<NodeId>,
}

impl StorageNodesResponse {
    /// The stream-partition the response is about.
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.as_str(), self.stream_partition)
    }
}

/// Everything one node can say to another.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeMessage {
    /// A gossiped data message.
    Broadcast(StreamMessage),
    /// A request for historical data.
    ResendRequest(ResendRequest),
    /// A control response framing a resend answer.
    ResendResponse(ResendResponse),
    /// One historical message answering a resend request.
    Unicast(UnicastMessage),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resend_request_tagged_encoding() {
        let req = ResendRequest::ResendLastRequest {
            request_id: "req-1".into(),
            stream_id: "stream-1".to_string(),
            stream_partition: 0,
            number_last: 10,
        };
        let enc = serde_json::to_value(&req).unwrap();
        assert_eq!("resendLastRequest", enc["type"]);
        assert_eq!(10, enc["numberLast"]);
        let dec: ResendRequest = serde_json::from_value(enc).unwrap();
        assert_eq!(req, dec);
        assert_eq!(
            StreamPartition::new("stream-1", 0),
            dec.stream_partition()
        );
    }

    #[test]
    fn status_stream_map_keys_are_stream_keys() {
        let mut streams = HashMap::new();
        streams.insert(
            StreamPartition::new("stream-1", 0),
            StreamStatus {
                inbound_nodes: vec!["a".into()],
                outbound_nodes: vec!["b".into()],
                counter: 3,
            },
        );
        let status = Status {
            streams,
            rtts: None,
            location: None,
            started: "start".to_string(),
            single_stream: false,
        };
        let enc = serde_json::to_value(&status).unwrap();
        assert_eq!(3, enc["streams"]["stream-1::0"]["counter"]);
        let dec: Status = serde_json::from_value(enc).unwrap();
        assert_eq!(status, dec);
    }

    #[test]
    fn single_stream_defaults_to_false() {
        let dec: Status = serde_json::from_str(
            r#"{"streams":{},"rtts":null,"location":null,"started":"x"}"#,
        )
        .unwrap();
        assert!(!dec.single_stream);
    }
}
