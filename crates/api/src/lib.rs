#![deny(missing_docs)]
//! Starling API contains the module traits of the starling overlay network
//! and the basic types required to define the api of those traits.
//!
//! A starling network is made of *nodes* that gossip stream messages to each
//! other per stream-partition, and *trackers* that assign the neighbor sets
//! the nodes gossip over. This crate only defines the seams between the
//! pieces; the node and tracker state machines live in their own crates,
//! and the physical transport, message persistence, and the concrete
//! neighbor-selection algorithm are implemented by the embedder.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) mod serde_bytes_base64 {
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<bytes::Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: std::borrow::Cow<'de, str> =
            serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s.as_ref())
            .map(bytes::Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod error;
pub use error::*;

pub mod id;
pub use id::{NodeId, RequestId, StreamPartition, TrackerId};

mod message;
pub use message::*;

pub mod protocol;

pub mod registry;
pub mod storage;
pub mod topology;
pub mod transport;
