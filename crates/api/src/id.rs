//! Types dealing with peer and stream identity.

use std::sync::Arc;

macro_rules! imp_str_id {
    ($i:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $i(pub Arc<str>);

        impl std::ops::Deref for $i {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $i {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $i {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $i {
            fn from(s: &str) -> Self {
                Self(s.into())
            }
        }

        impl From<String> for $i {
            fn from(s: String) -> Self {
                Self(s.into())
            }
        }

        impl serde::Serialize for $i {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $i {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s: std::borrow::Cow<'de, str> =
                    serde::Deserialize::deserialize(deserializer)?;
                Ok(Self(s.as_ref().into()))
            }
        }
    };
}

imp_str_id!(
    NodeId,
    "Identifies a peer node. Assigned by the transport layer, opaque here."
);

imp_str_id!(
    RequestId,
    "Correlates a request with the messages answering it."
);

/// Identifies a tracker. Trackers live in the same id namespace as nodes.
pub type TrackerId = NodeId;

/// The separator between stream id and partition in a [StreamPartition] key.
const KEY_SEPARATOR: &str = "::";

/// Addresses one partition of a named stream.
///
/// Serializes to its unique key form `"<streamId>::<partition>"`, which is
/// also what the [std::fmt::Display] impl renders and what wire-level maps
/// are keyed by.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamPartition {
    stream_id: Arc<str>,
    partition: u32,
}

impl StreamPartition {
    /// Construct a new StreamPartition.
    pub fn new(stream_id: impl Into<Arc<str>>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    /// The stream id.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The partition within the stream.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// The unique key form, e.g. `"metrics::0"`.
    pub fn key(&self) -> String {
        format!("{}{}{}", self.stream_id, KEY_SEPARATOR, self.partition)
    }
}

impl std::fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.stream_id, KEY_SEPARATOR, self.partition)
    }
}

impl std::fmt::Debug for StreamPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for StreamPartition {
    type Err = crate::SlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream_id, partition) = s
            .rsplit_once(KEY_SEPARATOR)
            .ok_or_else(|| crate::SlError::other(format!("invalid stream key: {s}")))?;
        let partition = partition.parse().map_err(|e| {
            crate::SlError::other_src(format!("invalid stream key: {s}"), e)
        })?;
        Ok(Self::new(stream_id, partition))
    }
}

impl serde::Serialize for StreamPartition {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> serde::Deserialize<'de> for StreamPartition {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> =
            serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
