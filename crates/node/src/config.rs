//! Configuration parameters for a starling node.

use std::time::Duration;

/// Configuration parameters for [Node](crate::Node).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Interval between bootstrap tracker connection sweeps.
    /// Default: 5 s.
    pub tracker_connection_maintenance_interval_ms: u64,

    /// How long a message may wait in the buffer for an outbound neighbor.
    /// Default: 60 s.
    pub buffer_timeout_ms: u64,

    /// How many messages may wait in the buffer, per stream.
    /// Default: 10000.
    pub buffer_max_size: usize,

    /// Grace period before disconnecting a neighbor sharing no streams.
    /// Default: 30 s.
    pub disconnection_wait_time_ms: u64,

    /// Bound on connecting to a tracker-instructed neighbor.
    /// Default: 2 s.
    pub node_connect_timeout_ms: u64,

    /// Interval between per-stream instruction retries. Default: 60 s.
    pub instruction_retry_interval_ms: u64,

    /// Retries between forced status reports during instruction retrying.
    /// Default: 9.
    pub status_send_counter_limit: u32,

    /// Minimum interval between RTT measurements attached to statuses sent
    /// to one tracker. Default: 15 s.
    pub rtt_update_interval_ms: u64,

    /// Bound on tracked gaps per publisher chain. Default: 10000.
    pub max_gap_count: usize,

    /// Bound on remembered seen-but-not-propagated messages.
    /// Default: 10000.
    pub seen_but_not_propagated_max_size: usize,

    /// Consecutive delivery failures tolerated before force-disconnecting
    /// a neighbor. Default: 100.
    pub max_consecutive_delivery_failures: u32,

    /// Neighbors asked per neighbor-assisted resend. Default: 3.
    pub resend_max_tries: usize,

    /// Wait bound per peer during relayed resends, and for tracker
    /// storage-node answers. Default: 20 s.
    pub resend_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tracker_connection_maintenance_interval_ms: 5 * 1000,
            buffer_timeout_ms: 60 * 1000,
            buffer_max_size: 10_000,
            disconnection_wait_time_ms: 30 * 1000,
            node_connect_timeout_ms: 2 * 1000,
            instruction_retry_interval_ms: 60 * 1000,
            status_send_counter_limit: 9,
            rtt_update_interval_ms: 15 * 1000,
            max_gap_count: 10_000,
            seen_but_not_propagated_max_size: 10_000,
            max_consecutive_delivery_failures: 100,
            resend_max_tries: 3,
            resend_timeout_ms: 20 * 1000,
        }
    }
}

impl NodeConfig {
    pub(crate) fn tracker_connection_maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.tracker_connection_maintenance_interval_ms)
    }

    pub(crate) fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }

    pub(crate) fn disconnection_wait_time(&self) -> Duration {
        Duration::from_millis(self.disconnection_wait_time_ms)
    }

    pub(crate) fn node_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.node_connect_timeout_ms)
    }

    pub(crate) fn instruction_retry_interval(&self) -> Duration {
        Duration::from_millis(self.instruction_retry_interval_ms)
    }

    pub(crate) fn rtt_update_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_update_interval_ms)
    }

    pub(crate) fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }
}
