//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Routing and retry knobs for outgoing payments. A copy travels with every
/// `SendPayment` command; the master holds its own copy for failure-ledger
/// filtering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConf {
    /// Ledger threshold above which a node is excluded from route requests.
    pub max_strange_node_failures: u32,
    /// Ledger threshold above which a directed edge is excluded from route
    /// requests.
    pub max_direction_failures: u32,
    /// How many times one part may be re-dispatched after a remote failure
    /// before we stop retrying it.
    pub max_remote_attempts: u32,
    /// How long a failed-at-amount ledger entry takes to fully restore to
    /// channel capacity.
    pub failed_chan_recovery_msec: u64,
    /// Maximum route length requested from the path-finder.
    pub init_route_max_length: u32,
    /// Maximum total CLTV delta requested from the path-finder.
    pub route_max_cltv: u32,
    /// Per-channel cap on concurrently tracked parts; bounds splitting.
    pub max_in_channel_htlcs: u32,
    /// How long a sender may sit with parts waiting for a channel to come
    /// online before the whole payment times out.
    pub sender_timeout_msec: u64,
}

impl Default for RouterConf {
    fn default() -> Self {
        Self {
            max_strange_node_failures: 5,
            max_direction_failures: 5,
            max_remote_attempts: 8,
            failed_chan_recovery_msec: 60 * 60 * 1000,
            init_route_max_length: 6,
            route_max_cltv: 2016,
            max_in_channel_htlcs: 10,
            sender_timeout_msec: 90 * 1000,
        }
    }
}
