//! # Routing Parameters
//!
//! All tuning constants for the routing core, gathered into one immutable
//! value supplied at construction. The defaults are the conventional
//! deployment values; tests shrink them to exercise edge behaviour.

use std::time::Duration;

/// Immutable configuration for a routing node.
///
/// Cloned freely; every component keeps its own copy and nothing mutates
/// one after the facade is built.
#[derive(Clone, Debug)]
pub struct Parameters {
    /// Hard cap on the vault routing table.
    pub max_routing_table_size: usize,
    /// Size of the always-retained close neighbourhood.
    pub closest_nodes_size: usize,
    /// Number of network-wide closest peers that form a group.
    pub group_size: usize,
    /// Radius rank used by the proximal band of the group-range predicate.
    pub proximal_size: usize,
    /// Per-bucket occupancy target outside the close neighbourhood.
    pub bucket_target: usize,
    /// Next-hop reselection attempts before a message is dropped.
    pub max_forward_attempts: usize,
    /// Deadline applied to registered response callbacks.
    pub default_response_timeout: Duration,
    /// Cap on a message's hop record. Must stay at least twice
    /// `max_routing_table_size` so loop avoidance holds in realistic
    /// networks.
    pub route_history_size: usize,
    /// Byte budget for the opportunistic content cache.
    pub max_cache_bytes: usize,
    /// Hard cap on the client table.
    pub max_client_table_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            max_routing_table_size: 64,
            closest_nodes_size: 8,
            group_size: 4,
            proximal_size: 8,
            bucket_target: 1,
            max_forward_attempts: 3,
            default_response_timeout: Duration::from_secs(10),
            route_history_size: 128,
            max_cache_bytes: 4 * 1024 * 1024,
            max_client_table_size: 64,
        }
    }
}

impl Parameters {
    /// Network health as a percentage of table fill.
    pub fn network_status(&self, table_size: usize) -> u8 {
        let pct = table_size * 100 / self.max_routing_table_size;
        pct.min(100) as u8
    }
}
