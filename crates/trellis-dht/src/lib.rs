//! # trellis-dht
//!
//! Kademlia-based distributed hash table for the Trellis overlay.
//!
//! This crate implements:
//! - Kademlia routing table with XOR-distance metric (160 buckets, configurable k)
//! - UDP request/reply RPC with correlation ids and per-request timeouts
//! - Iterative parallel `FIND_NODE` lookup (crawl)
//! - Two-hop bootstrap from a seed set
//! - A network manager that refreshes the table, resolves verifying keys to
//!   addresses, and persists its neighbors
//!
//! ## Key Parameters
//!
//! | Parameter | Default |
//! |---|---|
//! | k (bucket size) | 20 |
//! | alpha (lookup parallelism) | 3 |
//! | Refresh interval | 1 hour |
//! | State save interval | 10 minutes |
//! | RPC timeout | 5 seconds |
//! | Failed requests before eviction | 3 |
//! | Node ID derivation | `BLAKE3-derive-key("Trellis v1 node-id", verifying_key)[:20]` |

pub mod bootstrap;
pub mod kademlia;
pub mod lookup;
pub mod network;
pub mod rpc;
pub mod state;

#[cfg(test)]
pub(crate) mod sim;

/// Default Kademlia bucket size: maximum contacts per bucket.
pub const K: usize = 20;

/// Default lookup parallelism factor.
pub const ALPHA: usize = 3;

/// Width of a node identifier in bits.
pub const ID_BITS: usize = 160;

/// Number of buckets in the routing table (one per bit of the key space).
pub const NUM_BUCKETS: usize = ID_BITS;

/// Bucket refresh interval in seconds (1 hour).
pub const REFRESH_INTERVAL_SECS: u64 = 3600;

/// Interval between state snapshots in seconds (10 minutes).
pub const SAVE_INTERVAL_SECS: u64 = 600;

/// RPC timeout in milliseconds.
pub const RPC_TIMEOUT_MS: u64 = 5000;

/// Consecutive unanswered requests after which a node leaves the routing table.
pub const MAX_FAILED_RPCS: u32 = 3;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// Construction-time parameter is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The node to evict is not in the routing table.
    #[error("node {0} is not in the routing table")]
    UnknownNode(String),

    /// A peer descriptor failed validation.
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    /// A saved snapshot does not belong to this node.
    #[error("state file belongs to node {found}, local node is {expected}")]
    StateMismatch { expected: String, found: String },

    /// Socket or filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON snapshot encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire protocol error from trellis-transport.
    #[error("transport error: {0}")]
    Transport(#[from] trellis_transport::TransportError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(K, 20);
        assert_eq!(ALPHA, 3);
        assert_eq!(NUM_BUCKETS, 160);
        assert_eq!(REFRESH_INTERVAL_SECS, 3600);
        assert_eq!(SAVE_INTERVAL_SECS, 600);
    }

    #[test]
    fn test_error_display() {
        let err = DhtError::InvalidConfig("k must be positive".to_string());
        assert_eq!(err.to_string(), "invalid configuration: k must be positive");
    }
}
