//! # trellis-discovery
//!
//! Pepper-secured rendezvous that runs before the DHT exists.
//!
//! A fresh cluster has no routing tables to bootstrap from. Discovery fills
//! that gap: every node probes its bootnodes (or its /24) with the shared
//! pepper, ready nodes answer with their verifying key, and once enough peers
//! have answered the collected `{verifying_key -> address}` map seeds the DHT.
//!
//! - [`roster`] - master and delegate verifying keys
//! - [`wire`] - probe and announce frames
//! - [`service`] - the listener, the prober and the quorum decision
//!
//! ## Readiness
//!
//! Masters answer probes from the start. Any other node starts answering once
//! it has heard at least one announcement, so eligibility spreads outwards
//! from the masters one reply at a time.

pub mod roster;
pub mod service;
pub mod wire;

pub use roster::Roster;
pub use service::{ip_range, Discovery, DiscoveryConfig, DiscoveryOutcome};

/// Default UDP port for discovery traffic.
pub const DISCOVERY_PORT: u16 = 10_200;

/// Default number of discovery attempts.
pub const DISCOVERY_RETRIES: u32 = 5;

/// Default wait between discovery attempts in milliseconds.
pub const DISCOVERY_INTERVAL_MS: u64 = 1_000;

/// Default number of discovered peers needed before bootstrapping.
pub const MIN_BOOTSTRAP_NODES: usize = 1;

/// Error types for discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Construction-time parameter is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A roster entry is not a valid verifying key.
    #[error("invalid roster key {key}: {reason}")]
    InvalidRosterKey { key: String, reason: String },

    /// A frame did not have the probe or announce shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CBOR error.
    #[error("transport error: {0}")]
    Transport(#[from] trellis_transport::TransportError),
}

/// Convenience result type for discovery.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
