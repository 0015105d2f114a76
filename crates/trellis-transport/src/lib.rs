//! # trellis-transport
//!
//! Wire formats shared by the Trellis overlay.
//!
//! This crate provides:
//!
//! - **CBOR serialization** helpers via [`cbor`]
//! - **Wire protocol** message envelope with request/reply correlation via [`wire`]
//! - **Message types** for the DHT RPCs via [`messages`]
//! - **Transaction records** exchanged by higher layers via [`transaction`]
//!
//! ## Architecture
//!
//! ```text
//! DHT manager / RPC node
//!     |
//!     v
//! ProtocolMessage (wire.rs)  -- CBOR envelope with version, type, msg_id, payload
//!     |
//!     v
//! UDP datagram
//! ```
//!
//! Sockets live with their owners (`trellis-dht`, `trellis-discovery`); this
//! crate only knows how bytes are laid out.

pub mod cbor;
pub mod messages;
pub mod transaction;
pub mod wire;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized payload, etc.).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");

        let err = TransportError::ProtocolViolation("bad version".to_string());
        assert_eq!(err.to_string(), "protocol violation: bad version");
    }
}
