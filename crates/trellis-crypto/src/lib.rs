//! # trellis-crypto
//!
//! Cryptographic primitives consumed by the Trellis overlay.
//!
//! The overlay does not manage keys; it only needs a stable way to turn a node's
//! public verifying key into a DHT identifier, and the Ed25519 types that carry
//! those keys between crates.
//!
//! ## Modules
//!
//! - [`blake3`] — Domain-separated BLAKE3 hashing and 160-bit identifier digests
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032)

pub mod blake3;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
