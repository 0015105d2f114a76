//! Wire-protocol message envelope for the Trellis DHT.
//!
//! Every DHT datagram is a CBOR-serialized [`ProtocolMessage`]. Requests carry
//! a fresh random `msg_id`; replies built with [`ProtocolMessage::reply_to`]
//! echo it so the caller can match them to the pending request.
//!
//! ## Wire format
//!
//! ```text
//! ProtocolMessage {
//!     version:   u8,       // Protocol version (1)
//!     msg_type:  u16,      // Message type from registry
//!     msg_id:    [u8; 16], // Correlation id
//!     timestamp: u64,      // Unix timestamp (seconds)
//!     payload:   Vec<u8>,  // CBOR-encoded payload
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::messages::TypedMessage;
use crate::TransportError;

/// Current Trellis DHT protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the RPC layer reads.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum payload size, leaving room for the envelope inside one datagram.
pub const MAX_PAYLOAD_SIZE: usize = 60_000;

/// Protocol message envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Protocol version. Must be [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Message type code from the message type registry.
    pub msg_type: u16,
    /// Random 128-bit correlation id.
    pub msg_id: [u8; 16],
    /// Unix timestamp in seconds when the message was created.
    pub timestamp: u64,
    /// CBOR-encoded payload bytes.
    pub payload: Vec<u8>,
}

fn unix_now() -> Result<u64, TransportError> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| TransportError::Internal(format!("system time error: {e}")))?
        .as_secs())
}

impl ProtocolMessage {
    /// Create a new request envelope with a random `msg_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if the payload cannot be
    /// CBOR-serialized.
    pub fn from_typed(msg: &TypedMessage) -> Result<Self, TransportError> {
        let mut msg_id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut msg_id);
        Self::with_id(msg, msg_id)
    }

    /// Create a reply envelope that echoes the `msg_id` of `request`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if the payload cannot be
    /// CBOR-serialized.
    pub fn reply_to(request: &ProtocolMessage, msg: &TypedMessage) -> Result<Self, TransportError> {
        Self::with_id(msg, request.msg_id)
    }

    fn with_id(msg: &TypedMessage, msg_id: [u8; 16]) -> Result<Self, TransportError> {
        let payload = cbor::to_vec(msg)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "payload too large: {} bytes, max {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type: msg.msg_type(),
            msg_id,
            timestamp: unix_now()?,
            payload,
        })
    }

    /// Decode the payload as a [`TypedMessage`].
    ///
    /// The decoded variant must agree with `msg_type`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] if the payload is not valid CBOR
    /// or does not match the expected message schema, and
    /// [`TransportError::ProtocolViolation`] if the type code disagrees.
    pub fn decode_payload(&self) -> Result<TypedMessage, TransportError> {
        let msg: TypedMessage = cbor::from_slice(&self.payload)?;
        if msg.msg_type() != self.msg_type {
            return Err(TransportError::ProtocolViolation(format!(
                "envelope type {:#06x} does not match payload type {:#06x}",
                self.msg_type,
                msg.msg_type()
            )));
        }
        Ok(msg)
    }

    /// Serialize this protocol message to CBOR bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec(self)
    }

    /// Deserialize and validate a protocol message received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] if the bytes are not a
    /// `ProtocolMessage`, and [`TransportError::ProtocolViolation`] if the
    /// version is unsupported or the payload exceeds the maximum size.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let msg: Self = cbor::from_slice(data)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Validate the protocol message envelope.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolViolation`] if the version is unsupported
    /// or the payload is too large.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                self.version
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "payload too large: {} bytes, max {MAX_PAYLOAD_SIZE}",
                self.payload.len()
            )));
        }
        Ok(())
    }
}
