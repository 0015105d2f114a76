//! Message payload structs for the Trellis DHT RPCs.
//!
//! Each RPC has a request and a response struct. They are serialized to CBOR
//! for inclusion in [`ProtocolMessage`](crate::wire::ProtocolMessage)
//! envelopes; the response reuses the request's `msg_id`.

use serde::{Deserialize, Serialize};

/// Message type for ping (0x0001).
pub const MSG_PING: u16 = 0x0001;
/// Message type for pong (0x0002).
pub const MSG_PONG: u16 = 0x0002;
/// Message type for find node (0x0010).
pub const MSG_FIND_NODE: u16 = 0x0010;
/// Message type for find node response (0x0011).
pub const MSG_FIND_NODE_RESPONSE: u16 = 0x0011;

/// A peer as it travels over the wire.
///
/// `addr` is the `host:port` of the peer's DHT socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// 160-bit node identifier derived from `verifying_key`.
    pub node_id: [u8; 20],
    /// Socket address as a string.
    pub addr: String,
    /// Ed25519 verifying key of the peer.
    pub verifying_key: [u8; 32],
}

/// Liveness probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ping {
    pub sender: NodeDescriptor,
}

/// Liveness reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pong {
    pub sender: NodeDescriptor,
}

/// Ask a peer for the nodes it knows closest to `target`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNode {
    pub sender: NodeDescriptor,
    pub target: [u8; 20],
}

/// Up to k nodes the responder knows, closest to the requested target first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub sender: NodeDescriptor,
    pub nodes: Vec<NodeDescriptor>,
}

/// Tagged union of every DHT message payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TypedMessage {
    /// Ping (0x0001).
    Ping(Ping),
    /// Pong (0x0002).
    Pong(Pong),
    /// Find node (0x0010).
    FindNode(FindNode),
    /// Find node response (0x0011).
    FindNodeResponse(FindNodeResponse),
}

impl TypedMessage {
    /// Return the wire-protocol message type code for this message.
    pub fn msg_type(&self) -> u16 {
        match self {
            Self::Ping(_) => MSG_PING,
            Self::Pong(_) => MSG_PONG,
            Self::FindNode(_) => MSG_FIND_NODE,
            Self::FindNodeResponse(_) => MSG_FIND_NODE_RESPONSE,
        }
    }

    /// The descriptor of whoever sent this message.
    pub fn sender(&self) -> &NodeDescriptor {
        match self {
            Self::Ping(m) => &m.sender,
            Self::Pong(m) => &m.sender,
            Self::FindNode(m) => &m.sender,
            Self::FindNodeResponse(m) => &m.sender,
        }
    }

    /// Whether this message answers a request rather than starting one.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Pong(_) | Self::FindNodeResponse(_))
    }
}
