//! Discovery frames.
//!
//! A frame is a CBOR array of byte strings with no version field:
//!
//! ```text
//! probe:    [address, pepper]
//! announce: [address, pepper, verifying_key]
//! ```
//!
//! `address` is the sender's discovery socket address as UTF-8 (`ip:port`).
//! The pepper is carried verbatim; checking it is the listener's job.

use std::net::SocketAddr;

use serde_bytes::ByteBuf;
use trellis_transport::cbor;

use crate::{DiscoveryError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// "Are you there?" Answered with an announce by ready nodes only.
    Probe { addr: SocketAddr, pepper: Vec<u8> },
    /// "I am here, and this is my key."
    Announce {
        addr: SocketAddr,
        pepper: Vec<u8>,
        verifying_key: [u8; 32],
    },
}

impl Frame {
    pub fn probe(addr: SocketAddr, pepper: &[u8]) -> Self {
        Self::Probe {
            addr,
            pepper: pepper.to_vec(),
        }
    }

    pub fn announce(addr: SocketAddr, pepper: &[u8], verifying_key: [u8; 32]) -> Self {
        Self::Announce {
            addr,
            pepper: pepper.to_vec(),
            verifying_key,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Probe { addr, .. } | Self::Announce { addr, .. } => *addr,
        }
    }

    pub fn pepper(&self) -> &[u8] {
        match self {
            Self::Probe { pepper, .. } | Self::Announce { pepper, .. } => pepper,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields = vec![
            ByteBuf::from(self.addr().to_string().into_bytes()),
            ByteBuf::from(self.pepper().to_vec()),
        ];
        if let Self::Announce { verifying_key, .. } = self {
            fields.push(ByteBuf::from(verifying_key.to_vec()));
        }
        Ok(cbor::to_vec(&fields)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let fields: Vec<ByteBuf> = cbor::from_slice(data)?;
        let (addr, pepper, verifying_key) = match fields.as_slice() {
            [addr, pepper] => (addr, pepper, None),
            [addr, pepper, vk] => (addr, pepper, Some(vk)),
            other => {
                return Err(DiscoveryError::Malformed(format!(
                    "expected 2 or 3 fields, got {}",
                    other.len()
                )))
            }
        };

        let addr = std::str::from_utf8(addr)
            .ok()
            .and_then(|s| s.parse::<SocketAddr>().ok())
            .ok_or_else(|| DiscoveryError::Malformed("unparseable address".to_string()))?;
        let pepper = pepper.to_vec();

        match verifying_key {
            None => Ok(Self::Probe { addr, pepper }),
            Some(vk) => {
                let verifying_key: [u8; 32] = vk.as_slice().try_into().map_err(|_| {
                    DiscoveryError::Malformed(format!("verifying key is {} bytes", vk.len()))
                })?;
                Ok(Self::Announce {
                    addr,
                    pepper,
                    verifying_key,
                })
            }
        }
    }
}
