//! Transaction records handed between the node and its contract executor.
//!
//! The record is serialized as CBOR. Its content hash is independent of the
//! encoding: it is a BLAKE3 hash under the `transaction-data` context over the
//! length-prefixed fields `(contract_transaction, status name, state)`.

use serde::{Deserialize, Serialize};
use trellis_crypto::blake3::{self, contexts};

use crate::cbor;
use crate::TransportError;

/// Outcome of executing a contract transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    /// Canonical name used in the content hash.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// An executed contract transaction and the state it left behind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Opaque serialized contract transaction.
    #[serde(with = "serde_bytes")]
    pub contract_transaction: Vec<u8>,
    pub status: Status,
    pub state: String,
}

impl TransactionData {
    pub fn new(contract_transaction: Vec<u8>, status: Status, state: impl Into<String>) -> Self {
        Self {
            contract_transaction,
            status,
            state: state.into(),
        }
    }

    /// Content hash over `(contract_transaction, status name, state)`.
    pub fn hash(&self) -> [u8; 32] {
        let material = blake3::encode_multi_field(&[
            &self.contract_transaction,
            self.status.name().as_bytes(),
            self.state.as_bytes(),
        ]);
        blake3::derive_key(contexts::TRANSACTION_DATA, &material)
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec(self)
    }

    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] if `data` is not a
    /// CBOR-encoded `TransactionData`.
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        cbor::from_slice(data)
    }
}
