//! Node roster: which verifying keys belong to masters and delegates.
//!
//! Masters are the rendezvous points a fresh cluster forms around. A master
//! answers discovery probes from the moment it starts listening, and a master
//! that is alone in the roster may bootstrap on its own.

use std::collections::BTreeSet;

use trellis_crypto::ed25519::VerifyingKey;

use crate::{DiscoveryError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    masters: BTreeSet<[u8; 32]>,
    delegates: BTreeSet<[u8; 32]>,
}

impl Roster {
    pub fn new(
        masters: impl IntoIterator<Item = [u8; 32]>,
        delegates: impl IntoIterator<Item = [u8; 32]>,
    ) -> Self {
        Self {
            masters: masters.into_iter().collect(),
            delegates: delegates.into_iter().collect(),
        }
    }

    /// Build a roster from hex-encoded verifying keys.
    ///
    /// Every entry must decode to a valid Ed25519 point.
    pub fn from_hex(masters: &[String], delegates: &[String]) -> Result<Self> {
        Ok(Self::new(parse_keys(masters)?, parse_keys(delegates)?))
    }

    pub fn is_master(&self, verifying_key: &[u8; 32]) -> bool {
        self.masters.contains(verifying_key)
    }

    pub fn is_delegate(&self, verifying_key: &[u8; 32]) -> bool {
        self.delegates.contains(verifying_key)
    }

    /// Master verifying keys in ascending byte order.
    pub fn masters(&self) -> Vec<[u8; 32]> {
        self.masters.iter().copied().collect()
    }

    pub fn delegates(&self) -> Vec<[u8; 32]> {
        self.delegates.iter().copied().collect()
    }
}

fn parse_keys(keys: &[String]) -> Result<Vec<[u8; 32]>> {
    keys.iter()
        .map(|key| {
            VerifyingKey::from_hex(key.trim())
                .map(|vk| vk.to_bytes())
                .map_err(|e| DiscoveryError::InvalidRosterKey {
                    key: key.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_crypto::ed25519::KeyPair;

    #[test]
    fn test_roles() {
        let master = KeyPair::generate().verifying_key.to_bytes();
        let delegate = KeyPair::generate().verifying_key.to_bytes();
        let roster = Roster::new([master], [delegate]);

        assert!(roster.is_master(&master));
        assert!(!roster.is_master(&delegate));
        assert!(roster.is_delegate(&delegate));
        assert_eq!(roster.masters(), vec![master]);
    }

    #[test]
    fn test_from_hex() {
        let a = KeyPair::generate().verifying_key;
        let b = KeyPair::generate().verifying_key;
        let roster = Roster::from_hex(&[a.to_hex(), b.to_hex(), a.to_hex()], &[]).expect("roster");

        assert_eq!(roster.masters().len(), 2);
        assert!(roster.is_master(a.as_bytes()));
        assert!(roster.delegates().is_empty());
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        let err = Roster::from_hex(&["abcd".to_string()], &[]);
        assert!(matches!(err, Err(DiscoveryError::InvalidRosterKey { .. })));

        let err = Roster::from_hex(&[], &["zz".repeat(32)]);
        assert!(matches!(err, Err(DiscoveryError::InvalidRosterKey { .. })));
    }
}
