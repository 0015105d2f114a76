//! Kademlia routing table with XOR-distance metric.
//!
//! Implements a Kademlia routing table with 160 k-buckets, one per possible
//! common-prefix length with the local id. A fixed array of buckets behaves
//! exactly like a fully split tree, so no bucket ever needs splitting.
//!
//! ## LRU Eviction
//!
//! When a bucket is full and a new node is discovered, [`RoutingTable::add_node`]
//! hands back the least-recently-seen entry. The caller pings it: on failure it
//! calls [`RoutingTable::evict_and_insert`], on success [`RoutingTable::touch`]
//! and the new node is discarded (Kademlia preference for long-lived nodes).
//! The table itself never suspends.
//!
//! Entries also count consecutive failed requests. Callers report failures
//! with [`RoutingTable::record_failure`] and drop the node once the count
//! reaches their threshold; any answer resets it through
//! [`RoutingTable::touch`].

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;
use trellis_crypto::blake3::{digest160, DIGEST160_LEN};
use trellis_transport::messages::NodeDescriptor;

use crate::{DhtError, Result, NUM_BUCKETS};

/// A 160-bit node identifier.
///
/// Ordering is unsigned big-endian comparison, so comparing two distances
/// compares them as integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; DIGEST160_LEN]);

impl NodeId {
    /// Derive the identifier of a verifying key.
    pub fn from_verifying_key(verifying_key: &[u8; 32]) -> Self {
        Self(digest160(verifying_key))
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut id = [0u8; DIGEST160_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// A random identifier that falls into bucket `bucket_idx` of a table
    /// owned by `local`.
    pub fn random_in_bucket(local: &NodeId, bucket_idx: usize) -> Self {
        let idx = bucket_idx.min(NUM_BUCKETS - 1);
        let mut distance = [0u8; DIGEST160_LEN];
        rand::thread_rng().fill_bytes(&mut distance);

        let byte = idx / 8;
        let mask = 0x80u8 >> (idx % 8);
        distance[..byte].fill(0);
        distance[byte] = (distance[byte] & (mask - 1)) | mask;

        local.distance(&NodeId(distance))
    }

    /// XOR distance between two identifiers.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; DIGEST160_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST160_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40-character hex identifier.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut id = [0u8; DIGEST160_LEN];
        hex::decode_to_slice(s, &mut id)
            .map_err(|e| DhtError::InvalidDescriptor(format!("bad node id {s:?}: {e}")))?;
        Ok(Self(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A peer: identifier, DHT address and verifying key.
///
/// Two `NodeInfo` values describe the same peer iff their verifying keys
/// match. Entries are replaced wholesale on re-discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    #[serde(with = "hex_key")]
    pub verifying_key: [u8; 32],
}

impl NodeInfo {
    /// Describe the peer holding `verifying_key`, deriving its identifier.
    pub fn new(verifying_key: [u8; 32], addr: SocketAddr) -> Self {
        Self {
            node_id: NodeId::from_verifying_key(&verifying_key),
            addr,
            verifying_key,
        }
    }

    /// Wire form of this node.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            node_id: self.node_id.0,
            addr: self.addr.to_string(),
            verifying_key: self.verifying_key,
        }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.verifying_key == other.verifying_key
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.verifying_key.hash(state);
    }
}

impl TryFrom<&NodeDescriptor> for NodeInfo {
    type Error = DhtError;

    /// Accepts a descriptor only if its id is the digest of its key.
    fn try_from(descriptor: &NodeDescriptor) -> Result<Self> {
        let addr: SocketAddr = descriptor.addr.parse().map_err(|e| {
            DhtError::InvalidDescriptor(format!("bad address {:?}: {e}", descriptor.addr))
        })?;
        let info = NodeInfo::new(descriptor.verifying_key, addr);
        if info.node_id.0 != descriptor.node_id {
            return Err(DhtError::InvalidDescriptor(format!(
                "node id {} does not match verifying key",
                hex::encode(descriptor.node_id)
            )));
        }
        Ok(info)
    }
}

/// Runtime metadata for a node entry within a k-bucket.
#[derive(Clone, Debug)]
struct BucketEntry {
    info: NodeInfo,
    /// Requests in a row this node failed to answer.
    failed_rpcs: u32,
}

/// A single k-bucket, ordered by last-seen time.
///
/// The front of the deque holds the least-recently-seen entry;
/// the back holds the most-recently-seen entry.
#[derive(Clone, Debug)]
struct KBucket {
    entries: VecDeque<BucketEntry>,
    /// Last time a lookup covered this bucket's range.
    last_refresh: Instant,
}

impl KBucket {
    fn new(k: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(k),
            last_refresh: Instant::now(),
        }
    }

    fn find_index(&self, node_id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.info.node_id == *node_id)
    }

    /// Move an entry to the most-recently-seen position, optionally
    /// replacing its descriptor. The failure count survives a replacement.
    fn refresh(&mut self, index: usize, replacement: Option<NodeInfo>) {
        if let Some(mut entry) = self.entries.remove(index) {
            if let Some(info) = replacement {
                entry.info = info;
            }
            self.entries.push_back(entry);
        }
    }

    fn insert(&mut self, info: NodeInfo) {
        self.entries.push_back(BucketEntry {
            info,
            failed_rpcs: 0,
        });
    }
}

/// Result of attempting to add a node to the routing table.
#[derive(Clone, Debug)]
pub enum AddNodeResult {
    /// The node was newly inserted into a bucket.
    Inserted,
    /// The node was already present; its descriptor and recency were updated.
    Updated,
    /// The node was ignored (it is the local node).
    Ignored,
    /// The target bucket is full. Contains the least-recently-seen entry
    /// that should be pinged to check liveness.
    BucketFull { least_recently_seen: NodeInfo },
}

/// The Kademlia routing table.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty table for `local_id` holding at most `k` nodes per bucket.
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| KBucket::new(k)).collect();
        Self {
            local_id,
            k,
            buckets,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// The bucket a node belongs in: the length of the common prefix of its
    /// id and the local id. `None` for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        leading_zeros(&self.local_id.distance(node_id))
    }

    /// Add or refresh a node.
    ///
    /// - Already present: replace its descriptor and move it to the
    ///   most-recently-seen position.
    /// - Bucket has room: insert.
    /// - Bucket full: return [`AddNodeResult::BucketFull`] with the
    ///   least-recently-seen entry so the caller can check it.
    pub fn add_node(&mut self, info: NodeInfo) -> AddNodeResult {
        let Some(bucket_idx) = self.bucket_index(&info.node_id) else {
            return AddNodeResult::Ignored;
        };
        let k = self.k;
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(idx) = bucket.find_index(&info.node_id) {
            bucket.refresh(idx, Some(info));
            return AddNodeResult::Updated;
        }

        if bucket.entries.len() < k {
            bucket.insert(info);
            return AddNodeResult::Inserted;
        }

        match bucket.entries.front() {
            Some(lrs) => AddNodeResult::BucketFull {
                least_recently_seen: lrs.info.clone(),
            },
            None => AddNodeResult::Ignored,
        }
    }

    /// Record that `node_id` answered, moving it to the most-recently-seen
    /// position and clearing its failure count. Returns whether the node was
    /// present.
    pub fn touch(&mut self, node_id: &NodeId) -> bool {
        let Some(bucket_idx) = self.bucket_index(node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[bucket_idx];
        match bucket.find_index(node_id) {
            Some(idx) => {
                if let Some(entry) = bucket.entries.get_mut(idx) {
                    entry.failed_rpcs = 0;
                }
                bucket.refresh(idx, None);
                true
            }
            None => false,
        }
    }

    /// Count one more unanswered request against `node_id`.
    ///
    /// Returns the new count, or `None` if the node is not in the table.
    pub fn record_failure(&mut self, node_id: &NodeId) -> Option<u32> {
        let bucket_idx = self.bucket_index(node_id)?;
        let bucket = &mut self.buckets[bucket_idx];
        let idx = bucket.find_index(node_id)?;
        let entry = bucket.entries.get_mut(idx)?;
        entry.failed_rpcs += 1;
        Some(entry.failed_rpcs)
    }

    /// Consecutive failures recorded against `node_id`.
    pub fn failures(&self, node_id: &NodeId) -> Option<u32> {
        let bucket = &self.buckets[self.bucket_index(node_id)?];
        let idx = bucket.find_index(node_id)?;
        bucket.entries.get(idx).map(|e| e.failed_rpcs)
    }

    /// Evict `stale_id` and insert `new_node` in its place.
    ///
    /// Call this after a failed ping to the entry returned by [`Self::add_node`].
    pub fn evict_and_insert(&mut self, stale_id: &NodeId, new_node: NodeInfo) -> Result<()> {
        if self.remove_node(stale_id).is_none() {
            return Err(DhtError::UnknownNode(stale_id.to_hex()));
        }
        self.add_node(new_node);
        Ok(())
    }

    /// Remove a node from the routing table.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let bucket_idx = self.bucket_index(node_id)?;
        let bucket = &mut self.buckets[bucket_idx];
        let entry_idx = bucket.find_index(node_id)?;
        bucket.entries.remove(entry_idx).map(|e| e.info)
    }

    /// Look up a node by identifier.
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        let bucket = &self.buckets[self.bucket_index(node_id)?];
        bucket
            .find_index(node_id)
            .and_then(|idx| bucket.entries.get(idx))
            .map(|e| &e.info)
    }

    /// Find the `count` closest nodes to `target`, scanning every bucket.
    ///
    /// Distinct ids have distinct distances to any target, so the order is
    /// total and deterministic.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut all_nodes: Vec<(NodeId, &NodeInfo)> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .map(|e| (e.info.node_id.distance(target), &e.info))
            .collect();

        all_nodes.sort_by(|a, b| a.0.cmp(&b.0));

        all_nodes
            .into_iter()
            .take(count)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Every node in the table, farthest bucket first.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.info.clone()))
            .collect()
    }

    /// Number of nodes in each non-empty bucket.
    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, b)| (i, b.entries.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of non-empty buckets that no lookup has covered within
    /// `refresh_interval`.
    pub fn stale_buckets(&self, refresh_interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.entries.is_empty() && now.duration_since(b.last_refresh) >= refresh_interval
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_refresh = Instant::now();
        }
    }
}

/// Number of leading zero bits, or `None` if the value is all zeros.
fn leading_zeros(value: &NodeId) -> Option<usize> {
    value
        .0
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
}

/// Serde support for `SocketAddr` as a string.
mod socket_addr_serde {
    use std::net::SocketAddr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde support for a 32-byte key as hex.
mod hex_key {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut key = [0u8; 32];
        hex::decode_to_slice(&s, &mut key).map_err(serde::de::Error::custom)?;
        Ok(key)
    }
}
