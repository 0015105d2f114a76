//! In-memory network for exercising DHT logic without sockets.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::kademlia::{NodeId, NodeInfo};
use crate::rpc::DhtTransport;

/// Deterministic node number `i`.
pub(crate) fn sim_node(i: u16) -> NodeInfo {
    let mut verifying_key = [0xA5u8; 32];
    verifying_key[..2].copy_from_slice(&i.to_be_bytes());
    let [hi, lo] = i.to_be_bytes();
    NodeInfo::new(verifying_key, SocketAddr::from(([10, 0, hi, lo], 7000)))
}

struct SimPeer {
    info: NodeInfo,
    contacts: Vec<NodeInfo>,
}

/// Peers with fixed contact lists. Every call is counted, and every node
/// handed out by `find_node` is recorded.
pub(crate) struct SimNetwork {
    k: usize,
    peers: HashMap<NodeId, SimPeer>,
    dead: Mutex<HashSet<NodeId>>,
    calls: AtomicUsize,
    returned: Mutex<HashSet<NodeId>>,
}

impl SimNetwork {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            peers: HashMap::new(),
            dead: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            returned: Mutex::new(HashSet::new()),
        }
    }

    /// Every node knows every other node.
    pub(crate) fn mesh(nodes: &[NodeInfo], k: usize) -> Self {
        let mut net = Self::new(k);
        for node in nodes {
            let contacts = nodes.iter().filter(|n| *n != node).cloned().collect();
            net.add_peer(node.clone(), contacts);
        }
        net
    }

    pub(crate) fn add_peer(&mut self, info: NodeInfo, contacts: Vec<NodeInfo>) {
        self.peers.insert(info.node_id, SimPeer { info, contacts });
    }

    pub(crate) fn kill(&self, node_id: NodeId) {
        self.dead.lock().expect("dead set lock").insert(node_id);
    }

    pub(crate) fn revive(&self, node_id: &NodeId) {
        self.dead.lock().expect("dead set lock").remove(node_id);
    }

    fn is_dead(&self, node_id: &NodeId) -> bool {
        self.dead.lock().expect("dead set lock").contains(node_id)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn was_returned(&self, node_id: &NodeId) -> bool {
        self.returned
            .lock()
            .expect("returned set lock")
            .contains(node_id)
    }

    fn alive(&self, node_id: &NodeId) -> Option<&SimPeer> {
        if self.is_dead(node_id) {
            return None;
        }
        self.peers.get(node_id)
    }
}

impl DhtTransport for SimNetwork {
    async fn ping(&self, node: &NodeInfo) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.alive(&node.node_id).is_some()
    }

    async fn find_node(&self, node: &NodeInfo, target: NodeId) -> Option<Vec<NodeInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let peer = self.alive(&node.node_id)?;
        let mut contacts = peer.contacts.clone();
        contacts.sort_by_key(|n| n.node_id.distance(&target));
        contacts.truncate(self.k);
        self.returned
            .lock()
            .expect("returned set lock")
            .extend(contacts.iter().map(|n| n.node_id));
        Some(contacts)
    }

    async fn probe(&self, addr: SocketAddr) -> Option<NodeInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.peers
            .values()
            .find(|p| p.info.addr == addr && !self.is_dead(&p.info.node_id))
            .map(|p| p.info.clone())
    }
}
