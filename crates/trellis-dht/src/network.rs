//! The DHT network manager.
//!
//! [`Network`] owns the routing table, the resolution cache and the
//! background tasks of one node:
//!
//! - the request listener (UDP only), which answers `PING`/`FIND_NODE` and
//!   offers every requester to the routing table,
//! - the refresh loop, which crawls a random id in every stale bucket,
//! - the periodic save loop, which snapshots the node's neighbors.
//!
//! Each task is a `loop { select! { cancelled, work } }` driven by one
//! [`CancellationToken`]; [`Network::stop`] cancels the token and awaits every
//! handle before releasing the transport.
//!
//! Every request the manager sends is scored against the routing table: an
//! answer clears the peer's failure count, and a peer that misses
//! [`MAX_FAILED_RPCS`] requests in a row is dropped.
//!
//! Shared maps sit behind their own `tokio::sync::Mutex` and are never locked
//! across a network call.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use trellis_transport::messages::{FindNodeResponse, Pong, TypedMessage};

use crate::bootstrap::{two_hop_bootstrap, BootstrapResult};
use crate::kademlia::{AddNodeResult, NodeId, NodeInfo, RoutingTable};
use crate::lookup::crawl;
use crate::rpc::{DhtTransport, InboundRequest, UdpRpc};
use crate::state::NetworkState;
use crate::{DhtError, Result, ALPHA, K, MAX_FAILED_RPCS, REFRESH_INTERVAL_SECS, RPC_TIMEOUT_MS};

/// Parameters of a [`Network`].
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Bucket size, and the number of nodes a lookup returns.
    pub k: usize,
    /// Queries in flight per crawl round.
    pub alpha: usize,
    pub rpc_timeout: Duration,
    /// How long a bucket may go without a lookup before it is refreshed, and
    /// the pause between refresh passes.
    pub refresh_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            refresh_interval: Duration::from_secs(REFRESH_INTERVAL_SECS),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be at least 1".to_string()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig(
                "alpha must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// High-level view of one DHT node.
pub struct Network<T: DhtTransport> {
    config: NetworkConfig,
    local: NodeInfo,
    table: Mutex<RoutingTable>,
    transport: T,
    cache: Mutex<HashMap<[u8; 32], SocketAddr>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: DhtTransport> Network<T> {
    /// Create a manager for `local`, reachable through `transport`.
    pub fn new(config: NetworkConfig, local: NodeInfo, transport: T) -> Result<Self> {
        config.validate()?;
        let table = RoutingTable::new(local.node_id, config.k);
        Ok(Self {
            config,
            local,
            table: Mutex::new(table),
            transport,
            cache: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Rebuild a manager from a snapshot written by [`Network::save_state`]
    /// and bootstrap from the saved neighbors.
    ///
    /// `k` and `alpha` come from the snapshot. A snapshot written by a
    /// different node is rejected.
    pub async fn load_state(
        path: &Path,
        mut config: NetworkConfig,
        local: NodeInfo,
        transport: T,
    ) -> Result<Self> {
        info!(path = %path.display(), "Loading DHT state");
        let state = NetworkState::read(path).await?;
        if state.node_id != local.node_id {
            return Err(DhtError::StateMismatch {
                expected: local.node_id.to_hex(),
                found: state.node_id.to_hex(),
            });
        }
        config.k = state.k;
        config.alpha = state.alpha;

        let network = Self::new(config, local, transport)?;
        if !state.neighbors.is_empty() {
            network.bootstrap(&state.neighbors).await;
        }
        Ok(network)
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Offer a node to the routing table.
    ///
    /// If its bucket is full the least-recently-seen entry is pinged first;
    /// the newcomer only gets in if that entry is dead.
    pub async fn admit(&self, node: NodeInfo) {
        let outcome = self.table.lock().await.add_node(node.clone());
        let AddNodeResult::BucketFull {
            least_recently_seen,
        } = outcome
        else {
            return;
        };

        if self.transport.ping(&least_recently_seen).await {
            self.table.lock().await.touch(&least_recently_seen.node_id);
            trace!(node_id = %node.node_id, "Bucket full of live nodes, newcomer dropped");
            return;
        }

        let mut table = self.table.lock().await;
        if table
            .evict_and_insert(&least_recently_seen.node_id, node.clone())
            .is_err()
        {
            // Someone else already evicted it; the bucket may have room now.
            table.add_node(node);
        } else {
            debug!(
                evicted = %least_recently_seen.node_id,
                admitted = %node.node_id,
                "Evicted unresponsive node"
            );
        }
    }

    /// Admit a node that just proved it is alive, clearing its failure count.
    async fn admit_responsive(&self, node: NodeInfo) {
        let node_id = node.node_id;
        self.admit(node).await;
        self.table.lock().await.touch(&node_id);
    }

    /// Count a missed request against `node`. Once it has missed
    /// [`MAX_FAILED_RPCS`] in a row it leaves the table and the cache.
    async fn record_failure(&self, node: &NodeInfo) {
        let mut table = self.table.lock().await;
        let Some(failures) = table.record_failure(&node.node_id) else {
            return;
        };
        if failures < MAX_FAILED_RPCS {
            trace!(node_id = %node.node_id, failures, "Node missed a request");
            return;
        }
        table.remove_node(&node.node_id);
        drop(table);
        self.cache.lock().await.remove(&node.verifying_key);
        debug!(node_id = %node.node_id, failures, "Dropped unresponsive node");
    }

    /// Consecutive missed requests recorded against `node_id`, if it is in
    /// the table.
    pub async fn failures(&self, node_id: &NodeId) -> Option<u32> {
        self.table.lock().await.failures(node_id)
    }

    /// Join the network through `seeds` with the two-hop bootstrap, and add
    /// every node that answered or was returned to the routing table.
    pub async fn bootstrap(&self, seeds: &[NodeInfo]) -> BootstrapResult {
        let result = two_hop_bootstrap(&self.transport, &self.local, seeds).await;
        let responders: HashSet<&NodeInfo> = result.responders.iter().collect();
        let hearsay: HashSet<&NodeInfo> = result
            .nearest
            .iter()
            .filter(|n| !responders.contains(n))
            .collect();
        for node in hearsay {
            self.admit(node.clone()).await;
        }
        for node in responders {
            self.admit_responsive(node.clone()).await;
        }
        for node in &result.unresponsive {
            self.record_failure(node).await;
        }
        result
    }

    /// Ping a bare address; if a node answers, add it to the table.
    pub async fn probe_address(&self, addr: SocketAddr) -> Option<NodeInfo> {
        let node = self.transport.probe(addr).await?;
        debug!(addr = %addr, node_id = %node.node_id, "Address probe answered");
        self.admit(node.clone()).await;
        Some(node)
    }

    /// Crawl the network for the k nodes closest to `target`.
    ///
    /// Nodes that answered are added to the table, and the bucket covering
    /// `target` counts as refreshed.
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<NodeInfo> {
        let seeds = self.table.lock().await.find_closest(&target, self.config.k);
        let outcome = crawl(
            &self.transport,
            self.local.node_id,
            target,
            seeds,
            self.config.k,
            self.config.alpha,
        )
        .await;

        for node in outcome.responded {
            self.admit_responsive(node).await;
        }
        for node in &outcome.unresponsive {
            self.record_failure(node).await;
        }
        {
            let mut table = self.table.lock().await;
            if let Some(idx) = table.bucket_index(&target) {
                table.mark_bucket_refreshed(idx);
            }
        }
        outcome.closest
    }

    /// Crawl a random id inside every stale bucket, concurrently. Returns the
    /// number of buckets refreshed.
    pub async fn refresh_once(&self) -> usize {
        let stale = self
            .table
            .lock()
            .await
            .stale_buckets(self.config.refresh_interval);
        let targets: Vec<NodeId> = stale
            .iter()
            .map(|idx| NodeId::random_in_bucket(&self.local.node_id, *idx))
            .collect();
        let crawls: Vec<_> = targets
            .into_iter()
            .map(|t| self.iterative_find_node(t))
            .collect();
        join_all(crawls).await;
        stale.len()
    }

    /// Resolve a verifying key to the address of the node holding it.
    ///
    /// Answers come from, in order: the local key, the cache, the routing
    /// table, and finally an expanding search that queries the closest
    /// unprocessed candidate until the key turns up or the frontier runs dry.
    /// Only hits are cached.
    pub async fn lookup(&self, verifying_key: &[u8; 32]) -> Option<SocketAddr> {
        if *verifying_key == self.local.verifying_key {
            self.cache
                .lock()
                .await
                .insert(*verifying_key, self.local.addr);
            return Some(self.local.addr);
        }
        if let Some(addr) = self.cached_address(verifying_key).await {
            debug!(addr = %addr, "Key resolved from cache");
            return Some(addr);
        }

        let target = NodeId::from_verifying_key(verifying_key);
        let (known, mut frontier) = {
            let table = self.table.lock().await;
            (
                table.get(&target).cloned(),
                table.find_closest(&target, self.config.k),
            )
        };
        if let Some(node) = known.filter(|n| n.verifying_key == *verifying_key) {
            return Some(self.remember(verifying_key, node.addr).await);
        }

        let mut processed: HashSet<[u8; 32]> = HashSet::from([self.local.verifying_key]);
        while !frontier.is_empty() {
            let candidate = frontier.remove(0);
            if !processed.insert(candidate.verifying_key) {
                continue;
            }
            let Some(found) = self.transport.find_node(&candidate, target).await else {
                self.record_failure(&candidate).await;
                continue;
            };
            self.table.lock().await.touch(&candidate.node_id);
            if let Some(hit) = found.iter().find(|n| n.verifying_key == *verifying_key) {
                return Some(self.remember(verifying_key, hit.addr).await);
            }
            frontier.extend(
                found
                    .into_iter()
                    .filter(|n| !processed.contains(&n.verifying_key)),
            );
            frontier.sort_by_key(|n| n.node_id.distance(&target));
            frontier.dedup_by(|a, b| a.verifying_key == b.verifying_key);
        }

        debug!(target = %target, "Key not found after exhausting the frontier");
        None
    }

    async fn remember(&self, verifying_key: &[u8; 32], addr: SocketAddr) -> SocketAddr {
        debug!(addr = %addr, "Key resolved");
        self.cache.lock().await.insert(*verifying_key, addr);
        addr
    }

    /// The cached address of `verifying_key`, without touching the network.
    pub async fn cached_address(&self, verifying_key: &[u8; 32]) -> Option<SocketAddr> {
        self.cache.lock().await.get(verifying_key).copied()
    }

    /// The known nodes nearest the local id; what a restarted node should
    /// bootstrap from.
    pub async fn bootstrappable_neighbors(&self) -> Vec<NodeInfo> {
        self.table
            .lock()
            .await
            .find_closest(&self.local.node_id, self.config.k)
    }

    /// Every node in the routing table.
    pub async fn routing_table_nodes(&self) -> Vec<NodeInfo> {
        self.table.lock().await.nodes()
    }

    /// `(bucket index, entries)` for every non-empty bucket.
    pub async fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.table.lock().await.bucket_sizes()
    }

    /// Snapshot `{k, alpha, node id, neighbors}` to `path`.
    ///
    /// Returns `Ok(false)` without writing when there are no neighbors.
    pub async fn save_state(&self, path: &Path) -> Result<bool> {
        let neighbors = self.bootstrappable_neighbors().await;
        if neighbors.is_empty() {
            warn!("No known neighbors, not writing DHT state");
            return Ok(false);
        }
        let state = NetworkState {
            k: self.config.k,
            alpha: self.config.alpha,
            node_id: self.local.node_id,
            neighbors,
        };
        state.write(path).await?;
        info!(path = %path.display(), neighbors = state.neighbors.len(), "Saved DHT state");
        Ok(true)
    }

    /// Start the refresh loop.
    pub async fn spawn_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = async {
                        let refreshed = this.refresh_once().await;
                        debug!(buckets = refreshed, "Routing table refresh pass done");
                        tokio::time::sleep(this.config.refresh_interval).await;
                    } => {}
                }
            }
            debug!("Refresh loop stopped");
        });
        self.tasks.lock().await.push(handle);
    }

    /// Start saving state to `path` every `frequency`, beginning now.
    pub async fn spawn_periodic_save(self: &Arc<Self>, path: PathBuf, frequency: Duration) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = async {
                        if let Err(e) = this.save_state(&path).await {
                            error!(path = %path.display(), error = %e, "Failed to save DHT state");
                        }
                        tokio::time::sleep(frequency).await;
                    } => {}
                }
            }
            debug!("Periodic save loop stopped");
        });
        self.tasks.lock().await.push(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every background task, wait for each to exit, then release
    /// the transport.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "DHT task ended abnormally");
            }
        }
        self.transport.close().await;
        info!(tasks = count, "DHT network stopped");
    }
}

impl Network<UdpRpc> {
    /// Start answering `PING` and `FIND_NODE` requests.
    ///
    /// Every requester is offered to the routing table in its own task, since
    /// admission may have to wait for a liveness ping.
    pub async fn spawn_listener(self: &Arc<Self>) -> Result<()> {
        let Some(mut requests) = self.transport.take_requests().await else {
            return Err(DhtError::InvalidConfig(
                "DHT listener already started".to_string(),
            ));
        };
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut admissions = JoinSet::new();
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                this.answer(&request).await;
                let network = Arc::clone(&this);
                admissions.spawn(async move { network.admit_responsive(request.requester).await });
                while admissions.try_join_next().is_some() {}
            }
            admissions.shutdown().await;
            debug!("DHT listener stopped");
        });
        self.tasks.lock().await.push(handle);
        info!(addr = %self.local.addr, "DHT listening");
        Ok(())
    }

    async fn answer(&self, request: &InboundRequest) {
        let sender = self.local.descriptor();
        let reply = match &request.message {
            TypedMessage::Ping(_) => TypedMessage::Pong(Pong { sender }),
            TypedMessage::FindNode(find) => {
                let target = NodeId(find.target);
                let nodes = self
                    .table
                    .lock()
                    .await
                    .find_closest(&target, self.config.k + 1)
                    .into_iter()
                    .filter(|n| *n != request.requester)
                    .take(self.config.k)
                    .map(|n| n.descriptor())
                    .collect();
                TypedMessage::FindNodeResponse(FindNodeResponse { sender, nodes })
            }
            TypedMessage::Pong(_) | TypedMessage::FindNodeResponse(_) => return,
        };
        if let Err(e) = self.transport.respond(request, &reply).await {
            warn!(to = %request.from, error = %e, "Failed to answer DHT request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{sim_node, SimNetwork};

    fn config(k: usize) -> NetworkConfig {
        NetworkConfig {
            k,
            alpha: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_parameters_rejected() {
        let local = sim_node(1);
        assert!(matches!(
            Network::new(config(0), local.clone(), SimNetwork::new(1)),
            Err(DhtError::InvalidConfig(_))
        ));
        let zero_alpha = NetworkConfig {
            alpha: 0,
            ..Default::default()
        };
        assert!(Network::new(zero_alpha, local, SimNetwork::new(1)).is_err());
    }

    /// `count` nodes that all fall into bucket 0 of `local`'s table.
    fn far_bucket_nodes(local: &NodeInfo, count: usize) -> Vec<NodeInfo> {
        let table = RoutingTable::new(local.node_id, 1);
        (2..2000u16)
            .map(sim_node)
            .filter(|n| table.bucket_index(&n.node_id) == Some(0))
            .take(count)
            .collect()
    }

    async fn full_bucket_network(k: usize, lrs_dead: bool) -> (Network<SimNetwork>, Vec<NodeInfo>) {
        let local = sim_node(1);
        let nodes = far_bucket_nodes(&local, k + 1);
        assert_eq!(nodes.len(), k + 1);

        let mut net = SimNetwork::new(k);
        for node in &nodes {
            net.add_peer(node.clone(), Vec::new());
        }
        if lrs_dead {
            net.kill(nodes[0].node_id);
        }
        let network = Network::new(config(k), local, net).expect("network");
        for member in &nodes[..k] {
            network.admit(member.clone()).await;
        }
        (network, nodes)
    }

    #[tokio::test]
    async fn test_full_bucket_with_live_lrs_unchanged() {
        let k = 3;
        let (network, nodes) = full_bucket_network(k, false).await;
        let before = network.routing_table_nodes().await;
        network.admit(nodes[k].clone()).await;

        assert_eq!(network.routing_table_nodes().await.len(), k);
        assert!(!network.routing_table_nodes().await.contains(&nodes[k]));
        assert_eq!(network.transport().calls(), 1);
        let mut after = network.routing_table_nodes().await;
        after.sort_by_key(|n| n.node_id);
        let mut before = before;
        before.sort_by_key(|n| n.node_id);
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_full_bucket_with_dead_lrs_evicts_it() {
        let k = 3;
        let (network, nodes) = full_bucket_network(k, true).await;
        network.admit(nodes[k].clone()).await;

        let table = network.routing_table_nodes().await;
        assert_eq!(table.len(), k);
        assert!(table.contains(&nodes[k]));
        assert!(!table.contains(&nodes[0]));
        assert!(table.contains(&nodes[1]) && table.contains(&nodes[2]));
    }

    #[tokio::test]
    async fn test_bootstrap_fills_table() {
        let peers: Vec<NodeInfo> = (2..=12).map(sim_node).collect();
        let network = Network::new(config(20), sim_node(1), SimNetwork::mesh(&peers, 20))
            .expect("network");

        let result = network.bootstrap(&peers[..1]).await;
        assert!(result.success());
        assert_eq!(network.routing_table_nodes().await.len(), peers.len());
        assert_eq!(network.bootstrappable_neighbors().await.len(), peers.len());
    }

    #[tokio::test]
    async fn test_probe_address_admits_node() {
        let peer = sim_node(5);
        let mut net = SimNetwork::new(20);
        net.add_peer(peer.clone(), Vec::new());
        let network = Network::new(config(20), sim_node(1), net).expect("network");

        assert_eq!(network.probe_address(peer.addr).await, Some(peer.clone()));
        assert!(network.routing_table_nodes().await.contains(&peer));
        assert!(network
            .probe_address("10.9.9.9:1".parse().expect("addr"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_lookup_own_key_and_cache() {
        let local = sim_node(1);
        let peers: Vec<NodeInfo> = (2..=30).map(sim_node).collect();
        let wanted = peers[20].clone();
        // The local node only knows peer 2; everyone else is reachable through it.
        let mut net = SimNetwork::mesh(&peers, 5);
        net.add_peer(local.clone(), Vec::new());
        let network = Network::new(config(5), local.clone(), net).expect("network");
        network.admit(peers[0].clone()).await;

        assert_eq!(network.lookup(&local.verifying_key).await, Some(local.addr));
        assert_eq!(network.transport().calls(), 0);

        let addr = network.lookup(&wanted.verifying_key).await;
        assert_eq!(addr, Some(wanted.addr));
        let calls = network.transport().calls();
        assert!(calls > 0);

        assert_eq!(network.lookup(&wanted.verifying_key).await, Some(wanted.addr));
        assert_eq!(network.transport().calls(), calls);
    }

    #[tokio::test]
    async fn test_lookup_miss_leaves_no_cache_entry() {
        let peers: Vec<NodeInfo> = (2..=10).map(sim_node).collect();
        let network = Network::new(config(20), sim_node(1), SimNetwork::mesh(&peers, 20))
            .expect("network");
        for peer in &peers {
            network.admit(peer.clone()).await;
        }
        let stranger = sim_node(999);

        assert_eq!(network.lookup(&stranger.verifying_key).await, None);
        assert_eq!(network.cached_address(&stranger.verifying_key).await, None);
        // Every known peer was asked exactly once.
        assert_eq!(network.transport().calls(), peers.len());
    }

    #[tokio::test]
    async fn test_lookup_found_in_table_without_network() {
        let peer = sim_node(4);
        let network =
            Network::new(config(20), sim_node(1), SimNetwork::new(20)).expect("network");
        network.admit(peer.clone()).await;

        assert_eq!(network.lookup(&peer.verifying_key).await, Some(peer.addr));
        assert_eq!(network.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_once_crawls_stale_buckets() {
        let peers: Vec<NodeInfo> = (2..=20).map(sim_node).collect();
        let cfg = NetworkConfig {
            refresh_interval: Duration::ZERO,
            ..config(20)
        };
        let network =
            Network::new(cfg, sim_node(1), SimNetwork::mesh(&peers, 20)).expect("network");
        network.admit(peers[0].clone()).await;

        let refreshed = network.refresh_once().await;
        assert_eq!(refreshed, 1);
        assert!(network.transport().calls() > 0);
        assert!(network.routing_table_nodes().await.contains(&peers[0]));

        let fresh = NetworkConfig {
            refresh_interval: Duration::from_secs(3600),
            ..config(20)
        };
        let quiet =
            Network::new(fresh, sim_node(1), SimNetwork::mesh(&peers, 20)).expect("network");
        quiet.admit(peers[0].clone()).await;
        assert_eq!(quiet.refresh_once().await, 0);
    }

    #[tokio::test]
    async fn test_iterative_find_node_admits_responders() {
        let peers: Vec<NodeInfo> = (2..=25).map(sim_node).collect();
        let network = Network::new(config(8), sim_node(1), SimNetwork::mesh(&peers, 8))
            .expect("network");
        network.admit(peers[0].clone()).await;

        let target = peers[10].node_id;
        let found = network.iterative_find_node(target).await;
        assert_eq!(found.first(), Some(&peers[10]));
        assert!(!found.is_empty() && found.len() <= 8);
        assert!(network.routing_table_nodes().await.len() > 1);
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dht-state.json");
        let peers: Vec<NodeInfo> = (2..=6).map(sim_node).collect();

        let empty = Network::new(config(4), sim_node(1), SimNetwork::mesh(&peers, 4))
            .expect("network");
        assert!(!empty.save_state(&path).await.expect("save"));
        assert!(!path.exists());

        let network = Network::new(config(4), sim_node(1), SimNetwork::mesh(&peers, 4))
            .expect("network");
        for peer in &peers {
            network.admit(peer.clone()).await;
        }
        assert!(network.save_state(&path).await.expect("save"));

        let restored = Network::load_state(
            &path,
            NetworkConfig::default(),
            sim_node(1),
            SimNetwork::mesh(&peers, 4),
        )
        .await
        .expect("load");
        assert_eq!(restored.config().k, 4);
        assert_eq!(restored.config().alpha, 3);
        assert!(restored.transport().calls() > 0);
        assert!(!restored.routing_table_nodes().await.is_empty());

        let stranger = Network::load_state(
            &path,
            NetworkConfig::default(),
            sim_node(2),
            SimNetwork::new(4),
        )
        .await;
        assert!(matches!(stranger, Err(DhtError::StateMismatch { .. })));
    }

    #[tokio::test]
    async fn test_stop_cancels_background_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peers: Vec<NodeInfo> = (2..=4).map(sim_node).collect();
        let network = Arc::new(
            Network::new(config(20), sim_node(1), SimNetwork::mesh(&peers, 20))
                .expect("network"),
        );
        network.admit(peers[0].clone()).await;

        network.spawn_refresh().await;
        network
            .spawn_periodic_save(dir.path().join("state.json"), Duration::from_secs(600))
            .await;

        tokio::time::timeout(Duration::from_secs(5), network.stop())
            .await
            .expect("stop completes");
        assert!(network.is_stopped());
        assert!(network.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_node_dropped_after_repeated_failures() {
        let peers: Vec<NodeInfo> = (2..=6).map(sim_node).collect();
        let dead = peers[0].clone();
        let net = SimNetwork::mesh(&peers, 20);
        net.kill(dead.node_id);
        let network = Network::new(config(20), sim_node(1), net).expect("network");
        for peer in &peers {
            network.admit(peer.clone()).await;
        }
        let stranger = sim_node(999);

        for missed in 1..MAX_FAILED_RPCS {
            assert_eq!(network.lookup(&stranger.verifying_key).await, None);
            assert_eq!(network.failures(&dead.node_id).await, Some(missed));
            assert!(network.routing_table_nodes().await.contains(&dead));
        }

        // The crawl seeds from the table, so the dead node is asked first.
        network.iterative_find_node(dead.node_id).await;
        let table = network.routing_table_nodes().await;
        assert!(!table.contains(&dead));
        assert_eq!(table.len(), peers.len() - 1);
        assert_eq!(network.failures(&dead.node_id).await, None);
    }

    #[tokio::test]
    async fn test_answer_clears_failure_count() {
        let peers: Vec<NodeInfo> = (2..=4).map(sim_node).collect();
        let flaky = peers[0].clone();
        let network = Network::new(config(20), sim_node(1), SimNetwork::mesh(&peers, 20))
            .expect("network");
        for peer in &peers {
            network.admit(peer.clone()).await;
        }
        let stranger = sim_node(999);

        network.transport().kill(flaky.node_id);
        for _ in 1..MAX_FAILED_RPCS {
            network.lookup(&stranger.verifying_key).await;
        }
        assert_eq!(
            network.failures(&flaky.node_id).await,
            Some(MAX_FAILED_RPCS - 1)
        );

        network.transport().revive(&flaky.node_id);
        network.lookup(&stranger.verifying_key).await;
        assert_eq!(network.failures(&flaky.node_id).await, Some(0));

        network.transport().kill(flaky.node_id);
        network.lookup(&stranger.verifying_key).await;
        assert_eq!(network.failures(&flaky.node_id).await, Some(1));
        assert!(network.routing_table_nodes().await.contains(&flaky));
    }

    #[tokio::test]
    async fn test_failed_bootstrap_counts_against_known_seed() {
        let seed = sim_node(2);
        let net = SimNetwork::mesh(&[seed.clone(), sim_node(3)], 20);
        net.kill(seed.node_id);
        let network = Network::new(config(20), sim_node(1), net).expect("network");
        network.admit(seed.clone()).await;

        for _ in 0..MAX_FAILED_RPCS {
            assert!(!network.bootstrap(&[seed.clone()]).await.success());
        }
        assert!(network.routing_table_nodes().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_repeats_after_interval() {
        let interval = Duration::from_secs(60);
        let peers: Vec<NodeInfo> = (2..=8).map(sim_node).collect();
        let cfg = NetworkConfig {
            refresh_interval: interval,
            ..config(20)
        };
        let network = Arc::new(
            Network::new(cfg, sim_node(1), SimNetwork::mesh(&peers, 20)).expect("network"),
        );
        network.admit(peers[0].clone()).await;

        // Buckets are fresh at start, so the first pass sends nothing.
        network.spawn_refresh().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(network.transport().calls(), 0);

        tokio::time::sleep(interval).await;
        let after_first = network.transport().calls();
        assert!(after_first > 0, "a pass should run once the interval elapses");

        tokio::time::sleep(interval).await;
        assert!(
            network.transport().calls() > after_first,
            "the loop should run again after another interval"
        );

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save_rewrites_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dht_state.json");
        let frequency = Duration::from_secs(600);
        let peers: Vec<NodeInfo> = (2..=4).map(sim_node).collect();
        let network = Arc::new(
            Network::new(config(20), sim_node(1), SimNetwork::mesh(&peers, 20))
                .expect("network"),
        );
        network.admit(peers[0].clone()).await;

        network.spawn_periodic_save(path.clone(), frequency).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = NetworkState::read(&path).await.expect("first snapshot");
        assert_eq!(first.neighbors, vec![peers[0].clone()]);

        network.admit(peers[1].clone()).await;
        tokio::time::sleep(frequency).await;
        let second = NetworkState::read(&path).await.expect("second snapshot");
        assert_eq!(second.neighbors.len(), 2);
        assert!(second.neighbors.contains(&peers[1]));

        network.stop().await;
    }
}
