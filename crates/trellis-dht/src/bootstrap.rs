//! Two-hop bootstrap for joining the Trellis DHT.
//!
//! When a node starts, it must reach its seed peers to populate its routing
//! table. The bootstrap is deliberately shallow:
//!
//! 1. Ask every seed for the nodes closest to the local id.
//! 2. Ask every node learned in step 1 (that was not already asked) the
//!    same question once more.
//!
//! It does not iterate to convergence; that is the crawl's job (see
//! [`crate::lookup::crawl`]). Two hops are enough to get a working table
//! quickly, and the periodic refresh fills in the rest.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::{debug, info};

use crate::kademlia::{NodeId, NodeInfo};
use crate::rpc::DhtTransport;

/// The result of a bootstrap attempt.
#[derive(Clone, Debug, Default)]
pub struct BootstrapResult {
    /// Every node returned by either pass, deduplicated, local node excluded.
    pub nearest: Vec<NodeInfo>,
    /// Nodes that answered a query.
    pub responders: Vec<NodeInfo>,
    /// Nodes that were queried and did not answer.
    pub unresponsive: Vec<NodeInfo>,
    /// Number of `FIND_NODE` queries sent.
    pub queried: usize,
}

impl BootstrapResult {
    /// Whether at least one peer answered.
    pub fn success(&self) -> bool {
        !self.responders.is_empty()
    }
}

/// Bootstrap from `seeds` in two passes.
///
/// Seeds and discovered nodes are deduplicated by verifying key against a
/// processed set that starts out holding the local key, so the local node is
/// never queried and no peer is queried twice.
pub async fn two_hop_bootstrap<T: DhtTransport>(
    transport: &T,
    local: &NodeInfo,
    seeds: &[NodeInfo],
) -> BootstrapResult {
    info!(seed_count = seeds.len(), "Starting DHT bootstrap");

    let mut processed: HashSet<[u8; 32]> = HashSet::from([local.verifying_key]);
    let mut result = BootstrapResult::default();

    let first_pass: Vec<NodeInfo> = seeds
        .iter()
        .filter(|seed| processed.insert(seed.verifying_key))
        .cloned()
        .collect();
    query_all(transport, local.node_id, &first_pass, &mut result).await;

    let second_pass: Vec<NodeInfo> = result
        .nearest
        .iter()
        .filter(|node| processed.insert(node.verifying_key))
        .cloned()
        .collect();
    debug!(count = second_pass.len(), "Bootstrap second hop");
    query_all(transport, local.node_id, &second_pass, &mut result).await;

    let mut seen: HashSet<[u8; 32]> = HashSet::from([local.verifying_key]);
    result.nearest.retain(|node| seen.insert(node.verifying_key));

    info!(
        responders = result.responders.len(),
        discovered = result.nearest.len(),
        queried = result.queried,
        "Bootstrap complete"
    );
    result
}

async fn query_all<T: DhtTransport>(
    transport: &T,
    local_id: NodeId,
    nodes: &[NodeInfo],
    result: &mut BootstrapResult,
) {
    let queries: Vec<_> = nodes
        .iter()
        .map(|node| transport.find_node(node, local_id))
        .collect();
    let replies = join_all(queries).await;
    result.queried += nodes.len();
    for (node, reply) in nodes.iter().zip(replies) {
        match reply {
            Some(found) => {
                result.responders.push(node.clone());
                result.nearest.extend(found);
            }
            None => {
                debug!(addr = %node.addr, "Bootstrap peer did not answer");
                result.unresponsive.push(node.clone());
            }
        }
    }
}
