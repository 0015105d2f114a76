//! Iterative `FIND_NODE` lookup (crawl).
//!
//! Each round queries up to `alpha` of the closest uncontacted candidates
//! concurrently and waits for all of them before deciding whether to go on.
//! The crawl stops when a round brings in nothing strictly closer than the
//! best candidate known before the round, or when no uncontacted candidate is
//! left. Peers that do not answer are dropped from the shortlist.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::debug;

use crate::kademlia::{NodeId, NodeInfo};
use crate::rpc::DhtTransport;

/// Shortlist state for one lookup.
pub struct FindNodeLookup {
    target: NodeId,
    /// Never queried or re-added: the local node and every node already contacted.
    queried: HashSet<NodeId>,
    /// Sorted by distance to the target, deduplicated by id.
    candidates: Vec<LookupCandidate>,
    result_count: usize,
}

#[derive(Clone, Debug)]
struct LookupCandidate {
    info: NodeInfo,
    distance: NodeId,
    contacted: bool,
}

impl FindNodeLookup {
    /// Start a lookup from `seed_nodes`. `local_id` is never queried.
    pub fn new(target: NodeId, local_id: NodeId, seed_nodes: Vec<NodeInfo>, k: usize) -> Self {
        let mut lookup = Self {
            target,
            queried: HashSet::from([local_id]),
            candidates: Vec::new(),
            result_count: k,
        };
        lookup.add_responses(seed_nodes);
        lookup
    }

    /// Pick up to `alpha` of the closest uncontacted candidates and mark them
    /// contacted. Empty when the shortlist is exhausted.
    pub fn next_queries(&mut self, alpha: usize) -> Vec<NodeInfo> {
        let mut batch = Vec::with_capacity(alpha);
        for candidate in self.candidates.iter_mut().filter(|c| !c.contacted) {
            if batch.len() >= alpha {
                break;
            }
            candidate.contacted = true;
            self.queried.insert(candidate.info.node_id);
            batch.push(candidate.info.clone());
        }
        batch
    }

    /// Merge nodes returned by a peer.
    pub fn add_responses(&mut self, new_nodes: Vec<NodeInfo>) {
        for info in new_nodes {
            if self.queried.contains(&info.node_id)
                || self.candidates.iter().any(|c| c.info.node_id == info.node_id)
            {
                continue;
            }
            let distance = info.node_id.distance(&self.target);
            self.candidates.push(LookupCandidate {
                info,
                distance,
                contacted: false,
            });
        }
        self.candidates.sort_by(|a, b| a.distance.cmp(&b.distance));
        self.candidates.truncate(self.result_count * 3);
    }

    /// Drop a peer that failed to answer.
    pub fn mark_unresponsive(&mut self, node_id: &NodeId) {
        self.candidates.retain(|c| c.info.node_id != *node_id);
    }

    /// Distance of the closest candidate, contacted or not.
    pub fn best_distance(&self) -> Option<NodeId> {
        self.candidates.first().map(|c| c.distance)
    }

    /// The k closest candidates, whether or not they were contacted.
    pub fn results(&self) -> Vec<NodeInfo> {
        self.candidates
            .iter()
            .take(self.result_count)
            .map(|c| c.info.clone())
            .collect()
    }
}

/// What a crawl found.
#[derive(Clone, Debug, Default)]
pub struct CrawlOutcome {
    /// Up to k nodes closest to the target, nearest first.
    pub closest: Vec<NodeInfo>,
    /// Peers that answered a query.
    pub responded: Vec<NodeInfo>,
    /// Peers that were queried and did not answer.
    pub unresponsive: Vec<NodeInfo>,
    pub rounds: usize,
}

/// Find the `k` nodes closest to `target`, starting from `seeds`.
pub async fn crawl<T: DhtTransport>(
    transport: &T,
    local_id: NodeId,
    target: NodeId,
    seeds: Vec<NodeInfo>,
    k: usize,
    alpha: usize,
) -> CrawlOutcome {
    let mut lookup = FindNodeLookup::new(target, local_id, seeds, k);
    let mut outcome = CrawlOutcome::default();

    loop {
        let best_before = lookup.best_distance();
        let batch = lookup.next_queries(alpha);
        if batch.is_empty() {
            break;
        }
        outcome.rounds += 1;

        let queries: Vec<_> = batch
            .iter()
            .map(|node| transport.find_node(node, target))
            .collect();
        let replies = join_all(queries).await;
        for (node, reply) in batch.into_iter().zip(replies) {
            match reply {
                Some(nodes) => {
                    lookup.add_responses(nodes);
                    outcome.responded.push(node);
                }
                None => {
                    lookup.mark_unresponsive(&node.node_id);
                    outcome.unresponsive.push(node);
                }
            }
        }

        let improved = match (lookup.best_distance(), best_before) {
            (Some(now), Some(before)) => now < before,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !improved {
            break;
        }
    }

    outcome.closest = lookup.results();
    debug!(
        target = %target,
        rounds = outcome.rounds,
        found = outcome.closest.len(),
        "Crawl finished"
    );
    outcome
}
