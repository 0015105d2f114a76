//! Integration test: DHT formation over loopback UDP.
//!
//! Exercises the network manager end to end:
//! 1. Start several nodes, each with its own socket and listener
//! 2. Bootstrap every node from one seed
//! 3. Verify the seed learns every requester
//! 4. Resolve verifying keys, with and without a hit
//! 5. Crawl for a node id
//! 6. Restart a node from its saved state
//! 7. Stop nodes and verify they go quiet
//!
//! This test uses trellis-dht (network, rpc, state) and trellis-crypto
//! (ed25519) over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use trellis_crypto::ed25519::KeyPair;
use trellis_dht::network::{Network, NetworkConfig};
use trellis_dht::rpc::{DhtTransport, UdpRpc};

const RPC_TIMEOUT: Duration = Duration::from_millis(500);

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn config() -> NetworkConfig {
    NetworkConfig {
        k: 8,
        alpha: 3,
        rpc_timeout: RPC_TIMEOUT,
        refresh_interval: Duration::from_secs(3600),
    }
}

/// Bind a fresh node on loopback and start answering requests.
async fn start_node() -> Arc<Network<UdpRpc>> {
    let verifying_key = KeyPair::generate().verifying_key.to_bytes();
    start_node_with_key(verifying_key).await
}

async fn start_node_with_key(verifying_key: [u8; 32]) -> Arc<Network<UdpRpc>> {
    let rpc = UdpRpc::bind(loopback(), verifying_key, RPC_TIMEOUT)
        .await
        .expect("bind");
    let local = rpc.local_node().clone();
    let network = Arc::new(Network::new(config(), local, rpc).expect("network"));
    network.spawn_listener().await.expect("listener");
    network
}

/// Admissions run in the background; poll until the table has filled up.
async fn wait_for_table(network: &Network<UdpRpc>, at_least: usize) -> bool {
    for _ in 0..100 {
        if network.routing_table_nodes().await.len() >= at_least {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
#[ignore]
async fn udp_cluster_bootstraps_and_resolves() {
    // =========================================================
    // Step 1: Start 8 nodes
    // =========================================================
    let mut nodes = Vec::new();
    for _ in 0..8 {
        nodes.push(start_node().await);
    }
    let seed = nodes[0].local_node().clone();

    // =========================================================
    // Step 2: Everyone bootstraps from node 0
    // =========================================================
    for node in &nodes[1..] {
        let result = node.bootstrap(&[seed.clone()]).await;
        assert!(result.success(), "seed should answer the bootstrap");
        assert!(
            node.routing_table_nodes().await.contains(&seed),
            "bootstrapping node should keep the seed"
        );
    }

    // =========================================================
    // Step 3: The seed learned every requester
    // =========================================================
    assert!(
        wait_for_table(&nodes[0], 7).await,
        "seed should have admitted all 7 requesters"
    );
    for node in &nodes[1..] {
        assert!(nodes[0]
            .routing_table_nodes()
            .await
            .contains(node.local_node()));
    }

    // =========================================================
    // Step 4: Resolve keys
    // =========================================================
    let target = nodes[1].local_node().clone();
    assert_eq!(
        nodes[7].lookup(&target.verifying_key).await,
        Some(target.addr)
    );
    assert_eq!(
        nodes[7].cached_address(&target.verifying_key).await,
        Some(target.addr),
        "a hit should be cached"
    );

    let stranger = KeyPair::generate().verifying_key.to_bytes();
    assert_eq!(nodes[4].lookup(&stranger).await, None);
    assert_eq!(
        nodes[4].cached_address(&stranger).await,
        None,
        "a miss must not be cached"
    );

    // =========================================================
    // Step 5: Crawl for a node id
    // =========================================================
    let wanted = nodes[5].local_node().clone();
    let closest = nodes[3].iterative_find_node(wanted.node_id).await;
    assert!(closest.len() <= 8);
    assert_eq!(closest.first(), Some(&wanted), "exact match should come first");

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
#[ignore]
async fn restart_from_saved_state() {
    let a = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    b.bootstrap(&[a.local_node().clone()]).await;
    c.bootstrap(&[a.local_node().clone()]).await;
    assert!(wait_for_table(&a, 2).await);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dht_state.json");
    assert!(c.save_state(&path).await.expect("save"));

    let key = c.local_node().verifying_key;
    let old_id = c.local_node().node_id;
    c.stop().await;

    // Same key, new port.
    let rpc = UdpRpc::bind(loopback(), key, RPC_TIMEOUT)
        .await
        .expect("bind");
    let local = rpc.local_node().clone();
    let restarted = Network::load_state(&path, NetworkConfig::default(), local, rpc)
        .await
        .expect("load");

    assert_eq!(restarted.local_node().node_id, old_id);
    assert_eq!(restarted.config().k, 8, "k comes from the snapshot");
    assert!(restarted
        .routing_table_nodes()
        .await
        .contains(a.local_node()));

    // Someone else's snapshot is refused.
    let other = UdpRpc::bind(loopback(), KeyPair::generate().verifying_key.to_bytes(), RPC_TIMEOUT)
        .await
        .expect("bind");
    let other_local = other.local_node().clone();
    assert!(Network::load_state(&path, NetworkConfig::default(), other_local, other)
        .await
        .is_err());

    restarted.stop().await;
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
#[ignore]
async fn stopped_node_goes_quiet() {
    let a = start_node().await;
    let b = start_node().await;

    assert!(b.transport().ping(a.local_node()).await);
    assert!(b.probe_address(a.local_node().addr).await.is_some());

    a.stop().await;
    assert!(a.is_stopped());
    assert!(!b.transport().ping(a.local_node()).await);

    b.stop().await;
}
