//! trellisd: the Trellis overlay daemon.
//!
//! Runs discovery until a bootstrap quorum is found, joins the DHT through
//! the discovered peers, keeps the routing table fresh, and answers control
//! requests over a Unix socket until Ctrl-C or a `shutdown` request.

mod commands;
mod config;
mod rpc;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use trellis_dht::kademlia::NodeInfo;
use trellis_dht::network::{Network, NetworkConfig};
use trellis_dht::rpc::UdpRpc;
use trellis_dht::state::NetworkState;
use trellis_dht::DhtError;
use trellis_discovery::Discovery;

use crate::config::DaemonConfig;
use crate::rpc::RpcServer;

/// Daemon-wide shared state.
pub struct DaemonState {
    pub config: DaemonConfig,
    pub network: Arc<Network<UdpRpc>>,
    /// Kept running after startup so late joiners can still discover us.
    pub discovery: Arc<Discovery>,
    pub shutdown_tx: broadcast::Sender<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("trellis={}", config.advanced.log_level).parse()?),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Trellis daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let state_path = data_dir.join("dht_state.json");

    // 2. Identity and roster
    let keypair = config.keypair()?;
    let verifying_key = keypair.verifying_key.to_bytes();
    let roster = config.roster()?;

    // 3. Discovery
    let discovery = Discovery::bind(
        config.discovery_config()?,
        config.discovery_addr()?,
        verifying_key,
        &roster,
    )
    .await?;
    let outcome = discovery.discover_nodes(config.host_ip()?).await;
    if !outcome.success() {
        if !state_path.exists() {
            discovery.stop().await;
            bail!("discovery failed: {outcome:?}");
        }
        warn!(?outcome, "Discovery found no quorum; rejoining from saved state");
    }

    // 4. DHT
    let rpc = UdpRpc::bind(
        config.dht_addr()?,
        verifying_key,
        config.network_config().rpc_timeout,
    )
    .await?;
    let local = rpc.local_node().clone();
    info!(node_id = %local.node_id, addr = %local.addr, "DHT identity");

    let network =
        Arc::new(open_network(config.network_config(), local.clone(), rpc, &state_path).await?);
    network.spawn_listener().await?;

    let seeds = seeds_from_discovery(&discovery, &local, config.network.dht_port).await;
    if seeds.is_empty() {
        // Bootnodes are known by address only; learn their keys by pinging.
        for addr in config.discovery_config()?.bootnodes {
            let dht_addr = SocketAddr::new(addr.ip(), config.network.dht_port);
            if network.probe_address(dht_addr).await.is_none() {
                warn!(addr = %dht_addr, "Bootnode did not answer DHT ping");
            }
        }
    } else if !network.bootstrap(&seeds).await.success() {
        warn!(seeds = seeds.len(), "No discovered peer answered the DHT bootstrap");
    }

    network.spawn_refresh().await;
    network
        .spawn_periodic_save(state_path.clone(), config.save_interval())
        .await;

    // 5. Control socket
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let state = Arc::new(DaemonState {
        config,
        network: Arc::clone(&network),
        discovery: Arc::new(discovery),
        shutdown_tx: shutdown_tx.clone(),
    });
    let socket_path = data_dir.join("trellisd.sock");
    let rpc_server = RpcServer::new(state.clone(), socket_path.clone());

    // 6. Run until shutdown
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        result = rpc_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Control socket failed");
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    // Graceful shutdown
    if let Err(e) = network.save_state(&state_path).await {
        warn!(error = %e, "Final DHT state save failed");
    }
    network.stop().await;
    state.discovery.stop().await;
    let _ = std::fs::remove_file(&socket_path);

    info!("Daemon stopped");
    Ok(())
}

/// Rejoin from the saved snapshot when it belongs to this node, otherwise
/// start with an empty table. A bad snapshot is never fatal.
async fn open_network(
    config: NetworkConfig,
    local: NodeInfo,
    rpc: UdpRpc,
    state_path: &Path,
) -> anyhow::Result<Network<UdpRpc>> {
    match NetworkState::read(state_path).await {
        Ok(state) if state.node_id == local.node_id => {
            Ok(Network::load_state(state_path, config, local, rpc).await?)
        }
        Ok(state) => {
            warn!(found = %state.node_id, "DHT state belongs to another node, ignoring it");
            Ok(Network::new(config, local, rpc)?)
        }
        Err(DhtError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Network::new(config, local, rpc)?)
        }
        Err(e) => {
            warn!(error = %e, "Unreadable DHT state, starting fresh");
            Ok(Network::new(config, local, rpc)?)
        }
    }
}

/// Discovered peers as DHT seeds: same host, DHT port.
async fn seeds_from_discovery(
    discovery: &Discovery,
    local: &NodeInfo,
    dht_port: u16,
) -> Vec<NodeInfo> {
    discovery
        .discovered_nodes()
        .await
        .into_iter()
        .filter(|(key, _)| *key != local.verifying_key)
        .map(|(key, addr)| NodeInfo::new(key, SocketAddr::new(addr.ip(), dht_port)))
        .collect()
}
