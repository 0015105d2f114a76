//! Daemon status and lifecycle.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::rpc::RpcError;
use crate::DaemonState;

type Result = std::result::Result<Value, RpcError>;

pub async fn status(state: &Arc<DaemonState>) -> Result {
    let local = state.network.local_node();
    Ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": local.node_id.to_hex(),
        "verifying_key": hex::encode(local.verifying_key),
        "dht_address": local.addr.to_string(),
        "discovery_address": state.discovery.local_addr().to_string(),
        "k": state.config.dht.k,
        "alpha": state.config.dht.alpha,
        "stopped": state.network.is_stopped(),
    }))
}

/// Ask the daemon to shut down.
pub async fn shutdown(state: &Arc<DaemonState>) -> Result {
    info!("Shutdown requested over control socket");
    state
        .shutdown_tx
        .send(())
        .map_err(|_| RpcError::internal_error("daemon is already shutting down"))?;
    Ok(serde_json::json!({"status": "shutting_down"}))
}
