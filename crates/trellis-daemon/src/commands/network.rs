//! Address resolution and overlay inspection.

use std::sync::Arc;

use serde_json::Value;

use crate::rpc::RpcError;
use crate::DaemonState;

type Result = std::result::Result<Value, RpcError>;

/// Resolve a verifying key to the address of the node holding it.
pub async fn resolve(state: &Arc<DaemonState>, params: &Value) -> Result {
    let key_hex = params
        .get("verifying_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("verifying_key required"))?;
    let verifying_key: [u8; 32] = hex::decode(key_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| RpcError::invalid_params("verifying_key must be 64 hex chars"))?;

    let address = state.network.lookup(&verifying_key).await;
    Ok(serde_json::json!({
        "verifying_key": key_hex,
        "found": address.is_some(),
        "address": address.map(|a| a.to_string()),
    }))
}

/// Routing table summary and every neighbor in it.
pub async fn routing_table(state: &Arc<DaemonState>) -> Result {
    let local = state.network.local_node();
    let neighbors = state.network.routing_table_nodes().await;
    let buckets: Vec<Value> = state
        .network
        .bucket_sizes()
        .await
        .into_iter()
        .map(|(index, size)| serde_json::json!({"index": index, "size": size}))
        .collect();
    let neighbors = serde_json::to_value(&neighbors)
        .map_err(|e| RpcError::internal_error(&format!("serialize error: {e}")))?;

    Ok(serde_json::json!({
        "node_id": local.node_id.to_hex(),
        "address": local.addr.to_string(),
        "size": buckets.iter().filter_map(|b| b["size"].as_u64()).sum::<u64>(),
        "buckets": buckets,
        "neighbors": neighbors,
    }))
}

/// The verifying keys and addresses found by discovery.
pub async fn discovered(state: &Arc<DaemonState>) -> Result {
    let nodes: serde_json::Map<String, Value> = state
        .discovery
        .discovered_nodes()
        .await
        .into_iter()
        .map(|(key, addr)| (hex::encode(key), Value::String(addr.to_string())))
        .collect();

    Ok(serde_json::json!({
        "count": nodes.len(),
        "master": state.discovery.is_master(),
        "nodes": nodes,
    }))
}
