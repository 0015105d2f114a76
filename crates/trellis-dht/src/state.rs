//! Persisted routing snapshot.
//!
//! A node that restarts can rejoin faster by bootstrapping from the neighbors
//! it knew before going down. The snapshot is a small JSON document:
//!
//! ```json
//! { "k": 20, "alpha": 3, "node_id": "<40 hex chars>", "neighbors": [ ... ] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::kademlia::{NodeId, NodeInfo};
use crate::Result;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkState {
    pub k: usize,
    pub alpha: usize,
    pub node_id: NodeId,
    pub neighbors: Vec<NodeInfo>,
}

impl NetworkState {
    /// Write the snapshot, replacing any previous one atomically.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::sim_node;
    use crate::DhtError;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        let state = NetworkState {
            k: 4,
            alpha: 2,
            node_id: sim_node(1).node_id,
            neighbors: vec![sim_node(2), sim_node(3)],
        };

        state.write(&path).await.expect("write");
        let restored = NetworkState::read(&path).await.expect("read");

        assert_eq!(restored.k, 4);
        assert_eq!(restored.alpha, 2);
        assert_eq!(restored.node_id, state.node_id);
        assert_eq!(restored.neighbors, state.neighbors);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        assert!(matches!(
            NetworkState::read(&missing).await,
            Err(DhtError::Io(_))
        ));

        let corrupt = dir.path().join("corrupt.json");
        tokio::fs::write(&corrupt, b"{not json").await.expect("write");
        assert!(matches!(
            NetworkState::read(&corrupt).await,
            Err(DhtError::Serialization(_))
        ));
    }
}
