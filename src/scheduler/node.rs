//! Node identity and registration in the shared node table.

use crate::job_store::{now_millis, JobStore, JobStoreResult, NodeInfo};
use std::sync::Arc;
use tracing::{info, warn};

/// Hostname of this machine, or "unknown".
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `<hostname>-<8 hex chars>`, unique per process start.
pub fn generate_node_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", local_hostname(), &suffix[..8])
}

/// This node's row in the node table.
pub struct NodeRegistration {
    store: Arc<dyn JobStore>,
    info: NodeInfo,
}

impl NodeRegistration {
    pub fn new(store: Arc<dyn JobStore>, info: NodeInfo) -> Self {
        Self { store, info }
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn register(&mut self) -> JobStoreResult<()> {
        self.info.last_heartbeat = now_millis();
        self.store.register_node(&self.info)?;
        info!(
            "Registered node {} (host: {}, capacity: {})",
            self.info.node_id, self.info.hostname, self.info.capacity
        );
        Ok(())
    }

    /// Refresh the heartbeat, re-registering if another node pruned our row.
    pub fn heartbeat(&mut self) -> JobStoreResult<()> {
        if self.store.heartbeat_node(&self.info.node_id)? {
            self.info.last_heartbeat = now_millis();
            return Ok(());
        }
        warn!(
            "Node row for {} disappeared, registering again",
            self.info.node_id
        );
        self.register()
    }

    pub fn deregister(&self) -> JobStoreResult<()> {
        self.store.deregister_node(&self.info.node_id)?;
        info!("Deregistered node {}", self.info.node_id);
        Ok(())
    }
}
