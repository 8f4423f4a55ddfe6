//! Shared application state available to all Axum handlers.

use std::sync::Arc;

use midrender_agent::AgentSupervisor;
use midrender_core::types::NodeState;
use midrender_mesh::PeerRegistry;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::engine::DispatchEngine;
use crate::farm::FarmPaths;
use crate::identity::NodeIdentity;
use crate::leader::LeaderState;
use crate::render::CoordinatorHandle;
use crate::reports::ReportQueue;

/// Persisted node-state flag: `{data_dir}/node_state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredNodeState {
    stopped: bool,
}

/// Shared application state. Cheaply cloneable -- every field is behind
/// an `Arc` or is already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub identity: Arc<NodeIdentity>,
    pub farm: Arc<FarmPaths>,
    pub registry: Arc<PeerRegistry>,
    pub leader: Arc<LeaderState>,
    pub engine: Arc<DispatchEngine>,
    pub coordinator: CoordinatorHandle,
    pub agent: Arc<AgentSupervisor>,
    pub reports: Arc<ReportQueue>,
    /// General-purpose HTTP client for leader-bound calls.
    pub http: reqwest::Client,
}

impl AppState {
    /// Flip the node between `active` and `stopped`, propagate to the
    /// registry and the render coordinator, and persist the choice so a
    /// stopped node stays stopped across restarts.
    pub async fn set_node_state(&self, state: NodeState) {
        self.registry.set_node_state(state).await;
        match state {
            NodeState::Stopped => {
                self.coordinator.set_stopped(true).await;
            }
            NodeState::Active => {
                self.coordinator.set_stopped(false).await;
            }
        }

        let stored = StoredNodeState {
            stopped: state == NodeState::Stopped,
        };
        if let Ok(json) = serde_json::to_string(&stored) {
            let path = self.config.data_dir.join("node_state.json");
            if let Err(e) = tokio::fs::write(&path, json).await {
                tracing::warn!(error = %e, "Failed to persist node state");
            }
        }
    }
}

/// Read the persisted stopped flag, defaulting to active.
pub async fn load_persisted_node_state(config: &NodeConfig) -> NodeState {
    let path = config.data_dir.join("node_state.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice::<StoredNodeState>(&bytes) {
            Ok(stored) if stored.stopped => NodeState::Stopped,
            _ => NodeState::Active,
        },
        Err(_) => NodeState::Active,
    }
}
