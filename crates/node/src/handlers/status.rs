//! Node-level endpoints: status, peers, remote stop/start.

use axum::extract::State;
use axum::Json;
use midrender_core::peer::PeerInfo;
use midrender_core::types::NodeState;
use serde_json::json;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /status -- this node's full peer record.
pub async fn get_status(State(state): State<AppState>) -> Json<PeerInfo> {
    Json(state.registry.local_info().await)
}

/// GET /peers -- registry snapshot of all known peers.
pub async fn get_peers(State(state): State<AppState>) -> Json<Vec<PeerInfo>> {
    Json(state.registry.snapshot().await)
}

/// POST /node/stop -- remotely stop rendering on this node. Stopping
/// aborts the active render and blocks new dispatches.
pub async fn post_node_stop(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state.set_node_state(NodeState::Stopped).await;
    tracing::info!("Node stopped remotely");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /node/start -- remotely resume rendering on this node.
pub async fn post_node_start(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state.set_node_state(NodeState::Active).await;
    tracing::info!("Node started remotely");
    Ok(Json(json!({"status": "ok"})))
}
