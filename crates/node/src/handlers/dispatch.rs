//! Dispatch endpoints: assignment intake on every node, report intake
//! on the leader.

use axum::extract::{Path, State};
use axum::Json;
use midrender_core::manifest::JobManifest;
use midrender_core::types::{ChunkRange, NodeState};
use serde::Deserialize;
use serde_json::json;

use crate::engine::{CompletionReport, FailureReport, FrameReport};
use crate::error::{AppError, AppResult};
use crate::handlers::require_leader;
use crate::state::AppState;

/// Body of `POST /dispatch/assign`.
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub manifest: JobManifest,
    pub frame_start: i32,
    pub frame_end: i32,
}

/// POST /dispatch/assign -- the leader hands this worker one chunk.
///
/// 409 when busy or stopped (the leader reverts the chunk), 400 when
/// the manifest is invalid.
pub async fn post_assign(
    State(state): State<AppState>,
    Json(request): Json<AssignRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if state.coordinator.is_rendering().await {
        return Err(AppError::Busy("busy"));
    }
    if state.registry.node_state().await == NodeState::Stopped
        || state.coordinator.is_stopped().await
    {
        return Err(AppError::Busy("stopped"));
    }

    request.manifest.validate()?;
    if request.frame_start > request.frame_end {
        return Err(AppError::BadRequest("frame_start > frame_end".into()));
    }

    let chunk = ChunkRange::new(request.frame_start, request.frame_end);
    let job_id = request.manifest.job_id.clone();
    state.coordinator.dispatch(request.manifest, chunk).await;
    tracing::info!(job_id = %job_id, chunk = %chunk, "Assignment accepted");

    Ok(Json(json!({"status": "ok"})))
}

/// Body of `POST /dispatch/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    #[serde(default)]
    pub elapsed_ms: i64,
    #[serde(default)]
    pub exit_code: i32,
}

/// POST /dispatch/complete -- a worker reports a finished chunk.
pub async fn post_complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> AppResult<Json<serde_json::Value>> {
    require_leader(&state).await?;

    state
        .engine
        .queue_completion(CompletionReport {
            node_id: request.node_id,
            job_id: request.job_id,
            frame_start: request.frame_start,
            frame_end: request.frame_end,
            elapsed_ms: request.elapsed_ms,
            exit_code: request.exit_code,
        })
        .await;

    Ok(Json(json!({"status": "ok"})))
}

/// Body of `POST /dispatch/failed`.
#[derive(Debug, Deserialize)]
pub struct FailedRequest {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    #[serde(default = "default_error")]
    pub error: String,
}

fn default_error() -> String {
    "Unknown".to_string()
}

/// POST /dispatch/failed -- a worker reports a failed chunk.
pub async fn post_failed(
    State(state): State<AppState>,
    Json(request): Json<FailedRequest>,
) -> AppResult<Json<serde_json::Value>> {
    require_leader(&state).await?;

    state
        .engine
        .queue_failure(FailureReport {
            node_id: request.node_id,
            job_id: request.job_id,
            frame_start: request.frame_start,
            frame_end: request.frame_end,
            error: request.error,
        })
        .await;

    Ok(Json(json!({"status": "ok"})))
}

/// Body of `POST /dispatch/frame-complete`.
#[derive(Debug, Deserialize)]
pub struct FrameCompleteRequest {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frames: Vec<i32>,
}

/// POST /dispatch/frame-complete -- batched per-frame completions.
pub async fn post_frame_complete(
    State(state): State<AppState>,
    Json(request): Json<FrameCompleteRequest>,
) -> AppResult<Json<serde_json::Value>> {
    require_leader(&state).await?;

    for frame in request.frames {
        state
            .engine
            .queue_frame(FrameReport {
                node_id: request.node_id.clone(),
                job_id: request.job_id.clone(),
                frame,
            })
            .await;
    }

    Ok(Json(json!({"status": "ok"})))
}

/// POST /nodes/{id}/unsuspend -- operator clears a suspended node.
pub async fn post_unsuspend(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    require_leader(&state).await?;
    state.engine.clear_suspension(&node_id).await;
    Ok(Json(json!({"status": "ok"})))
}
