//! Leader-only job endpoints: submission, listing, detail, and the
//! control operations (pause / resume / cancel / archive / retry-failed
//! / resubmit / delete).

use axum::extract::{Path, State};
use axum::Json;
use midrender_core::error::CoreError;
use midrender_core::manifest::JobManifest;
use midrender_core::types::JobState;
use midrender_db::models::JobSummary;
use midrender_db::repositories::{ChunkRepo, JobRepo};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::SubmitRequest;
use crate::error::AppResult;
use crate::handlers::require_leader;
use crate::state::AppState;

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub manifest: JobManifest,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    50
}

/// One row of `GET /jobs`.
#[derive(Debug, Serialize)]
pub struct JobListEntry {
    pub job_id: String,
    pub template_id: String,
    pub submitted_by: String,
    pub current_state: String,
    pub priority: i32,
    pub submitted_at_ms: i64,
    pub frame_start: i32,
    pub frame_end: i32,
    pub chunk_size: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub total_chunks: i64,
    pub completed_chunks: i64,
    pub failed_chunks: i64,
    pub rendering_chunks: i64,
    pub pending_chunks: i64,
}

impl JobListEntry {
    fn from_summary(summary: &JobSummary) -> Option<Self> {
        let manifest = summary.job.manifest().ok()?;
        Some(Self {
            job_id: summary.job.job_id.clone(),
            template_id: manifest.template_id,
            submitted_by: manifest.submitted_by,
            current_state: summary.job.current_state.clone(),
            priority: summary.job.priority,
            submitted_at_ms: summary.job.submitted_at_ms,
            frame_start: manifest.frame_start,
            frame_end: manifest.frame_end,
            chunk_size: manifest.chunk_size,
            output_dir: manifest.output_dir,
            total_chunks: summary.progress.total,
            completed_chunks: summary.progress.completed,
            failed_chunks: summary.progress.failed,
            rendering_chunks: summary.progress.rendering,
            pending_chunks: summary.progress.pending,
        })
    }
}

/// POST /jobs -- submit a new job.
///
/// The manifest is validated here so a bad submission is rejected with
/// 400 before anything is queued; the insert itself happens on the next
/// dispatch tick.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> AppResult<Json<serde_json::Value>> {
    require_leader(&state).await?;
    request.manifest.validate()?;

    let job_id = request.manifest.job_id.clone();
    state
        .engine
        .queue_submission(SubmitRequest {
            manifest: request.manifest,
            priority: request.priority,
        })
        .await;

    Ok(Json(json!({"status": "ok", "job_id": job_id})))
}

/// GET /jobs -- all jobs with progress, newest-priority first; archived
/// jobs are hidden.
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<JobListEntry>>> {
    let pool = require_leader(&state).await?;

    let summaries = JobRepo::list_with_progress(&pool).await?;
    let entries = summaries
        .iter()
        .filter(|s| s.job.current_state != JobState::Archived.as_str())
        .filter_map(JobListEntry::from_summary)
        .collect();

    Ok(Json(entries))
}

/// GET /jobs/{id} -- job detail with manifest and chunks.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;

    let job = JobRepo::find_by_id(&pool, &job_id)
        .await?
        .ok_or_else(|| not_found(&job_id))?;
    let chunks = ChunkRepo::list_for_job(&pool, &job_id).await?;

    let manifest: serde_json::Value =
        serde_json::from_str(&job.manifest_json).unwrap_or(serde_json::Value::Null);

    Ok(Json(json!({
        "job_id": job.job_id,
        "current_state": job.current_state,
        "priority": job.priority,
        "submitted_at_ms": job.submitted_at_ms,
        "manifest": manifest,
        "chunks": chunks,
    })))
}

/// POST /jobs/{id}/pause
pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    if !JobRepo::update_state(&pool, &job_id, JobState::Paused).await? {
        return Err(not_found(&job_id).into());
    }
    tracing::info!(job_id = %job_id, "Job paused");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /jobs/{id}/resume
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    if !JobRepo::update_state(&pool, &job_id, JobState::Active).await? {
        return Err(not_found(&job_id).into());
    }
    tracing::info!(job_id = %job_id, "Job resumed");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /jobs/{id}/cancel
///
/// Marks the job cancelled, aborts a local render of it, and purges any
/// queued-but-not-started chunks without failure reports.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    if !JobRepo::update_state(&pool, &job_id, JobState::Cancelled).await? {
        return Err(not_found(&job_id).into());
    }

    abort_local_render_of(&state, &job_id).await;
    tracing::info!(job_id = %job_id, "Job cancelled");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /jobs/{id}/archive
pub async fn archive_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    if !JobRepo::update_state(&pool, &job_id, JobState::Archived).await? {
        return Err(not_found(&job_id).into());
    }
    tracing::info!(job_id = %job_id, "Job archived");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /jobs/{id}/requeue -- start the job over: every chunk back to
/// `pending` with fresh retry budgets and empty blacklists.
pub async fn requeue_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    if !JobRepo::exists(&pool, &job_id).await? {
        return Err(not_found(&job_id).into());
    }
    ChunkRepo::reset_all(&pool, &job_id).await?;
    JobRepo::update_state(&pool, &job_id, JobState::Active).await?;
    tracing::info!(job_id = %job_id, "Job requeued");
    Ok(Json(json!({"status": "ok"})))
}

/// POST /jobs/{id}/retry-failed -- re-arm failed chunks, keeping their
/// blacklists.
pub async fn retry_failed(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    let retried = ChunkRepo::retry_failed(&pool, &job_id).await?;
    Ok(Json(json!({"status": "ok", "retried": retried})))
}

/// POST /jobs/{id}/resubmit -- clone into a fresh `-vN` job.
pub async fn resubmit_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;
    let new_job_id = state.engine.resubmit_job(&pool, &job_id).await?;
    Ok(Json(json!({"status": "ok", "job_id": new_job_id})))
}

/// DELETE /jobs/{id} -- remove the job, its chunks, and its directory on
/// the shared filesystem.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let pool = require_leader(&state).await?;

    abort_local_render_of(&state, &job_id).await;

    if !JobRepo::delete(&pool, &job_id).await? {
        return Err(not_found(&job_id).into());
    }

    // Shared-filesystem cleanup happens off the request path.
    let job_dir = state.farm.job_dir(&job_id);
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            tracing::debug!(error = %e, "Job dir cleanup failed");
        }
    });

    tracing::info!(job_id = %job_id, "Job deleted");
    Ok(Json(json!({"status": "ok"})))
}

fn not_found(job_id: &str) -> CoreError {
    CoreError::NotFound {
        entity: "Job",
        id: job_id.to_string(),
    }
}

/// Abort the local render if it is working on `job_id`, and drop queued
/// chunks of that job. Queued chunks produce no failure reports; only
/// the active one does.
async fn abort_local_render_of(state: &AppState, job_id: &str) {
    let status = state.coordinator.status().await;
    if status.rendering && status.job_id == job_id {
        state.coordinator.abort("job cancelled").await;
    }
    state.coordinator.purge_job(job_id).await;
}
