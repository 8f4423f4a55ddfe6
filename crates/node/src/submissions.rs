//! Local submission dropbox.
//!
//! DCC-side tooling drops fully-baked submissions as JSON files into
//! `{data_dir}/submissions/`. A watcher polls every ~3 seconds, forwards
//! each submission to the current leader (directly when this node is the
//! leader, over HTTP otherwise), and moves the file into
//! `submissions/processed/` -- malformed files included, so they are
//! never retried.

use std::path::{Path, PathBuf};
use std::time::Duration;

use midrender_core::manifest::JobManifest;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::engine::SubmitRequest;
use crate::state::AppState;

/// Dropbox poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// A dropped submission file.
#[derive(Debug, Deserialize)]
struct DropboxSubmission {
    manifest: JobManifest,
    #[serde(default = "default_priority")]
    priority: i32,
}

fn default_priority() -> i32 {
    50
}

/// Long-running dropbox watcher task.
pub async fn run_submission_watcher(state: AppState, cancel: CancellationToken) {
    let dir = state.config.data_dir.join("submissions");
    let processed = dir.join("processed");
    if let Err(e) = tokio::fs::create_dir_all(&processed).await {
        tracing::warn!(error = %e, "Cannot create submissions dir, watcher disabled");
        return;
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => poll_once(&state, &dir, &processed).await,
        }
    }
    tracing::info!("Submission watcher stopped");
}

/// One dropbox scan.
pub async fn poll_once(state: &AppState, dir: &Path, processed: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        process_file(state, &path).await;
        archive_file(&path, processed).await;
    }
}

async fn process_file(state: &AppState, path: &Path) {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable submission file");
            return;
        }
    };

    let submission: DropboxSubmission = match serde_json::from_slice(&bytes) {
        Ok(submission) => submission,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Malformed submission file");
            return;
        }
    };

    if let Err(e) = submission.manifest.validate() {
        tracing::error!(path = %path.display(), error = %e, "Invalid submission manifest");
        return;
    }

    let job_id = submission.manifest.job_id.clone();

    if state.registry.is_leader() && state.leader.is_ready() {
        state
            .engine
            .queue_submission(SubmitRequest {
                manifest: submission.manifest,
                priority: submission.priority,
            })
            .await;
        tracing::info!(job_id = %job_id, "Dropbox submission queued locally");
        return;
    }

    let Some(leader_endpoint) = state.registry.leader_endpoint().await else {
        tracing::warn!(job_id = %job_id, "No leader available for dropbox submission");
        return;
    };

    let body = json!({
        "manifest": submission.manifest,
        "priority": submission.priority,
    });
    let url = format!("http://{leader_endpoint}/jobs");
    match state.http.post(&url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(job_id = %job_id, "Dropbox submission forwarded to leader");
        }
        Ok(response) => {
            tracing::warn!(
                job_id = %job_id,
                status = response.status().as_u16(),
                "Leader rejected dropbox submission",
            );
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to reach leader for submission");
        }
    }
}

/// Move a processed (or hopeless) file out of the dropbox.
async fn archive_file(path: &Path, processed: &Path) {
    let dest: PathBuf = processed.join(path.file_name().unwrap_or_default());
    if let Err(e) = tokio::fs::rename(path, &dest).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to archive submission file");
        // Last resort so the file is not reprocessed forever.
        let _ = tokio::fs::remove_file(path).await;
    }
}
