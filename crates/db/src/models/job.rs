//! Job row and progress views.

use midrender_core::error::{CoreError, CoreResult};
use midrender_core::manifest::JobManifest;
use midrender_core::types::TimestampMs;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `jobs` table. The manifest is stored as an opaque JSON
/// blob; dispatch parses it on demand.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub job_id: String,
    pub manifest_json: String,
    pub current_state: String,
    pub priority: i32,
    pub submitted_at_ms: TimestampMs,
}

impl JobRow {
    /// Parse the stored manifest blob.
    pub fn manifest(&self) -> CoreResult<JobManifest> {
        serde_json::from_str(&self.manifest_json)
            .map_err(|e| CoreError::Internal(format!("corrupt manifest for {}: {e}", self.job_id)))
    }
}

/// Chunk-state counts for one job, derived by grouping.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub rendering: i64,
    pub pending: i64,
}

/// A job row together with its progress counts.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: JobRow,
    #[serde(flatten)]
    pub progress: JobProgress,
}
