//! Chunk row type.

use midrender_core::manifest::JobManifest;
use midrender_core::types::{ChunkRange, TimestampMs};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `chunks` table.
///
/// `completed_frames` and `failed_on` are JSON arrays inside TEXT columns
/// with set semantics -- duplicates are collapsed on write.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChunkRow {
    pub id: i64,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub state: String,
    pub assigned_to: Option<String>,
    pub assigned_at_ms: Option<TimestampMs>,
    pub completed_at_ms: Option<TimestampMs>,
    pub retry_count: i32,
    pub completed_frames: Json<Vec<i32>>,
    pub failed_on: Json<Vec<String>>,
}

impl ChunkRow {
    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.frame_start, self.frame_end)
    }

    pub fn is_blacklisted(&self, node_id: &str) -> bool {
        self.failed_on.iter().any(|n| n == node_id)
    }
}

/// The result of a successful pending-chunk lookup: everything dispatch
/// needs to assign and ship the chunk.
#[derive(Debug, Clone)]
pub struct PendingAssignment {
    pub chunk_id: i64,
    pub job_id: String,
    pub range: ChunkRange,
    pub manifest: JobManifest,
}
