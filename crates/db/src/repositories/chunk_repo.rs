//! Repository for the `chunks` table -- the dispatch engine's workhorse.
//!
//! State transitions are guarded by the current state in the WHERE clause,
//! so every operation is idempotent under at-least-once report delivery:
//! a duplicate completion or failure report finds the chunk no longer
//! `assigned` and changes nothing.

use midrender_core::types::{ChunkRange, TimestampMs};
use sqlx::SqlitePool;

use crate::models::{ChunkRow, PendingAssignment};
use crate::repositories::JobRepo;

/// Column list for `chunks` queries.
const COLUMNS: &str = "id, job_id, frame_start, frame_end, state, assigned_to, \
     assigned_at_ms, completed_at_ms, retry_count, completed_frames, failed_on";

/// Provides chunk CRUD and the atomic dispatch state transitions.
pub struct ChunkRepo;

impl ChunkRepo {
    /// Insert the chunk partition for a freshly submitted job in one
    /// transaction. Either every chunk lands or none do.
    pub async fn insert_many(
        pool: &SqlitePool,
        job_id: &str,
        ranges: &[ChunkRange],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for range in ranges {
            sqlx::query("INSERT INTO chunks (job_id, frame_start, frame_end) VALUES (?, ?, ?)")
                .bind(job_id)
                .bind(range.frame_start)
                .bind(range.frame_end)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    pub async fn list_for_job(
        pool: &SqlitePool,
        job_id: &str,
    ) -> Result<Vec<ChunkRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM chunks WHERE job_id = ? ORDER BY frame_start ASC");
        sqlx::query_as::<_, ChunkRow>(&query)
            .bind(job_id)
            .fetch_all(pool)
            .await
    }

    /// Find the first pending chunk the given node may run.
    ///
    /// Jobs are visited in dispatch order (priority ascending, then
    /// submission time); within a job, chunks by `frame_start`. A job is
    /// skipped unless its `tags_required` are a subset of `node_tags`; a
    /// chunk is skipped when `node_id` is in its blacklist. Jobs with
    /// corrupt manifests are skipped with a warning.
    pub async fn find_next_pending_for_node(
        pool: &SqlitePool,
        node_tags: &[String],
        node_id: &str,
    ) -> Result<Option<PendingAssignment>, sqlx::Error> {
        let jobs: Vec<(String, String)> = sqlx::query_as(
            "SELECT j.job_id, j.manifest_json FROM jobs j \
             WHERE j.current_state = 'active' \
               AND EXISTS (SELECT 1 FROM chunks c WHERE c.job_id = j.job_id AND c.state = 'pending') \
             ORDER BY j.priority ASC, j.submitted_at_ms ASC",
        )
        .fetch_all(pool)
        .await?;

        for (job_id, manifest_json) in jobs {
            let manifest: midrender_core::manifest::JobManifest =
                match serde_json::from_str(&manifest_json) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Skipping job with corrupt manifest");
                        continue;
                    }
                };

            if !manifest.tags_satisfied_by(node_tags) {
                continue;
            }

            let query = format!(
                "SELECT {COLUMNS} FROM chunks \
                 WHERE job_id = ? AND state = 'pending' ORDER BY frame_start ASC"
            );
            let chunks = sqlx::query_as::<_, ChunkRow>(&query)
                .bind(&job_id)
                .fetch_all(pool)
                .await?;

            for chunk in chunks {
                if chunk.is_blacklisted(node_id) {
                    continue;
                }
                return Ok(Some(PendingAssignment {
                    chunk_id: chunk.id,
                    job_id,
                    range: chunk.range(),
                    manifest,
                }));
            }
        }

        Ok(None)
    }

    /// Atomic `pending -> assigned`. Returns whether a row changed.
    pub async fn assign(
        pool: &SqlitePool,
        chunk_id: i64,
        node_id: &str,
        now_ms: TimestampMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'assigned', assigned_to = ?, assigned_at_ms = ? \
             WHERE id = ? AND state = 'pending'",
        )
        .bind(node_id)
        .bind(now_ms)
        .bind(chunk_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic `assigned -> completed`. A no-op (and `Ok(false)`) once the
    /// chunk is in any other state, which absorbs duplicate reports.
    pub async fn complete(
        pool: &SqlitePool,
        job_id: &str,
        range: ChunkRange,
        now_ms: TimestampMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'completed', completed_at_ms = ?, \
                 assigned_to = NULL, assigned_at_ms = NULL \
             WHERE job_id = ? AND frame_start = ? AND frame_end = ? AND state = 'assigned'",
        )
        .bind(now_ms)
        .bind(job_id)
        .bind(range.frame_start)
        .bind(range.frame_end)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a chunk failure reported by `failing_node_id`.
    ///
    /// Appends the node to the chunk's blacklist, bumps the retry count,
    /// and either returns the chunk to `pending` (count still strictly
    /// below `max_retries`) or parks it in terminal `failed`. The stored
    /// count never exceeds `max_retries`. Only an `assigned` chunk is
    /// touched, so duplicate failure reports are no-ops.
    pub async fn fail(
        pool: &SqlitePool,
        job_id: &str,
        range: ChunkRange,
        max_retries: i32,
        failing_node_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let row: Option<(i64, i32, String)> = sqlx::query_as(
            "SELECT id, retry_count, failed_on FROM chunks \
             WHERE job_id = ? AND frame_start = ? AND frame_end = ? AND state = 'assigned'",
        )
        .bind(job_id)
        .bind(range.frame_start)
        .bind(range.frame_end)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((chunk_id, retry_count, failed_on_json)) = row else {
            return Ok(false);
        };

        let mut failed_on: Vec<String> =
            serde_json::from_str(&failed_on_json).unwrap_or_default();
        if !failing_node_id.is_empty() && !failed_on.iter().any(|n| n == failing_node_id) {
            failed_on.push(failing_node_id.to_string());
        }
        let failed_on_json =
            serde_json::to_string(&failed_on).unwrap_or_else(|_| "[]".to_string());

        let new_count = retry_count + 1;
        let (new_state, stored_count) = if new_count < max_retries {
            ("pending", new_count)
        } else {
            ("failed", new_count.min(max_retries))
        };

        sqlx::query(
            "UPDATE chunks SET state = ?, retry_count = ?, failed_on = ?, \
                 assigned_to = NULL, assigned_at_ms = NULL \
             WHERE id = ?",
        )
        .bind(new_state)
        .bind(stored_count)
        .bind(&failed_on_json)
        .bind(chunk_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Revert an `assigned` chunk to `pending` without touching the retry
    /// count or blacklist. Used when the assignment POST to a worker
    /// fails -- a transport error is the leader's problem, not the
    /// worker's.
    pub async fn release(
        pool: &SqlitePool,
        job_id: &str,
        range: ChunkRange,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL \
             WHERE job_id = ? AND frame_start = ? AND frame_end = ? AND state = 'assigned'",
        )
        .bind(job_id)
        .bind(range.frame_start)
        .bind(range.frame_end)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return every chunk assigned to a dead worker to `pending`.
    pub async fn reassign_dead_worker(
        pool: &SqlitePool,
        dead_node_id: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL \
             WHERE assigned_to = ? AND state = 'assigned'",
        )
        .bind(dead_node_id)
        .execute(pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(
                dead_node_id,
                count,
                "Reassigned chunks from dead worker",
            );
        }
        Ok(count)
    }

    /// A job is complete when no chunk is outstanding and at least one
    /// chunk actually rendered. An all-failed job is NOT complete -- it
    /// stays active until an operator intervenes.
    pub async fn is_job_complete(pool: &SqlitePool, job_id: &str) -> Result<bool, sqlx::Error> {
        let (outstanding, completed): (i64, i64) = sqlx::query_as(
            "SELECT \
                 COALESCE(SUM(CASE WHEN state NOT IN ('completed', 'failed') THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) \
             FROM chunks WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_one(pool)
        .await?;
        Ok(outstanding == 0 && completed > 0)
    }

    /// Reset every chunk of a job to a clean slate: pending, zero retries,
    /// empty blacklist and frame set.
    pub async fn reset_all(pool: &SqlitePool, job_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL, \
                 completed_at_ms = NULL, retry_count = 0, \
                 completed_frames = '[]', failed_on = '[]' \
             WHERE job_id = ?",
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-arm only the `failed` chunks: back to `pending` with a fresh
    /// retry budget, keeping `failed_on` so previously failing nodes stay
    /// excluded. Reactivates the job when anything changed.
    pub async fn retry_failed(pool: &SqlitePool, job_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL, \
                 completed_at_ms = NULL, retry_count = 0, completed_frames = '[]' \
             WHERE job_id = ? AND state = 'failed'",
        )
        .bind(job_id)
        .execute(pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            JobRepo::update_state(pool, job_id, midrender_core::types::JobState::Active).await?;
            tracing::info!(job_id, count, "Retrying failed chunks");
        }
        Ok(count)
    }

    /// Union one completed frame into its containing chunk's frame set.
    pub async fn add_completed_frame(
        pool: &SqlitePool,
        job_id: &str,
        frame: i32,
    ) -> Result<bool, sqlx::Error> {
        Self::add_completed_frames_batch(pool, job_id, &[frame])
            .await
            .map(|n| n > 0)
    }

    /// Union a batch of completed frames into their containing chunks.
    ///
    /// Frames outside every chunk of the job are dropped. Returns the
    /// number of chunk rows updated.
    pub async fn add_completed_frames_batch(
        pool: &SqlitePool,
        job_id: &str,
        frames: &[i32],
    ) -> Result<u64, sqlx::Error> {
        if frames.is_empty() {
            return Ok(0);
        }

        let mut tx = pool.begin().await?;

        let rows: Vec<(i64, i32, i32, String)> = sqlx::query_as(
            "SELECT id, frame_start, frame_end, completed_frames FROM chunks \
             WHERE job_id = ? ORDER BY frame_start ASC",
        )
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;

        struct Entry {
            id: i64,
            frame_start: i32,
            frame_end: i32,
            frames: Vec<i32>,
            dirty: bool,
        }

        let mut entries: Vec<Entry> = rows
            .into_iter()
            .map(|(id, frame_start, frame_end, json)| Entry {
                id,
                frame_start,
                frame_end,
                frames: serde_json::from_str(&json).unwrap_or_default(),
                dirty: false,
            })
            .collect();

        for &frame in frames {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| frame >= e.frame_start && frame <= e.frame_end)
            {
                if !entry.frames.contains(&frame) {
                    entry.frames.push(frame);
                    entry.dirty = true;
                }
            }
        }

        let mut updated = 0;
        for entry in entries.iter_mut().filter(|e| e.dirty) {
            entry.frames.sort_unstable();
            let json = serde_json::to_string(&entry.frames)
                .unwrap_or_else(|_| "[]".to_string());
            sqlx::query("UPDATE chunks SET completed_frames = ? WHERE id = ?")
                .bind(&json)
                .bind(entry.id)
                .execute(&mut *tx)
                .await?;
            updated += 1;
        }

        tx.commit().await?;
        Ok(updated)
    }
}
