//! Repository for the `jobs` table.

use std::collections::HashMap;

use midrender_core::types::JobState;
use sqlx::SqlitePool;

use crate::models::{JobProgress, JobRow, JobSummary};

/// Column list for `jobs` queries.
const COLUMNS: &str = "job_id, manifest_json, current_state, priority, submitted_at_ms";

/// Provides CRUD operations for job rows.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job row. Fails on a duplicate `job_id`.
    pub async fn insert(pool: &SqlitePool, job: &JobRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO jobs (job_id, manifest_json, current_state, priority, submitted_at_ms) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.manifest_json)
        .bind(&job.current_state)
        .bind(job.priority)
        .bind(job.submitted_at_ms)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, job_id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn exists(pool: &SqlitePool, job_id: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(pool)
            .await?;
        Ok(count > 0)
    }

    /// All jobs in dispatch order: priority ascending (lower is preferred),
    /// then submission time ascending.
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM jobs ORDER BY priority ASC, submitted_at_ms ASC");
        sqlx::query_as::<_, JobRow>(&query).fetch_all(pool).await
    }

    /// All jobs with chunk-state counts, in dispatch order.
    pub async fn list_with_progress(pool: &SqlitePool) -> Result<Vec<JobSummary>, sqlx::Error> {
        let jobs = Self::list_all(pool).await?;

        let counts: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT job_id, state, COUNT(*) FROM chunks GROUP BY job_id, state")
                .fetch_all(pool)
                .await?;

        let mut by_job: HashMap<String, JobProgress> = HashMap::new();
        for (job_id, state, count) in counts {
            let p = by_job.entry(job_id).or_default();
            p.total += count;
            match state.as_str() {
                "completed" => p.completed = count,
                "failed" => p.failed = count,
                "assigned" => p.rendering = count,
                "pending" => p.pending = count,
                _ => {}
            }
        }

        Ok(jobs
            .into_iter()
            .map(|job| {
                let progress = by_job.remove(&job.job_id).unwrap_or_default();
                JobSummary { job, progress }
            })
            .collect())
    }

    /// Set the job state. Returns `false` when the job does not exist.
    pub async fn update_state(
        pool: &SqlitePool,
        job_id: &str,
        state: JobState,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET current_state = ? WHERE job_id = ?")
            .bind(state.as_str())
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_priority(
        pool: &SqlitePool,
        job_id: &str,
        priority: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET priority = ? WHERE job_id = ?")
            .bind(priority)
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a job. Chunks cascade via the foreign key.
    pub async fn delete(pool: &SqlitePool, job_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
