//! Leader-side dispatch engine.
//!
//! Runs one bounded tick every ~2 seconds, in a fixed order: drain
//! submissions, drain worker reports, reassign dead workers' chunks,
//! complete finished jobs, hand out new work, snapshot on schedule.
//! Every step is safe to retry next tick, and all chunk transitions go
//! through the store's guarded updates, so a crashed or repeated tick
//! cannot corrupt state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use midrender_core::chunking::compute_chunks;
use midrender_core::failure_tracking::NodeFailureTracker;
use midrender_core::manifest::{strip_version_suffix, JobManifest};
use midrender_core::types::{now_ms, JobState, NodeState, RenderState};
use midrender_db::models::JobRow;
use midrender_db::repositories::{ChunkRepo, JobRepo};
use midrender_db::DbPool;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Dispatch tick cadence.
pub const DISPATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Budget for the assignment POST to a worker.
const ASSIGN_TIMEOUT: Duration = Duration::from_secs(1);

/// Fallback when a manifest cannot be parsed during failure handling.
const DEFAULT_MAX_RETRIES: i32 = 3;

/// A worker's chunk-completion report.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub elapsed_ms: i64,
    pub exit_code: i32,
}

/// A worker's chunk-failure report.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub error: String,
}

/// A worker's single-frame completion report.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub node_id: String,
    pub job_id: String,
    pub frame: i32,
}

/// A queued job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub manifest: JobManifest,
    pub priority: i32,
}

/// The dispatch engine: inbound queues plus the tick logic.
///
/// HTTP handlers and the report flusher enqueue; only the dispatch tick
/// dequeues, so reports are processed in arrival order.
pub struct DispatchEngine {
    submissions: Mutex<VecDeque<SubmitRequest>>,
    completions: Mutex<VecDeque<CompletionReport>>,
    failures: Mutex<VecDeque<FailureReport>>,
    frames: Mutex<VecDeque<FrameReport>>,
    failure_tracker: Mutex<NodeFailureTracker>,
    assign_client: reqwest::Client,
    last_snapshot: Mutex<Instant>,
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchEngine {
    pub fn new() -> Self {
        let assign_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(ASSIGN_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            submissions: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            frames: Mutex::new(VecDeque::new()),
            failure_tracker: Mutex::new(NodeFailureTracker::new()),
            assign_client,
            last_snapshot: Mutex::new(Instant::now()),
        }
    }

    // ---- inbound queues ----

    pub async fn queue_submission(&self, request: SubmitRequest) {
        self.submissions.lock().await.push_back(request);
    }

    pub async fn queue_completion(&self, report: CompletionReport) {
        self.completions.lock().await.push_back(report);
    }

    pub async fn queue_failure(&self, report: FailureReport) {
        self.failures.lock().await.push_back(report);
    }

    pub async fn queue_frame(&self, report: FrameReport) {
        self.frames.lock().await.push_back(report);
    }

    pub async fn is_suspended(&self, node_id: &str) -> bool {
        self.failure_tracker.lock().await.is_suspended(node_id)
    }

    /// Operator unsuspend: forget the node's failure history.
    pub async fn clear_suspension(&self, node_id: &str) {
        self.failure_tracker.lock().await.clear_node(node_id);
        tracing::info!(node_id, "Node unsuspended");
    }

    // ---- tick ----

    /// One dispatch cycle. Call only while leader with a ready store.
    pub async fn tick(&self, state: &AppState) {
        let Some(pool) = state.leader.pool().await else {
            return;
        };

        self.process_submissions(&pool).await;
        self.process_reports(&pool).await;
        self.detect_dead_workers(state, &pool).await;
        self.check_job_completions(&pool).await;
        self.assign_work(state, &pool).await;
        self.maybe_snapshot(state, &pool).await;
    }

    /// Insert a validated manifest as a new job plus its chunk
    /// partition. Rolls the job row back if the chunk insert fails.
    pub async fn submit_job(
        &self,
        pool: &DbPool,
        manifest: &JobManifest,
        priority: i32,
    ) -> AppResult<String> {
        manifest.validate()?;

        let row = JobRow {
            job_id: manifest.job_id.clone(),
            manifest_json: serde_json::to_string(manifest)
                .map_err(|e| AppError::Internal(format!("manifest encode failed: {e}")))?,
            current_state: JobState::Active.as_str().to_string(),
            priority,
            submitted_at_ms: manifest.submitted_at_ms,
        };
        JobRepo::insert(pool, &row).await?;

        let chunks = compute_chunks(manifest.frame_start, manifest.frame_end, manifest.chunk_size);
        if let Err(e) = ChunkRepo::insert_many(pool, &manifest.job_id, &chunks).await {
            let _ = JobRepo::delete(pool, &manifest.job_id).await;
            return Err(e.into());
        }

        tracing::info!(
            job_id = %manifest.job_id,
            chunks = chunks.len(),
            priority,
            "Job submitted",
        );
        Ok(manifest.job_id.clone())
    }

    /// Clone an existing job's manifest into a fresh `-vN` job with
    /// clean chunks.
    pub async fn resubmit_job(&self, pool: &DbPool, source_job_id: &str) -> AppResult<String> {
        let source = JobRepo::find_by_id(pool, source_job_id)
            .await?
            .ok_or_else(|| {
                AppError::Core(midrender_core::error::CoreError::NotFound {
                    entity: "Job",
                    id: source_job_id.to_string(),
                })
            })?;
        let mut manifest = source.manifest()?;

        let base = strip_version_suffix(&manifest.job_id).to_string();
        let mut new_job_id = format!("{base}-v2");
        for suffix in 2..1000 {
            new_job_id = format!("{base}-v{suffix}");
            if !JobRepo::exists(pool, &new_job_id).await? {
                break;
            }
        }

        manifest.job_id = new_job_id;
        manifest.submitted_at_ms = now_ms();

        let new_id = self.submit_job(pool, &manifest, source.priority).await?;
        tracing::info!(source = %source_job_id, new_job_id = %new_id, "Job resubmitted");
        Ok(new_id)
    }

    // ---- tick steps ----

    async fn process_submissions(&self, pool: &DbPool) {
        let batch: Vec<SubmitRequest> = self.submissions.lock().await.drain(..).collect();
        for request in batch {
            if let Err(e) = self.submit_job(pool, &request.manifest, request.priority).await {
                tracing::error!(
                    job_id = %request.manifest.job_id,
                    error = %e,
                    "Queued submission failed",
                );
            }
        }
    }

    async fn process_reports(&self, pool: &DbPool) {
        let completions: Vec<CompletionReport> = self.completions.lock().await.drain(..).collect();
        let failures: Vec<FailureReport> = self.failures.lock().await.drain(..).collect();
        let frames: Vec<FrameReport> = self.frames.lock().await.drain(..).collect();

        for report in completions {
            let range = midrender_core::types::ChunkRange::new(report.frame_start, report.frame_end);
            match ChunkRepo::complete(pool, &report.job_id, range, now_ms()).await {
                Ok(true) => {
                    tracing::info!(
                        job_id = %report.job_id,
                        chunk = %range,
                        node_id = %report.node_id,
                        elapsed_ms = report.elapsed_ms,
                        "Chunk completed",
                    );
                }
                Ok(false) => {
                    // Already completed or reassigned -- duplicate report.
                }
                Err(e) => tracing::error!(error = %e, "Completion update failed"),
            }
        }

        for report in failures {
            let range = midrender_core::types::ChunkRange::new(report.frame_start, report.frame_end);
            let max_retries = match JobRepo::find_by_id(pool, &report.job_id).await {
                Ok(Some(job)) => job
                    .manifest()
                    .map(|m| m.max_retries)
                    .unwrap_or(DEFAULT_MAX_RETRIES),
                _ => DEFAULT_MAX_RETRIES,
            };

            match ChunkRepo::fail(pool, &report.job_id, range, max_retries, &report.node_id).await {
                Ok(true) => {
                    tracing::warn!(
                        job_id = %report.job_id,
                        chunk = %range,
                        node_id = %report.node_id,
                        error = %report.error,
                        "Chunk failed",
                    );
                    if !report.node_id.is_empty() {
                        let newly_suspended = self
                            .failure_tracker
                            .lock()
                            .await
                            .record_failure(&report.node_id, now_ms());
                        if newly_suspended {
                            tracing::warn!(
                                node_id = %report.node_id,
                                "Node suspended after repeated failures",
                            );
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Failure update failed"),
            }
        }

        if !frames.is_empty() {
            let mut by_job: HashMap<String, Vec<i32>> = HashMap::new();
            for report in frames {
                by_job.entry(report.job_id).or_default().push(report.frame);
            }
            for (job_id, frames) in by_job {
                if let Err(e) = ChunkRepo::add_completed_frames_batch(pool, &job_id, &frames).await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Frame batch update failed");
                }
            }
        }
    }

    async fn detect_dead_workers(&self, state: &AppState, pool: &DbPool) {
        for peer in state.registry.snapshot().await {
            if !peer.is_alive {
                if let Err(e) = ChunkRepo::reassign_dead_worker(pool, &peer.node_id).await {
                    tracing::error!(error = %e, "Dead-worker reassignment failed");
                }
            }
        }
    }

    async fn check_job_completions(&self, pool: &DbPool) {
        let jobs = match JobRepo::list_all(pool).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Job listing failed");
                return;
            }
        };
        for job in jobs {
            if job.current_state != JobState::Active.as_str() {
                continue;
            }
            match ChunkRepo::is_job_complete(pool, &job.job_id).await {
                Ok(true) => {
                    let _ = JobRepo::update_state(pool, &job.job_id, JobState::Completed).await;
                    tracing::info!(job_id = %job.job_id, "Job completed");
                }
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Completion check failed"),
            }
        }
    }

    /// Hand one chunk to every eligible idle worker.
    async fn assign_work(&self, state: &AppState, pool: &DbPool) {
        let mut workers = state.registry.snapshot_with_local().await;
        // Stable iteration within a tick: priority, then node id.
        workers.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        for worker in workers {
            if !worker.is_alive
                || worker.node_state == NodeState::Stopped
                || worker.render_state == RenderState::Rendering
            {
                continue;
            }
            if self.is_suspended(&worker.node_id).await {
                continue;
            }

            let assignment =
                match ChunkRepo::find_next_pending_for_node(pool, &worker.tags, &worker.node_id)
                    .await
                {
                    Ok(Some(assignment)) => assignment,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "Pending-chunk lookup failed");
                        continue;
                    }
                };

            match ChunkRepo::assign(pool, assignment.chunk_id, &worker.node_id, now_ms()).await {
                Ok(true) => {}
                _ => continue,
            }

            if worker.is_local {
                let accepted = state
                    .coordinator
                    .dispatch(assignment.manifest.clone(), assignment.range)
                    .await;
                if accepted {
                    tracing::info!(
                        job_id = %assignment.job_id,
                        chunk = %assignment.range,
                        "Self-assigned chunk",
                    );
                } else {
                    let _ = ChunkRepo::release(pool, &assignment.job_id, assignment.range).await;
                }
            } else {
                let accepted = self
                    .post_assignment(&worker.endpoint, &assignment.manifest, assignment.range)
                    .await;
                if accepted {
                    tracing::info!(
                        job_id = %assignment.job_id,
                        chunk = %assignment.range,
                        node_id = %worker.node_id,
                        "Chunk assigned",
                    );
                } else {
                    // Transport failure or 409: the worker never got the
                    // chunk, so put it straight back without charging
                    // anyone's retry budget.
                    tracing::warn!(
                        job_id = %assignment.job_id,
                        chunk = %assignment.range,
                        node_id = %worker.node_id,
                        "Assignment POST failed, reverting to pending",
                    );
                    let _ = ChunkRepo::release(pool, &assignment.job_id, assignment.range).await;
                }
            }
        }
    }

    async fn post_assignment(
        &self,
        endpoint: &str,
        manifest: &JobManifest,
        range: midrender_core::types::ChunkRange,
    ) -> bool {
        let body = json!({
            "manifest": manifest,
            "frame_start": range.frame_start,
            "frame_end": range.frame_end,
        });
        let url = format!("http://{endpoint}/dispatch/assign");
        match self.assign_client.post(&url).json(&body).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Snapshot the store every [`SNAPSHOT_INTERVAL`]: `VACUUM INTO` a
    /// local temp file, then copy it to the shared filesystem on a
    /// spawned task so the tick never waits on the shared mount.
    async fn maybe_snapshot(&self, state: &AppState, pool: &DbPool) {
        {
            let mut last = self.last_snapshot.lock().await;
            if last.elapsed() < SNAPSHOT_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        let local_tmp = state.config.data_dir.join("snapshot_tmp.db");
        if let Err(e) = midrender_db::snapshot_to(pool, &local_tmp).await {
            tracing::warn!(error = %e, "Local snapshot failed");
            return;
        }

        let dest = state.farm.snapshot_path();
        tokio::spawn(async move {
            match tokio::fs::copy(&local_tmp, &dest).await {
                Ok(_) => {
                    tracing::info!("Store snapshot written to farm");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Snapshot copy to farm failed");
                }
            }
            let _ = tokio::fs::remove_file(&local_tmp).await;
        });
    }
}

/// Leader-only dispatch loop: ticks while this node is the leader and
/// its store is ready.
pub async fn run_dispatch_loop(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if state.registry.is_leader() && state.leader.is_ready() {
                    state.engine.tick(&state).await;
                }
            }
        }
    }
    tracing::info!("Dispatch loop stopped");
}
