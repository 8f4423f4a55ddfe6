//! Worker-to-leader report queue.
//!
//! Completion, failure, and per-frame events buffer here until the
//! flusher can hand them to the current leader. When this node IS the
//! leader they feed the dispatch engine's inbound queues directly;
//! otherwise they go out over HTTP. Any send failure re-queues the
//! unsent items at the front (ordering preserved) and starts a 5-second
//! leader-contact cool-down so a flapping leader is not hammered.
//!
//! Delivery is at-least-once; the store's guarded transitions absorb
//! duplicates.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use midrender_core::types::ChunkRange;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::{CompletionReport, FailureReport, FrameReport};
use crate::state::AppState;

/// Flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Cool-down after any failed leader contact.
const LEADER_COOLDOWN: Duration = Duration::from_secs(5);

/// How a chunk ended on this worker.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Completed { elapsed_ms: i64, exit_code: i32 },
    Failed { error: String },
}

/// One buffered chunk event.
#[derive(Debug, Clone)]
pub struct ChunkEvent {
    pub job_id: String,
    pub range: ChunkRange,
    pub outcome: ChunkOutcome,
}

/// One buffered per-frame event.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub job_id: String,
    pub frame: i32,
}

/// Durable (process-lifetime) buffer of outbound reports.
pub struct ReportQueue {
    chunks: Mutex<VecDeque<ChunkEvent>>,
    frames: Mutex<VecDeque<FrameEvent>>,
}

impl Default for ReportQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportQueue {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            frames: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push_chunk(&self, event: ChunkEvent) {
        self.chunks.lock().await.push_back(event);
    }

    pub async fn push_frame(&self, event: FrameEvent) {
        self.frames.lock().await.push_back(event);
    }

    pub async fn pending_counts(&self) -> (usize, usize) {
        (self.chunks.lock().await.len(), self.frames.lock().await.len())
    }

    async fn drain_chunks(&self) -> Vec<ChunkEvent> {
        self.chunks.lock().await.drain(..).collect()
    }

    async fn drain_frames(&self) -> Vec<FrameEvent> {
        self.frames.lock().await.drain(..).collect()
    }

    /// Put unsent items back in front of anything that arrived while the
    /// flush was in flight.
    async fn requeue_chunks(&self, unsent: Vec<ChunkEvent>) {
        let mut queue = self.chunks.lock().await;
        for event in unsent.into_iter().rev() {
            queue.push_front(event);
        }
    }

    async fn requeue_frames(&self, unsent: Vec<FrameEvent>) {
        let mut queue = self.frames.lock().await;
        for event in unsent.into_iter().rev() {
            queue.push_front(event);
        }
    }
}

/// Long-running flusher task.
pub async fn run_report_flusher(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut cooldown_until = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if Instant::now() < cooldown_until {
                    continue;
                }
                if !flush_once(&state).await {
                    cooldown_until = Instant::now() + LEADER_COOLDOWN;
                }
            }
        }
    }
    tracing::info!("Report flusher stopped");
}

/// One flush pass. Returns `false` when any leader contact failed.
pub async fn flush_once(state: &AppState) -> bool {
    // Self-if-leader shortcut: hand events straight to the engine.
    if state.registry.is_leader() && state.leader.is_ready() {
        deliver_locally(state).await;
        return true;
    }

    let Some(leader_endpoint) = state.registry.leader_endpoint().await else {
        // No leader elected yet -- keep buffering, not a contact failure.
        return true;
    };

    let chunks_ok = flush_chunks(state, &leader_endpoint).await;
    let frames_ok = flush_frames(state, &leader_endpoint).await;
    chunks_ok && frames_ok
}

async fn deliver_locally(state: &AppState) {
    let node_id = state.registry.node_id().to_string();

    for event in state.reports.drain_chunks().await {
        match event.outcome {
            ChunkOutcome::Completed {
                elapsed_ms,
                exit_code,
            } => {
                state
                    .engine
                    .queue_completion(CompletionReport {
                        node_id: node_id.clone(),
                        job_id: event.job_id,
                        frame_start: event.range.frame_start,
                        frame_end: event.range.frame_end,
                        elapsed_ms,
                        exit_code,
                    })
                    .await;
            }
            ChunkOutcome::Failed { error } => {
                state
                    .engine
                    .queue_failure(FailureReport {
                        node_id: node_id.clone(),
                        job_id: event.job_id,
                        frame_start: event.range.frame_start,
                        frame_end: event.range.frame_end,
                        error,
                    })
                    .await;
            }
        }
    }

    for event in state.reports.drain_frames().await {
        state
            .engine
            .queue_frame(FrameReport {
                node_id: node_id.clone(),
                job_id: event.job_id,
                frame: event.frame,
            })
            .await;
    }
}

/// Send buffered chunk events in order; stop at the first failure and
/// re-queue everything unsent.
async fn flush_chunks(state: &AppState, leader_endpoint: &str) -> bool {
    let batch = state.reports.drain_chunks().await;
    if batch.is_empty() {
        return true;
    }

    let node_id = state.registry.node_id();
    let mut unsent = Vec::new();
    let mut failed = false;

    for event in batch {
        if failed {
            unsent.push(event);
            continue;
        }

        let (path, body) = match &event.outcome {
            ChunkOutcome::Completed {
                elapsed_ms,
                exit_code,
            } => (
                "/dispatch/complete",
                json!({
                    "node_id": node_id,
                    "job_id": event.job_id,
                    "frame_start": event.range.frame_start,
                    "frame_end": event.range.frame_end,
                    "elapsed_ms": elapsed_ms,
                    "exit_code": exit_code,
                }),
            ),
            ChunkOutcome::Failed { error } => (
                "/dispatch/failed",
                json!({
                    "node_id": node_id,
                    "job_id": event.job_id,
                    "frame_start": event.range.frame_start,
                    "frame_end": event.range.frame_end,
                    "error": error,
                }),
            ),
        };

        let url = format!("http://{leader_endpoint}{path}");
        match state.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            _ => {
                failed = true;
                unsent.push(event);
            }
        }
    }

    if !unsent.is_empty() {
        state.reports.requeue_chunks(unsent).await;
    }
    !failed
}

/// Send buffered frame events batched per job; re-queue failed groups.
async fn flush_frames(state: &AppState, leader_endpoint: &str) -> bool {
    let batch = state.reports.drain_frames().await;
    if batch.is_empty() {
        return true;
    }

    let node_id = state.registry.node_id();
    let mut by_job: HashMap<String, Vec<i32>> = HashMap::new();
    for event in &batch {
        by_job.entry(event.job_id.clone()).or_default().push(event.frame);
    }

    let mut failed_jobs: Vec<String> = Vec::new();
    for (job_id, frames) in &by_job {
        let body = json!({
            "node_id": node_id,
            "job_id": job_id,
            "frames": frames,
        });
        let url = format!("http://{leader_endpoint}/dispatch/frame-complete");
        match state.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            _ => failed_jobs.push(job_id.clone()),
        }
    }

    if failed_jobs.is_empty() {
        return true;
    }

    let unsent: Vec<FrameEvent> = batch
        .into_iter()
        .filter(|e| failed_jobs.contains(&e.job_id))
        .collect();
    state.reports.requeue_frames(unsent).await;
    false
}
