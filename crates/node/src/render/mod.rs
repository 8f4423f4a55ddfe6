//! Worker-side render coordinator.
//!
//! A single task owns the per-node render state machine:
//!
//! `Idle -> Dispatched (awaiting ack) -> Rendering -> done`, with
//! `Aborting` reachable from both active states. It pulls queued
//! assignments, drives the agent over IPC, tracks progress and per-frame
//! completions, streams renderer stdout to the shared log file in
//! bounded batches, and emits completion/failure events into the report
//! queue.

pub mod task;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use midrender_agent::{AgentCommand, AgentEvent, AgentSupervisor, AgentUpdate};
use midrender_core::manifest::JobManifest;
use midrender_core::types::{ChunkRange, RenderState};
use midrender_mesh::PeerRegistry;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::farm::FarmPaths;
use crate::reports::{ChunkEvent, ChunkOutcome, FrameEvent, ReportQueue};

/// Coordinator housekeeping cadence: queue pump, timeouts, log flush.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Agent liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Flush the stdout buffer once it holds this many lines.
const STDOUT_FLUSH_LINES: usize = 50;

/// Commands from the rest of the node into the coordinator task.
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Queue one assignment. Starts when the coordinator is idle.
    Dispatch {
        manifest: JobManifest,
        chunk: ChunkRange,
    },
    /// Abort the active render with a reason.
    Abort { reason: String },
    /// Drop queued (not yet started) chunks of a job, without failure
    /// reports.
    PurgeJob { job_id: String },
    /// Stop/start the node: stopping aborts the active render and
    /// blocks new dispatches.
    SetStopped(bool),
}

/// Snapshot of the coordinator's public state.
#[derive(Debug, Clone, Default)]
pub struct RenderStatus {
    pub rendering: bool,
    pub job_id: String,
    pub chunk_label: String,
    pub progress: f32,
    pub stopped: bool,
}

/// Cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
    status: Arc<RwLock<RenderStatus>>,
}

impl CoordinatorHandle {
    /// Queue one assignment. Returns `false` -- and leaves the chunk
    /// untouched -- when the node is stopped, so the caller can revert
    /// the assignment.
    pub async fn dispatch(&self, manifest: JobManifest, chunk: ChunkRange) -> bool {
        if self.status.read().await.stopped {
            return false;
        }
        self.tx
            .send(CoordinatorCommand::Dispatch { manifest, chunk })
            .await
            .is_ok()
    }

    pub async fn abort(&self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(CoordinatorCommand::Abort {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn purge_job(&self, job_id: impl Into<String>) {
        let _ = self
            .tx
            .send(CoordinatorCommand::PurgeJob {
                job_id: job_id.into(),
            })
            .await;
    }

    pub async fn set_stopped(&self, stopped: bool) {
        let _ = self.tx.send(CoordinatorCommand::SetStopped(stopped)).await;
    }

    pub async fn status(&self) -> RenderStatus {
        self.status.read().await.clone()
    }

    pub async fn is_rendering(&self) -> bool {
        self.status.read().await.rendering
    }

    pub async fn is_stopped(&self) -> bool {
        self.status.read().await.stopped
    }
}

/// Everything the coordinator needs at spawn time.
pub struct CoordinatorConfig {
    pub node_id: String,
    pub node_os: String,
    pub farm: Arc<FarmPaths>,
    pub staging_root: PathBuf,
    pub staging_enabled: bool,
    pub ack_timeout: Duration,
    pub initially_stopped: bool,
}

/// Spawn the coordinator task and return its handle.
pub fn spawn_coordinator(
    config: CoordinatorConfig,
    supervisor: Arc<AgentSupervisor>,
    agent_updates: mpsc::Receiver<AgentUpdate>,
    reports: Arc<ReportQueue>,
    registry: Arc<PeerRegistry>,
    cancel: CancellationToken,
) -> CoordinatorHandle {
    let (tx, rx) = mpsc::channel(64);
    let status = Arc::new(RwLock::new(RenderStatus {
        stopped: config.initially_stopped,
        ..RenderStatus::default()
    }));

    let coordinator = Coordinator {
        config,
        supervisor,
        reports,
        registry,
        status: Arc::clone(&status),
        queue: VecDeque::new(),
        active: None,
        stopped: false,
    };

    tokio::spawn(coordinator.run(rx, agent_updates, cancel));

    CoordinatorHandle { tx, status }
}

enum RenderPhase {
    /// `start_task` sent, waiting for `ack` until the deadline.
    Dispatched { ack_deadline: Instant },
    Rendering,
    /// `abort` sent; waiting for the agent to confirm.
    Aborting { reason: String },
}

struct ActiveRender {
    manifest: JobManifest,
    chunk: ChunkRange,
    phase: RenderPhase,
    started: Instant,
    stdout_buffer: Vec<String>,
    log_path: PathBuf,
    /// `(staging_dir, original_output_dir)` when staging is active.
    staging: Option<(PathBuf, String)>,
}

struct Coordinator {
    config: CoordinatorConfig,
    supervisor: Arc<AgentSupervisor>,
    reports: Arc<ReportQueue>,
    registry: Arc<PeerRegistry>,
    status: Arc<RwLock<RenderStatus>>,
    queue: VecDeque<(JobManifest, ChunkRange)>,
    active: Option<ActiveRender>,
    stopped: bool,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<CoordinatorCommand>,
        mut agent_updates: mpsc::Receiver<AgentUpdate>,
        cancel: CancellationToken,
    ) {
        self.stopped = self.config.initially_stopped;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut ping = tokio::time::interval(PING_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(update) = agent_updates.recv() => self.handle_agent_update(update).await,
                _ = ticker.tick() => self.tick().await,
                _ = ping.tick() => {
                    if self.supervisor.is_connected() {
                        let _ = self.supervisor.send_ping().await;
                    }
                }
            }
        }

        if self.active.is_some() {
            let _ = self
                .supervisor
                .send(&AgentCommand::Abort {
                    reason: "shutdown".into(),
                })
                .await;
        }
        tracing::info!("Render coordinator stopped");
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Dispatch { manifest, chunk } => {
                self.queue.push_back((manifest, chunk));
                self.pump_queue().await;
            }
            CoordinatorCommand::Abort { reason } => self.abort_active(&reason).await,
            CoordinatorCommand::PurgeJob { job_id } => {
                let before = self.queue.len();
                self.queue.retain(|(m, _)| m.job_id != job_id);
                let purged = before - self.queue.len();
                if purged > 0 {
                    tracing::info!(job_id = %job_id, purged, "Purged queued chunks");
                }
            }
            CoordinatorCommand::SetStopped(stopped) => {
                self.stopped = stopped;
                self.status.write().await.stopped = stopped;
                if stopped {
                    self.abort_active("node stopped").await;
                } else {
                    self.pump_queue().await;
                }
            }
        }
    }

    async fn handle_agent_update(&mut self, update: AgentUpdate) {
        let event = match update {
            AgentUpdate::Message(event) => event,
            AgentUpdate::Disconnected => {
                let reason = self.active.as_ref().map(|active| match &active.phase {
                    RenderPhase::Aborting { reason } => reason.clone(),
                    _ => "agent disconnected".to_string(),
                });
                if let Some(reason) = reason {
                    self.finish_failed(&reason).await;
                }
                return;
            }
        };

        if self.active.is_none() {
            // Late messages from an already-finished render -- ignore.
            return;
        }

        // The reason an abort was requested with, if we are aborting.
        let aborting_reason = self.active.as_ref().and_then(|a| match &a.phase {
            RenderPhase::Aborting { reason } => Some(reason.clone()),
            _ => None,
        });

        match event {
            AgentEvent::Ack => {
                if let Some(active) = self.active.as_mut() {
                    if matches!(active.phase, RenderPhase::Dispatched { .. }) {
                        active.phase = RenderPhase::Rendering;
                        tracing::info!(
                            job_id = %active.manifest.job_id,
                            chunk = %active.chunk,
                            "Agent acknowledged task",
                        );
                    }
                }
            }
            progress @ AgentEvent::Progress { .. } => {
                if let Some(fraction) = progress.progress_fraction() {
                    self.status.write().await.progress = fraction;
                }
            }
            AgentEvent::FrameCompleted { frame } => {
                let job_id = self
                    .active
                    .as_ref()
                    .map(|a| a.manifest.job_id.clone())
                    .unwrap_or_default();
                self.reports.push_frame(FrameEvent { job_id, frame }).await;
            }
            AgentEvent::StdoutLine { text } => {
                let should_flush = match self.active.as_mut() {
                    Some(active) => {
                        active.stdout_buffer.push(text);
                        active.stdout_buffer.len() >= STDOUT_FLUSH_LINES
                    }
                    None => false,
                };
                if should_flush {
                    self.flush_stdout().await;
                }
            }
            AgentEvent::ChunkCompleted {
                exit_code,
                elapsed_ms,
            } => {
                if let Some(reason) = aborting_reason {
                    self.finish_failed(&reason).await;
                } else if exit_code == 0 {
                    self.finish_completed(elapsed_ms, exit_code).await;
                } else {
                    self.finish_failed(&format!("renderer exit code {exit_code}")).await;
                }
            }
            AgentEvent::ChunkFailed { error } => {
                let reason = aborting_reason.unwrap_or(error);
                self.finish_failed(&reason).await;
            }
            AgentEvent::State { name } => {
                tracing::debug!(agent_state = %name, "Agent state");
            }
            AgentEvent::Pong => {}
        }
    }

    /// Housekeeping: start queued work, enforce timeouts, flush stdout.
    async fn tick(&mut self) {
        self.pump_queue().await;

        enum Expired {
            Ack,
            ChunkTimeout,
        }

        let mut expired: Option<Expired> = None;
        if let Some(active) = &self.active {
            match &active.phase {
                RenderPhase::Dispatched { ack_deadline } => {
                    if Instant::now() > *ack_deadline {
                        expired = Some(Expired::Ack);
                    }
                }
                RenderPhase::Rendering => {
                    if let Some(timeout) = active.manifest.timeout_seconds {
                        if active.started.elapsed() > Duration::from_secs(timeout) {
                            expired = Some(Expired::ChunkTimeout);
                        }
                    }
                }
                RenderPhase::Aborting { .. } => {}
            }
        }
        match expired {
            Some(Expired::Ack) => {
                // No ack ever came; don't wait for an abort confirmation.
                let _ = self
                    .supervisor
                    .send(&AgentCommand::Abort {
                        reason: "ack timeout".into(),
                    })
                    .await;
                self.finish_failed("agent did not acknowledge").await;
            }
            Some(Expired::ChunkTimeout) => self.abort_active("timeout").await,
            None => {}
        }

        self.flush_stdout().await;
    }

    /// Start the next queued chunk when idle.
    async fn pump_queue(&mut self) {
        if self.active.is_some() || self.stopped {
            return;
        }
        let Some((manifest, chunk)) = self.queue.pop_front() else {
            return;
        };
        self.start_render(manifest, chunk).await;
    }

    async fn start_render(&mut self, manifest: JobManifest, chunk: ChunkRange) {
        let log_path = self
            .config
            .farm
            .stdout_log(&manifest.job_id, &self.config.node_id, &chunk);

        // Staging: render into a local directory, copy out on success.
        let staging = if self.config.staging_enabled {
            match &manifest.output_dir {
                Some(original) => {
                    let dir = task::staging_dir(&self.config.staging_root, &manifest.job_id, &chunk);
                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        tracing::warn!(error = %e, "Staging dir creation failed, rendering directly");
                        None
                    } else {
                        Some((dir, original.clone()))
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let output_dir = match &staging {
            Some((dir, _)) => Some(dir.to_string_lossy().to_string()),
            None => manifest.output_dir.clone(),
        };

        let payload = match task::build_task_json(
            &manifest,
            &chunk,
            &self.config.node_os,
            output_dir.as_deref(),
            &log_path,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %manifest.job_id, error = %e, "Cannot build task");
                self.report_failure(&manifest, chunk, &e.to_string()).await;
                return;
            }
        };

        if !self.supervisor.is_connected() {
            if let Err(e) = self.supervisor.spawn().await {
                tracing::error!(error = %e, "Agent spawn failed");
                self.report_failure(&manifest, chunk, "agent unavailable").await;
                return;
            }
        }

        if let Err(e) = self
            .supervisor
            .send(&AgentCommand::StartTask { task: payload })
            .await
        {
            tracing::error!(error = %e, "Failed to send task to agent");
            self.report_failure(&manifest, chunk, "agent unavailable").await;
            return;
        }

        tracing::info!(job_id = %manifest.job_id, chunk = %chunk, "Task dispatched to agent");

        self.active = Some(ActiveRender {
            phase: RenderPhase::Dispatched {
                ack_deadline: Instant::now() + self.config.ack_timeout,
            },
            started: Instant::now(),
            stdout_buffer: Vec::new(),
            log_path,
            staging,
            manifest,
            chunk,
        });
        self.publish_status().await;
    }

    /// Abort the active render, if any.
    async fn abort_active(&mut self, reason: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if matches!(active.phase, RenderPhase::Aborting { .. }) {
            return;
        }
        tracing::info!(job_id = %active.manifest.job_id, reason, "Aborting render");
        active.phase = RenderPhase::Aborting {
            reason: reason.to_string(),
        };

        if self.supervisor.is_connected() {
            let _ = self
                .supervisor
                .send(&AgentCommand::Abort {
                    reason: reason.to_string(),
                })
                .await;
        } else {
            // No agent to confirm the abort -- fail immediately.
            let reason = reason.to_string();
            self.finish_failed(&reason).await;
        }
    }

    async fn finish_completed(&mut self, elapsed_ms: i64, exit_code: i32) {
        self.flush_stdout().await;
        let Some(active) = self.active.take() else {
            return;
        };

        // Copy staged frames out before reporting success.
        if let Some((staging_dir, original_output)) = &active.staging {
            match task::copy_staging_files(staging_dir, std::path::Path::new(original_output)).await
            {
                Ok(copied) => {
                    tracing::info!(copied, "Staging files copied to output");
                    let _ = tokio::fs::remove_dir_all(staging_dir).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Staging copy failed");
                    self.reports
                        .push_chunk(ChunkEvent {
                            job_id: active.manifest.job_id.clone(),
                            range: active.chunk,
                            outcome: ChunkOutcome::Failed {
                                error: format!("staging copy failed: {e}"),
                            },
                        })
                        .await;
                    self.publish_status().await;
                    return;
                }
            }
        }

        tracing::info!(
            job_id = %active.manifest.job_id,
            chunk = %active.chunk,
            elapsed_ms,
            "Chunk completed",
        );
        self.reports
            .push_chunk(ChunkEvent {
                job_id: active.manifest.job_id.clone(),
                range: active.chunk,
                outcome: ChunkOutcome::Completed {
                    elapsed_ms,
                    exit_code,
                },
            })
            .await;
        self.publish_status().await;
    }

    async fn finish_failed(&mut self, reason: &str) {
        self.flush_stdout().await;
        let Some(active) = self.active.take() else {
            return;
        };
        tracing::warn!(
            job_id = %active.manifest.job_id,
            chunk = %active.chunk,
            reason,
            "Chunk failed",
        );
        self.report_failure(&active.manifest, active.chunk, reason).await;
        self.publish_status().await;
    }

    async fn report_failure(&self, manifest: &JobManifest, chunk: ChunkRange, error: &str) {
        self.reports
            .push_chunk(ChunkEvent {
                job_id: manifest.job_id.clone(),
                range: chunk,
                outcome: ChunkOutcome::Failed {
                    error: error.to_string(),
                },
            })
            .await;
    }

    /// Append buffered stdout lines to the shared log file.
    async fn flush_stdout(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.stdout_buffer.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut active.stdout_buffer);
        let path = active.log_path.clone();

        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            let mut block = lines.join("\n");
            block.push('\n');
            file.write_all(block.as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, path = %path.display(), "Stdout flush failed");
        }
    }

    /// Mirror the active state into the shared status and the registry.
    async fn publish_status(&self) {
        let (rendering, job_id, chunk_label) = match &self.active {
            Some(active) => (
                true,
                active.manifest.job_id.clone(),
                active.chunk.label(),
            ),
            None => (false, String::new(), String::new()),
        };

        {
            let mut status = self.status.write().await;
            status.rendering = rendering;
            status.job_id = job_id.clone();
            status.chunk_label = chunk_label.clone();
            if !rendering {
                status.progress = 0.0;
            }
        }

        let render_state = if rendering {
            RenderState::Rendering
        } else {
            RenderState::Idle
        };
        self.registry
            .set_render_state(render_state, &job_id, &chunk_label)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midrender_core::peer::{ContactOrigin, PeerInfo};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest(job_id: &str) -> JobManifest {
        let mut cmd = BTreeMap::new();
        for os in ["linux", "macos", "windows"] {
            cmd.insert(os.to_string(), "/usr/bin/true".to_string());
        }
        JobManifest {
            job_id: job_id.into(),
            template_id: "blender-cycles".into(),
            submitted_by: "test".into(),
            submitted_at_ms: 0,
            frame_start: 1,
            frame_end: 5,
            chunk_size: 5,
            max_retries: 3,
            timeout_seconds: None,
            output_dir: None,
            tags_required: vec![],
            cmd,
            flags: vec![],
            env: BTreeMap::new(),
            working_dir: None,
            progress_regex: None,
            frame_regex: None,
        }
    }

    /// Build a coordinator whose "agent" is a shell script.
    fn coordinator_with_agent(
        root: &std::path::Path,
        script: &str,
    ) -> (CoordinatorHandle, Arc<ReportQueue>, CancellationToken) {
        let (supervisor, updates) = AgentSupervisor::new(
            vec!["/bin/sh".into(), "-c".into(), script.into()],
            "test-node".into(),
        );
        let reports = Arc::new(ReportQueue::new());
        let registry = Arc::new(PeerRegistry::new(PeerInfo::minimal(
            "test-node",
            "127.0.0.1:0".into(),
            ContactOrigin::FromHttp,
        )));
        let cancel = CancellationToken::new();

        let handle = spawn_coordinator(
            CoordinatorConfig {
                node_id: "test-node".into(),
                node_os: crate::identity::os_tag().to_string(),
                farm: Arc::new(crate::farm::FarmPaths::new(root)),
                staging_root: root.join("staging"),
                staging_enabled: false,
                ack_timeout: Duration::from_secs(5),
                initially_stopped: false,
            },
            Arc::new(supervisor),
            updates,
            Arc::clone(&reports),
            registry,
            cancel.clone(),
        );
        (handle, reports, cancel)
    }

    async fn wait_for_counts(reports: &ReportQueue, chunks: usize, frames: usize) {
        for _ in 0..100 {
            if reports.pending_counts().await == (chunks, frames) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!(
            "report counts never reached ({chunks}, {frames}), got {:?}",
            reports.pending_counts().await
        );
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn happy_path_reports_frames_and_completion() {
        let root = TempDir::new().unwrap();
        // Fake agent: ack the task, complete one frame, then the chunk.
        let script = concat!(
            "read task; ",
            r#"printf '{"type":"ack"}\n'; "#,
            r#"printf '{"type":"frame_completed","frame":3}\n'; "#,
            r#"printf '{"type":"chunk_completed","exit_code":0,"elapsed_ms":1500}\n'"#,
        );
        let (handle, reports, cancel) = coordinator_with_agent(root.path(), script);

        assert!(handle.dispatch(manifest("shot-a"), ChunkRange::new(1, 5)).await);
        wait_for_counts(&reports, 1, 1).await;

        assert!(!handle.is_rendering().await);
        cancel.cancel();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn failing_renderer_reports_failure() {
        let root = TempDir::new().unwrap();
        let script = concat!(
            "read task; ",
            r#"printf '{"type":"ack"}\n'; "#,
            r#"printf '{"type":"chunk_failed","error":"out of memory"}\n'"#,
        );
        let (handle, reports, cancel) = coordinator_with_agent(root.path(), script);

        handle.dispatch(manifest("shot-a"), ChunkRange::new(1, 5)).await;
        wait_for_counts(&reports, 1, 0).await;
        cancel.cancel();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn agent_death_mid_render_fails_the_chunk() {
        let root = TempDir::new().unwrap();
        // Agent acks and then exits without a completion message.
        let script = concat!("read task; ", r#"printf '{"type":"ack"}\n'"#);
        let (handle, reports, cancel) = coordinator_with_agent(root.path(), script);

        handle.dispatch(manifest("shot-a"), ChunkRange::new(1, 5)).await;
        wait_for_counts(&reports, 1, 0).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn stopped_node_refuses_dispatch() {
        let root = TempDir::new().unwrap();
        let (handle, _reports, cancel) = coordinator_with_agent(root.path(), "read task");

        handle.set_stopped(true).await;
        // Give the command a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.dispatch(manifest("shot-a"), ChunkRange::new(1, 5)).await);
        cancel.cancel();
    }
}
