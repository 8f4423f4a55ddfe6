//! Agent process lifecycle and the stdio IPC channel.
//!
//! The supervisor spawns the agent with piped stdio, writes one JSON
//! command per line to its stdin, and runs a reader task that parses
//! stdout lines into [`AgentEvent`]s. Events and the disconnect signal
//! are delivered to the render coordinator over an mpsc channel.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};

use crate::messages::{parse_event, AgentCommand, AgentEvent};

/// Channel capacity for agent -> coordinator updates. Stdout lines are
/// the dominant traffic; the coordinator drains them every tick.
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// How long `shutdown` waits for a clean exit before killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the coordinator receives from the supervisor.
#[derive(Debug, Clone)]
pub enum AgentUpdate {
    Message(AgentEvent),
    /// The agent's stdout closed -- the process died or shut down.
    Disconnected,
}

/// Errors from supervising the agent process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent is not running")]
    NotRunning,

    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),

    #[error("IPC write failed: {0}")]
    Ipc(#[from] std::io::Error),

    #[error("command is not serialisable: {0}")]
    Encode(#[from] serde_json::Error),
}

struct AgentProcess {
    child: Child,
    stdin: ChildStdin,
}

/// Owns the agent child process and the IPC channel to it.
pub struct AgentSupervisor {
    /// Program + arguments used to launch the agent.
    command: Vec<String>,
    node_id: String,
    process: Mutex<Option<AgentProcess>>,
    updates_tx: mpsc::Sender<AgentUpdate>,
    connected: Arc<AtomicBool>,
}

impl AgentSupervisor {
    /// Create a supervisor. The returned receiver delivers agent events
    /// and the disconnect signal; hand it to the render coordinator.
    pub fn new(command: Vec<String>, node_id: String) -> (Self, mpsc::Receiver<AgentUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        (
            Self {
                command,
                node_id,
                process: Mutex::new(None),
                updates_tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
            updates_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Spawn the agent process and start the stdout reader task.
    ///
    /// A second spawn while one is running is a no-op.
    pub async fn spawn(&self) -> Result<(), SupervisorError> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let (program, args) = self.command.split_first().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "agent command is empty",
            ))
        })?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .env("MIDRENDER_NODE_ID", &self.node_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let pid = child.id();

        tracing::info!(?pid, program = %program, "Agent spawned");
        self.connected.store(true, Ordering::Relaxed);

        let updates_tx = self.updates_tx.clone();
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match parse_event(line) {
                            Ok(event) => {
                                if updates_tx.send(AgentUpdate::Message(event)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, raw = %line, "Malformed agent message");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Agent stdout read error");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
            let _ = updates_tx.send(AgentUpdate::Disconnected).await;
            tracing::info!("Agent IPC reader exited");
        });

        *guard = Some(AgentProcess { child, stdin });
        Ok(())
    }

    /// Send one command as a JSON line.
    pub async fn send(&self, command: &AgentCommand) -> Result<(), SupervisorError> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(SupervisorError::NotRunning)?;
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<(), SupervisorError> {
        self.send(&AgentCommand::Ping).await
    }

    /// Ask the agent to exit, then kill it if it overstays the grace
    /// period.
    pub async fn shutdown(&self) {
        let _ = self.send(&AgentCommand::Shutdown).await;

        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(?status, "Agent exited");
                }
                _ => {
                    tracing::warn!("Agent did not exit in time, killing");
                    let _ = process.child.kill().await;
                }
            }
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Kill the agent immediately.
    pub async fn kill(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let _ = process.child.kill().await;
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}
