//! Agent IPC message types and parser.
//!
//! Both directions use one JSON object per line with an internally-tagged
//! `"type"` field. Unknown types or malformed frames are parse errors;
//! callers log them and continue.

use serde::{Deserialize, Serialize};

/// Messages the coordinator sends to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Start rendering one chunk. The payload is the fully substituted
    /// task description (command line, environment, log destination).
    StartTask { task: serde_json::Value },
    /// Stop the running task.
    Abort { reason: String },
    /// Liveness probe; the agent answers with `pong`.
    Ping,
    /// Ask the agent to exit cleanly.
    Shutdown,
}

/// Messages the agent sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent accepted a `start_task`.
    Ack,
    /// Render progress, either a percentage or a step counter.
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pct: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// One frame of the chunk finished rendering.
    FrameCompleted { frame: i32 },
    /// A line of renderer stdout.
    StdoutLine { text: String },
    /// The renderer exited. Exit code 0 means success.
    ChunkCompleted { exit_code: i32, elapsed_ms: i64 },
    /// The task failed before or during rendering.
    ChunkFailed { error: String },
    /// Agent-internal state announcement (diagnostic only).
    State { name: String },
    /// Answer to `ping`.
    Pong,
}

impl AgentEvent {
    /// Normalise a progress message to a fraction in `[0, 1]`.
    pub fn progress_fraction(&self) -> Option<f32> {
        match self {
            AgentEvent::Progress { pct: Some(p), .. } => Some((p / 100.0).clamp(0.0, 1.0)),
            AgentEvent::Progress {
                value: Some(v),
                max: Some(m),
                ..
            } if *m > 0 => Some((*v as f32 / *m as f32).clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

/// Parse one IPC line into a typed event.
pub fn parse_event(line: &str) -> Result<AgentEvent, serde_json::Error> {
    serde_json::from_str(line)
}
