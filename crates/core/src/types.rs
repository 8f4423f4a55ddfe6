//! Shared primitive types used across every crate.

use serde::{Deserialize, Serialize};

/// Stable node identifier, persistent across restarts.
pub type NodeId = String;

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// A contiguous, inclusive frame range -- the unit of assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub frame_start: i32,
    pub frame_end: i32,
}

impl ChunkRange {
    pub fn new(frame_start: i32, frame_end: i32) -> Self {
        Self {
            frame_start,
            frame_end,
        }
    }

    /// Number of frames in the range.
    pub fn len(&self) -> i32 {
        self.frame_end - self.frame_start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.frame_end < self.frame_start
    }

    pub fn contains(&self, frame: i32) -> bool {
        frame >= self.frame_start && frame <= self.frame_end
    }

    /// Short human label: `"f42"` for a single frame, `"f42-50"` otherwise.
    pub fn label(&self) -> String {
        if self.frame_start == self.frame_end {
            format!("f{}", self.frame_start)
        } else {
            format!("f{}-{}", self.frame_start, self.frame_end)
        }
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Whether this node accepts new render assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Active => "active",
            NodeState::Stopped => "stopped",
        }
    }

    /// Parse from the wire representation, defaulting to `Active` for
    /// unknown values so a newer peer never poisons an older registry.
    pub fn from_str(s: &str) -> Self {
        match s {
            "stopped" => NodeState::Stopped,
            _ => NodeState::Active,
        }
    }
}

/// Whether this node is currently running a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    Idle,
    Rendering,
}

impl RenderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderState::Idle => "idle",
            RenderState::Rendering => "rendering",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "rendering" => RenderState::Rendering,
            _ => RenderState::Idle,
        }
    }
}

/// Lifecycle state of a job. Only `active ↔ paused` is cyclic; the rest
/// are terminal for dispatch purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Paused,
    Cancelled,
    Completed,
    Archived,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobState::Active),
            "paused" => Some(JobState::Paused),
            "cancelled" => Some(JobState::Cancelled),
            "completed" => Some(JobState::Completed),
            "archived" => Some(JobState::Archived),
            _ => None,
        }
    }
}

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Assigned => "assigned",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkState::Pending),
            "assigned" => Some(ChunkState::Assigned),
            "completed" => Some(ChunkState::Completed),
            "failed" => Some(ChunkState::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_range_label_single_frame() {
        assert_eq!(ChunkRange::new(42, 42).label(), "f42");
    }

    #[test]
    fn chunk_range_label_span() {
        assert_eq!(ChunkRange::new(42, 50).label(), "f42-50");
    }

    #[test]
    fn chunk_range_len_and_contains() {
        let r = ChunkRange::new(10, 14);
        assert_eq!(r.len(), 5);
        assert!(r.contains(10));
        assert!(r.contains(14));
        assert!(!r.contains(15));
    }

    #[test]
    fn node_state_round_trip() {
        assert_eq!(NodeState::from_str("stopped"), NodeState::Stopped);
        assert_eq!(NodeState::from_str("active"), NodeState::Active);
        assert_eq!(NodeState::from_str("garbage"), NodeState::Active);
    }

    #[test]
    fn job_state_parse_rejects_unknown() {
        assert_eq!(JobState::parse("active"), Some(JobState::Active));
        assert_eq!(JobState::parse("archived"), Some(JobState::Archived));
        assert_eq!(JobState::parse("bogus"), None);
    }
}
