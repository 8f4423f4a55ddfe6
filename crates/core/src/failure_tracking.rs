//! Machine-level failure tracking.
//!
//! Counts chunk failures per node in a sliding window and suspends nodes
//! that misbehave repeatedly. Suspension is sticky: once set, only an
//! operator's unsuspend clears it.

use std::collections::HashMap;

use crate::types::{NodeId, TimestampMs};

/// Failures within the window before a node is suspended.
pub const SUSPEND_THRESHOLD: u32 = 5;

/// Width of the sliding failure window.
pub const SUSPEND_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Per-node failure bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureRecord {
    pub failure_count: u32,
    pub first_failure_ms: TimestampMs,
    pub last_failure_ms: TimestampMs,
    pub suspended: bool,
}

/// Tracks chunk failures per node id and flags pathological machines.
#[derive(Debug, Default)]
pub struct NodeFailureTracker {
    records: HashMap<NodeId, FailureRecord>,
}

impl NodeFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure for `node_id` at `now_ms`.
    ///
    /// A failure arriving after the window has elapsed since the first
    /// failure restarts the window with a count of 1. Reaching
    /// [`SUSPEND_THRESHOLD`] within one window suspends the node.
    /// Returns `true` if this call newly suspended the node.
    pub fn record_failure(&mut self, node_id: &str, now_ms: TimestampMs) -> bool {
        let r = self.records.entry(node_id.to_string()).or_default();

        if r.first_failure_ms > 0 && now_ms - r.first_failure_ms > SUSPEND_WINDOW_MS {
            r.failure_count = 0;
            r.first_failure_ms = now_ms;
        }

        if r.failure_count == 0 {
            r.first_failure_ms = now_ms;
        }

        r.failure_count += 1;
        r.last_failure_ms = now_ms;

        let was_suspended = r.suspended;
        if r.failure_count >= SUSPEND_THRESHOLD {
            r.suspended = true;
        }
        r.suspended && !was_suspended
    }

    pub fn is_suspended(&self, node_id: &str) -> bool {
        self.records.get(node_id).is_some_and(|r| r.suspended)
    }

    /// Operator unsuspend: drops the node's record entirely so the next
    /// failure starts a fresh window.
    pub fn clear_node(&mut self, node_id: &str) {
        self.records.remove(node_id);
    }

    pub fn clear_all(&mut self) {
        self.records.clear();
    }

    pub fn record(&self, node_id: &str) -> Option<&FailureRecord> {
        self.records.get(node_id)
    }

    /// All currently suspended nodes with their records.
    pub fn suspended(&self) -> Vec<(NodeId, FailureRecord)> {
        self.records
            .iter()
            .filter(|(_, r)| r.suspended)
            .map(|(id, r)| (id.clone(), *r))
            .collect()
    }
}
