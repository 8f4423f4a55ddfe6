//! Row types and derived views for the `jobs` and `chunks` tables.

pub mod chunk;
pub mod job;

pub use chunk::{ChunkRow, PendingAssignment};
pub use job::{JobProgress, JobRow, JobSummary};
