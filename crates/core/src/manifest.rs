//! Job manifests -- the immutable record of a submission.
//!
//! A manifest carries everything a worker needs to run one chunk of the
//! job: the frame range and chunking parameters, retry policy, and the
//! baked template payload (per-OS command line, flag values, environment,
//! progress regexes). Manifests are serialized as JSON into the `jobs`
//! table and travel over the HTTP mesh verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{ChunkRange, TimestampMs};

/// One flag on the render command line. The value may contain the
/// substitution tokens `{chunk_start}`, `{chunk_end}`, and `{frame}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFlag {
    /// Literal flag text, e.g. `-s` or `--render-output`. Empty for
    /// positional arguments.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Immutable record of a job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    /// Unique slug within the farm, e.g. `shot-040-beauty`.
    pub job_id: String,
    /// The template this manifest was baked from.
    pub template_id: String,
    /// Node that submitted the job.
    pub submitted_by: String,
    pub submitted_at_ms: TimestampMs,

    pub frame_start: i32,
    pub frame_end: i32,
    pub chunk_size: i32,
    pub max_retries: i32,
    /// Per-chunk timeout. `None` disables timeout enforcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Where the renderer writes frames. `None` when the template bakes
    /// the output path into its flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Tags a node must carry to be eligible for this job.
    #[serde(default)]
    pub tags_required: Vec<String>,

    /// Executable per OS tag (`windows`, `linux`, `macos`).
    #[serde(default)]
    pub cmd: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<ManifestFlag>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Regex extracting a percentage from a renderer stdout line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_regex: Option<String>,
    /// Regex extracting a completed frame number from a stdout line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_regex: Option<String>,
}

impl JobManifest {
    /// Check the submission invariants. Call before anything is written.
    pub fn validate(&self) -> CoreResult<()> {
        if self.job_id.is_empty() {
            return Err(CoreError::Validation("job_id must not be empty".into()));
        }
        if self.frame_start > self.frame_end {
            return Err(CoreError::Validation(format!(
                "frame_start {} > frame_end {}",
                self.frame_start, self.frame_end
            )));
        }
        if self.chunk_size < 1 {
            return Err(CoreError::Validation(format!(
                "chunk_size must be >= 1, got {}",
                self.chunk_size
            )));
        }
        if self.max_retries < 0 {
            return Err(CoreError::Validation(format!(
                "max_retries must be >= 0, got {}",
                self.max_retries
            )));
        }
        Ok(())
    }

    /// The executable for the given OS tag, if the template provides one.
    pub fn cmd_for_os(&self, os: &str) -> Option<&str> {
        self.cmd.get(os).map(String::as_str)
    }

    /// Check whether a node's tags satisfy `tags_required`.
    pub fn tags_satisfied_by(&self, node_tags: &[String]) -> bool {
        self.tags_required
            .iter()
            .all(|req| node_tags.iter().any(|t| t == req))
    }
}

/// Replace the chunk tokens in a template string.
///
/// `{chunk_start}` and `{chunk_end}` expand to the range bounds; `{frame}`
/// expands to the range start (templates using `{frame}` are expected to
/// run with `chunk_size = 1`).
pub fn substitute_tokens(input: &str, chunk: &ChunkRange) -> String {
    input
        .replace("{chunk_start}", &chunk.frame_start.to_string())
        .replace("{chunk_end}", &chunk.frame_end.to_string())
        .replace("{frame}", &chunk.frame_start.to_string())
}

/// Strip any `-vN` suffix from a job slug, returning the base slug.
///
/// Used by resubmission to derive `shot-040-v3` from `shot-040-v2`
/// rather than producing `shot-040-v2-v2`.
pub fn strip_version_suffix(slug: &str) -> &str {
    if let Some(pos) = slug.rfind("-v") {
        let tail = &slug[pos + 2..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return &slug[..pos];
        }
    }
    slug
}
