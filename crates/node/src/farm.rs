//! Shared-filesystem farm layout and first-run initialisation.
//!
//! ```text
//! {sync_root}/MidRender-v{PROTOCOL_VERSION}/
//!   farm.json
//!   templates/
//!   nodes/{node_id}/endpoint.json
//!   jobs/{job_id}/stdout/{node_id}/{range}_{timestamp_ms}.log
//!   state/snapshot.db
//! ```

use std::path::{Path, PathBuf};

use midrender_core::types::{now_ms, ChunkRange, TimestampMs};
use serde::{Deserialize, Serialize};

/// Bumped when the farm layout or wire contract changes incompatibly.
/// The version is baked into the farm directory name, so incompatible
/// versions simply coexist side by side.
pub const PROTOCOL_VERSION: u32 = 2;

/// Contents of `farm.json`, written by the first node to start the farm.
#[derive(Debug, Serialize, Deserialize)]
pub struct FarmManifest {
    #[serde(rename = "_version")]
    pub version: u32,
    pub protocol_version: u32,
    pub created_by: String,
    pub created_at_ms: TimestampMs,
}

/// Resolved paths inside the farm directory.
#[derive(Debug, Clone)]
pub struct FarmPaths {
    root: PathBuf,
}

impl FarmPaths {
    /// Derive the farm root from the sync mount point.
    pub fn new(sync_root: &Path) -> Self {
        Self {
            root: sync_root.join(format!("MidRender-v{PROTOCOL_VERSION}")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn farm_json(&self) -> PathBuf {
        self.root.join("farm.json")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }

    /// Where a node streams one chunk's renderer stdout.
    pub fn stdout_log(&self, job_id: &str, node_id: &str, range: &ChunkRange) -> PathBuf {
        self.job_dir(job_id)
            .join("stdout")
            .join(node_id)
            .join(format!("{}_{}.log", range.label(), now_ms()))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir().join("snapshot.db")
    }
}

/// Create the farm directory skeleton and `farm.json` if this is the
/// first node to arrive. Later nodes reuse the existing farm and only
/// warn if its recorded protocol differs (the versioned directory name
/// makes a real mismatch unlikely).
pub async fn init_farm(paths: &FarmPaths, node_id: &str) -> std::io::Result<()> {
    for dir in [
        paths.templates_dir(),
        paths.jobs_dir(),
        paths.nodes_dir(),
        paths.state_dir(),
    ] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let farm_json = paths.farm_json();
    match tokio::fs::read(&farm_json).await {
        Ok(bytes) => match serde_json::from_slice::<FarmManifest>(&bytes) {
            Ok(manifest) => {
                if manifest.protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        found = manifest.protocol_version,
                        expected = PROTOCOL_VERSION,
                        "farm.json protocol version mismatch",
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable farm.json, leaving it in place");
            }
        },
        Err(_) => {
            let manifest = FarmManifest {
                version: 1,
                protocol_version: PROTOCOL_VERSION,
                created_by: node_id.to_string(),
                created_at_ms: now_ms(),
            };
            let json = serde_json::to_string_pretty(&manifest)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            tokio::fs::write(&farm_json, json).await?;
            tracing::info!(path = %farm_json.display(), "Farm initialised");
        }
    }

    Ok(())
}
