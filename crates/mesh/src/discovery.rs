//! Filesystem-based peer discovery.
//!
//! Every node writes `{farm}/nodes/{node_id}/endpoint.json` on startup
//! and refreshes it each registry tick; a scanner picks up everyone
//! else's. Shared mounts in the wild (SMB, LucidLink) don't always
//! support atomic rename, so the writer falls back to a direct
//! overwrite, and the reader treats unparseable files as "not there yet".

use std::path::{Path, PathBuf};

use midrender_core::peer::PeerEndpoint;

/// Directory holding one subdirectory per node.
pub fn nodes_dir(farm: &Path) -> PathBuf {
    farm.join("nodes")
}

/// Path of a node's endpoint file.
pub fn endpoint_path(farm: &Path, node_id: &str) -> PathBuf {
    nodes_dir(farm).join(node_id).join("endpoint.json")
}

/// Write this node's endpoint file, atomically where the mount allows.
pub async fn write_endpoint_file(farm: &Path, ep: &PeerEndpoint) -> std::io::Result<()> {
    let path = endpoint_path(farm, &ep.node_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(ep)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    if tokio::fs::rename(&tmp, &path).await.is_err() {
        // Rename failed (cross-device or unsupported) -- overwrite in place.
        let _ = tokio::fs::remove_file(&tmp).await;
        tokio::fs::write(&path, &json).await?;
    }
    Ok(())
}

/// Remove this node's endpoint file on shutdown.
pub async fn remove_endpoint_file(farm: &Path, node_id: &str) {
    let _ = tokio::fs::remove_file(endpoint_path(farm, node_id)).await;
}

pub async fn endpoint_file_exists(farm: &Path, node_id: &str) -> bool {
    tokio::fs::try_exists(endpoint_path(farm, node_id))
        .await
        .unwrap_or(false)
}

/// Scan the nodes directory for peer endpoint files.
///
/// Skips the local node's own entry. Missing or malformed files are
/// skipped silently -- a peer may be mid-write, or its mount may have
/// produced a truncated read.
pub async fn scan_endpoint_files(farm: &Path, self_node_id: &str) -> Vec<PeerEndpoint> {
    let mut found = Vec::new();

    let Ok(mut entries) = tokio::fs::read_dir(nodes_dir(farm)).await else {
        return found;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let node_id = entry.file_name().to_string_lossy().to_string();
        if node_id == self_node_id {
            continue;
        }

        let path = entry.path().join("endpoint.json");
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };
        match serde_json::from_slice::<PeerEndpoint>(&bytes) {
            Ok(ep) => found.push(ep),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping malformed endpoint file");
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint(node_id: &str) -> PeerEndpoint {
        PeerEndpoint {
            node_id: node_id.into(),
            ip: "10.0.0.5".into(),
            port: 8420,
            timestamp_ms: 1234,
        }
    }

    #[tokio::test]
    async fn write_then_scan_round_trip() {
        let farm = TempDir::new().unwrap();
        write_endpoint_file(farm.path(), &endpoint("peer-1")).await.unwrap();
        write_endpoint_file(farm.path(), &endpoint("peer-2")).await.unwrap();

        let mut found = scan_endpoint_files(farm.path(), "self").await;
        found.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].node_id, "peer-1");
        assert_eq!(found[0].endpoint(), "10.0.0.5:8420");
    }

    #[tokio::test]
    async fn scan_skips_self_and_malformed_files() {
        let farm = TempDir::new().unwrap();
        write_endpoint_file(farm.path(), &endpoint("self")).await.unwrap();

        // A peer mid-write: truncated JSON.
        let broken_dir = nodes_dir(farm.path()).join("broken");
        tokio::fs::create_dir_all(&broken_dir).await.unwrap();
        tokio::fs::write(broken_dir.join("endpoint.json"), b"{\"node_id\": \"bro")
            .await
            .unwrap();

        // A node directory with no endpoint file at all.
        tokio::fs::create_dir_all(nodes_dir(farm.path()).join("empty"))
            .await
            .unwrap();

        let found = scan_endpoint_files(farm.path(), "self").await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn rewrite_replaces_content() {
        let farm = TempDir::new().unwrap();
        let mut ep = endpoint("peer-1");
        write_endpoint_file(farm.path(), &ep).await.unwrap();

        ep.port = 9000;
        ep.timestamp_ms = 5678;
        write_endpoint_file(farm.path(), &ep).await.unwrap();

        let found = scan_endpoint_files(farm.path(), "self").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 9000);
        assert_eq!(found[0].timestamp_ms, 5678);
    }

    #[tokio::test]
    async fn remove_clears_the_file() {
        let farm = TempDir::new().unwrap();
        write_endpoint_file(farm.path(), &endpoint("peer-1")).await.unwrap();
        assert!(endpoint_file_exists(farm.path(), "peer-1").await);

        remove_endpoint_file(farm.path(), "peer-1").await;
        assert!(!endpoint_file_exists(farm.path(), "peer-1").await);
        assert!(scan_endpoint_files(farm.path(), "self").await.is_empty());
    }

    #[tokio::test]
    async fn scan_of_missing_nodes_dir_is_empty() {
        let farm = TempDir::new().unwrap();
        assert!(scan_endpoint_files(farm.path(), "self").await.is_empty());
    }
}
