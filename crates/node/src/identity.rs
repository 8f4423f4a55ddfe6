//! Node identity and hardware inventory.
//!
//! The node id is generated once and persisted under the data dir so it
//! survives restarts. Hardware facts are probed at startup: CPU and RAM
//! via `sysinfo`, GPU name via NVML. NVML is gracefully optional -- a
//! host without NVIDIA drivers simply advertises no GPU.

use std::path::Path;

use midrender_core::types::{now_ms, NodeId, TimestampMs};
use serde::{Deserialize, Serialize};

/// Persisted part of the identity: `{data_dir}/identity.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    node_id: NodeId,
    created_at_ms: TimestampMs,
}

/// The local node's identity and hardware facts.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub hostname: String,
    pub os: String,
    pub gpu_name: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,
}

impl NodeIdentity {
    /// Load the persisted node id or generate a fresh one, then probe
    /// system facts.
    pub async fn load_or_generate(data_dir: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join("identity.json");

        let node_id = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredIdentity>(&bytes) {
                Ok(stored) => stored.node_id,
                Err(e) => {
                    tracing::warn!(error = %e, "Corrupt identity.json, regenerating");
                    Self::generate_and_store(&path).await?
                }
            },
            Err(_) => Self::generate_and_store(&path).await?,
        };

        let (hostname, cpu_cores, ram_mb) = probe_system();
        let gpu_name = probe_gpu();

        Ok(Self {
            node_id,
            hostname,
            os: os_tag().to_string(),
            gpu_name,
            cpu_cores,
            ram_mb,
        })
    }

    async fn generate_and_store(path: &Path) -> std::io::Result<NodeId> {
        let node_id = format!("node-{}", uuid::Uuid::new_v4().simple());
        let stored = StoredIdentity {
            node_id: node_id.clone(),
            created_at_ms: now_ms(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, json).await?;
        tracing::info!(node_id = %node_id, "Generated new node identity");
        Ok(node_id)
    }
}

/// The OS tag used in manifests' per-OS command maps.
pub fn os_tag() -> &'static str {
    match std::env::consts::OS {
        "windows" => "windows",
        "macos" => "macos",
        _ => "linux",
    }
}

fn probe_system() -> (String, u32, u64) {
    let mut system = sysinfo::System::new();
    system.refresh_memory();

    let hostname = sysinfo::System::host_name().unwrap_or_default();
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(0);
    let ram_mb = system.total_memory() / (1024 * 1024);

    (hostname, cpu_cores, ram_mb)
}

/// GPU name via NVML, or empty when NVML is unavailable.
fn probe_gpu() -> String {
    let nvml = match nvml_wrapper::Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            tracing::debug!(error = %e, "NVML unavailable, no GPU info");
            return String::new();
        }
    };
    nvml.device_by_index(0)
        .and_then(|device| device.name())
        .unwrap_or_default()
}

/// Best-effort local IP detection: the address the OS would route
/// outbound traffic from. No packet is actually sent.
pub fn detect_local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("10.255.255.255:1")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn identity_persists_across_restarts() {
        let dir = TempDir::new().unwrap();
        let first = NodeIdentity::load_or_generate(dir.path()).await.unwrap();
        let second = NodeIdentity::load_or_generate(dir.path()).await.unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert!(first.node_id.starts_with("node-"));
    }

    #[tokio::test]
    async fn corrupt_identity_is_regenerated() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("identity.json"), b"{broken")
            .await
            .unwrap();
        let identity = NodeIdentity::load_or_generate(dir.path()).await.unwrap();
        assert!(identity.node_id.starts_with("node-"));
    }

    #[test]
    fn local_ip_detection_never_panics() {
        let ip = detect_local_ip();
        assert!(!ip.is_empty());
    }
}
