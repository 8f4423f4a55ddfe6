//! The peer-registry maintenance loop.
//!
//! Every ~3 seconds: refresh our own endpoint file, scan for new peers,
//! poll the ones UDP hasn't vouched for recently, garbage-collect peers
//! that are both dead and gone from the filesystem, and recompute the
//! leader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use midrender_core::peer::{PeerEndpoint, PeerInfo};
use midrender_core::types::now_ms;
use tokio_util::sync::CancellationToken;

use crate::discovery;
use crate::registry::PeerRegistry;

/// Cadence of the maintenance loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Connect budget for `GET /status`. LAN peers answer instantly.
const STATUS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Total budget for `GET /status`.
const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Long-running peer maintenance task.
pub struct PeerPoller {
    registry: Arc<PeerRegistry>,
    farm: PathBuf,
    client: reqwest::Client,
}

impl PeerPoller {
    pub fn new(registry: Arc<PeerRegistry>, farm: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(STATUS_CONNECT_TIMEOUT)
            .timeout(STATUS_REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            registry,
            farm,
            client,
        }
    }

    /// Run until cancelled. Writes the endpoint file immediately so
    /// other nodes can find us before the first full cycle completes.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(endpoint = %self.registry.local_endpoint(), "Peer poller started");
        self.write_own_endpoint().await;

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.cycle().await,
            }
        }

        discovery::remove_endpoint_file(&self.farm, self.registry.node_id()).await;
        tracing::info!("Peer poller stopped");
    }

    /// One full maintenance cycle.
    pub async fn cycle(&self) {
        self.write_own_endpoint().await;

        for ep in discovery::scan_endpoint_files(&self.farm, self.registry.node_id()).await {
            self.registry.upsert_from_endpoint_file(&ep).await;
        }

        self.registry.expire_udp_contact(now_ms()).await;
        self.poll_peers().await;
        self.collect_stale_peers().await;
        self.registry.recompute_leader().await;
    }

    async fn write_own_endpoint(&self) {
        let endpoint = self.registry.local_endpoint();
        let (ip, port) = match endpoint.rsplit_once(':') {
            Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(8420)),
            None => (endpoint.to_string(), 8420),
        };
        let ep = PeerEndpoint {
            node_id: self.registry.node_id().to_string(),
            ip,
            port,
            timestamp_ms: now_ms(),
        };
        if let Err(e) = discovery::write_endpoint_file(&self.farm, &ep).await {
            tracing::warn!(error = %e, "Failed to write endpoint file");
        }
    }

    /// HTTP-poll every peer the registry says needs it.
    async fn poll_peers(&self) {
        for (node_id, endpoint) in self.registry.peers_to_poll(now_ms()).await {
            let url = format!("http://{endpoint}/status");
            let result = self.client.get(&url).send().await;

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.json::<PeerInfo>().await {
                        Ok(wire) => {
                            self.registry
                                .apply_poll_success(&node_id, wire, now_ms())
                                .await;
                        }
                        Err(e) => {
                            tracing::debug!(node_id = %node_id, error = %e, "Malformed /status body");
                            self.registry.apply_poll_failure(&node_id).await;
                        }
                    }
                }
                _ => {
                    self.registry.apply_poll_failure(&node_id).await;
                }
            }
        }
    }

    /// Remove peers that are dead AND whose endpoint file is gone -- the
    /// node was shut down cleanly or its directory was cleaned up.
    async fn collect_stale_peers(&self) {
        for node_id in self.registry.dead_peers().await {
            if !discovery::endpoint_file_exists(&self.farm, &node_id).await {
                self.registry.remove_peer(&node_id).await;
            }
        }
    }
}
