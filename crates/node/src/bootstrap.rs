//! Assembly of the node's components into an [`AppState`].
//!
//! Kept separate from `main` so integration tests can build the same
//! state against a temp directory without the network loops.

use std::sync::Arc;
use std::time::Duration;

use midrender_agent::AgentSupervisor;
use midrender_core::peer::{ContactOrigin, PeerInfo};
use midrender_mesh::PeerRegistry;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::engine::DispatchEngine;
use crate::farm::{init_farm, FarmPaths};
use crate::identity::{detect_local_ip, os_tag, NodeIdentity};
use crate::leader::LeaderState;
use crate::render::{spawn_coordinator, CoordinatorConfig};
use crate::reports::ReportQueue;
use crate::state::{load_persisted_node_state, AppState};

/// Build the full application state: identity, farm, registry, engine,
/// coordinator. Spawns the coordinator task (tied to `cancel`) but none
/// of the network loops -- `main` owns those.
pub async fn build_state(
    config: NodeConfig,
    cancel: CancellationToken,
) -> std::io::Result<AppState> {
    let config = Arc::new(config);

    let identity = Arc::new(NodeIdentity::load_or_generate(&config.data_dir).await?);
    tracing::info!(
        node_id = %identity.node_id,
        hostname = %identity.hostname,
        os = %identity.os,
        "Node identity loaded",
    );

    let farm = Arc::new(FarmPaths::new(&config.sync_root));
    init_farm(&farm, &identity.node_id).await?;

    let node_state = load_persisted_node_state(&config).await;

    let registry = Arc::new(PeerRegistry::new(build_local_base(
        &config, &identity, node_state,
    )));

    let (supervisor, agent_updates) = AgentSupervisor::new(
        config.agent_command.clone(),
        identity.node_id.clone(),
    );
    let supervisor = Arc::new(supervisor);

    if config.auto_start_agent {
        if let Err(e) = supervisor.spawn().await {
            tracing::warn!(error = %e, "Agent auto-start failed; will retry on first dispatch");
        }
    }

    let reports = Arc::new(ReportQueue::new());

    let coordinator = spawn_coordinator(
        CoordinatorConfig {
            node_id: identity.node_id.clone(),
            node_os: os_tag().to_string(),
            farm: Arc::clone(&farm),
            staging_root: config.data_dir.join("staging"),
            staging_enabled: config.staging_enabled,
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
            initially_stopped: node_state == midrender_core::types::NodeState::Stopped,
        },
        Arc::clone(&supervisor),
        agent_updates,
        Arc::clone(&reports),
        Arc::clone(&registry),
        cancel,
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .timeout(Duration::from_secs(3))
        .build()
        .expect("reqwest client construction cannot fail with static options");

    Ok(AppState {
        config,
        identity,
        farm,
        registry,
        leader: Arc::new(LeaderState::new()),
        engine: Arc::new(DispatchEngine::new()),
        coordinator,
        agent: supervisor,
        reports,
        http,
    })
}

/// The static part of the local node's peer record.
fn build_local_base(
    config: &NodeConfig,
    identity: &NodeIdentity,
    node_state: midrender_core::types::NodeState,
) -> PeerInfo {
    let ip = config
        .ip_override
        .clone()
        .unwrap_or_else(detect_local_ip);

    let mut info = PeerInfo::minimal(
        &identity.node_id,
        format!("{ip}:{}", config.http_port),
        ContactOrigin::FromHttp,
    );
    info.hostname = identity.hostname.clone();
    info.os = identity.os.clone();
    info.app_version = env!("CARGO_PKG_VERSION").to_string();
    info.gpu_name = identity.gpu_name.clone();
    info.cpu_cores = identity.cpu_cores;
    info.ram_mb = identity.ram_mb;
    info.priority = config.priority;
    info.tags = config.tags.clone();
    info.node_state = node_state;
    info.is_local = true;
    info
}
