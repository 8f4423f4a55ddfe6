//! Peer records shared between the mesh, the HTTP surface, and dispatch.

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeState, RenderState, TimestampMs};

/// Contents of `{farm}/nodes/{node_id}/endpoint.json` -- the filesystem
/// half of peer discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub timestamp_ms: TimestampMs,
}

impl PeerEndpoint {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Which path last told us about a peer. Purely a diagnostic hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactOrigin {
    FromUdp,
    FromEndpointFile,
    FromHttp,
}

/// Full peer status.
///
/// The serialized form is the wire contract for `GET /status` and
/// `GET /peers`; runtime liveness bookkeeping stays local and is never
/// sent over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    // Identity
    pub node_id: NodeId,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub app_version: String,

    // Hardware
    #[serde(default)]
    pub gpu_name: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram_mb: u64,

    // State
    #[serde(default = "default_node_state")]
    pub node_state: NodeState,
    #[serde(default = "default_render_state")]
    pub render_state: RenderState,
    #[serde(default)]
    pub active_job: String,
    #[serde(default)]
    pub active_chunk: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,

    // Network: "ip:port"
    #[serde(default)]
    pub endpoint: String,

    // Runtime bookkeeping -- maintained by the local registry only.
    #[serde(skip)]
    pub is_local: bool,
    #[serde(skip, default = "default_true")]
    pub is_alive: bool,
    #[serde(skip)]
    pub is_leader: bool,
    #[serde(skip)]
    pub failed_polls: u32,
    /// Last successful HTTP poll, 0 if never polled.
    #[serde(skip)]
    pub last_seen_ms: TimestampMs,
    #[serde(skip)]
    pub has_udp_contact: bool,
    #[serde(skip)]
    pub last_udp_contact_ms: TimestampMs,
    #[serde(skip)]
    pub origin: Option<ContactOrigin>,
}

fn default_node_state() -> NodeState {
    NodeState::Active
}

fn default_render_state() -> RenderState {
    RenderState::Idle
}

fn default_priority() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

impl PeerInfo {
    /// A minimal record for a peer we have only just discovered -- no
    /// hardware info until the first successful HTTP poll.
    pub fn minimal(node_id: impl Into<NodeId>, endpoint: String, origin: ContactOrigin) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: String::new(),
            os: String::new(),
            app_version: String::new(),
            gpu_name: String::new(),
            cpu_cores: 0,
            ram_mb: 0,
            node_state: NodeState::Active,
            render_state: RenderState::Idle,
            active_job: String::new(),
            active_chunk: String::new(),
            priority: default_priority(),
            tags: Vec::new(),
            endpoint,
            is_local: false,
            is_alive: true,
            is_leader: false,
            failed_polls: 0,
            last_seen_ms: 0,
            has_udp_contact: false,
            last_udp_contact_ms: 0,
            origin: Some(origin),
        }
    }
}
