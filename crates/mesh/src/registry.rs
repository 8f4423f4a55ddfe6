//! The authoritative view of all known peers.
//!
//! Read-mostly shared state: readers (dispatch, HTTP handlers, the UDP
//! heartbeat builder) take snapshots; writers (the poll loop and the UDP
//! receive path) serialise through the inner lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use midrender_core::election::{self, Candidate};
use midrender_core::peer::{ContactOrigin, PeerEndpoint, PeerInfo};
use midrender_core::types::{NodeId, NodeState, RenderState, TimestampMs};
use tokio::sync::RwLock;

/// Consecutive failed HTTP polls before a peer is declared dead.
pub const DEAD_POLL_THRESHOLD: u32 = 3;

/// A peer with UDP contact this recent skips HTTP polling.
pub const UDP_FRESH_MS: i64 = 9_000;

/// UDP silence past this clears `has_udp_contact` and resumes polling.
pub const UDP_STALE_MS: i64 = 15_000;

/// Volatile state of the local node mirrored into heartbeats and
/// `GET /status` responses.
#[derive(Debug, Clone)]
struct LocalState {
    node_state: NodeState,
    render_state: RenderState,
    active_job: String,
    active_chunk: String,
}

/// Registry of all known peers plus the local node's own record.
pub struct PeerRegistry {
    /// Static facts about the local node (identity, hardware, endpoint).
    local_base: PeerInfo,
    local: RwLock<LocalState>,
    /// node_id -> record, excludes the local node.
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
    leader_id: RwLock<Option<NodeId>>,
    is_leader: AtomicBool,
}

impl PeerRegistry {
    /// Create a registry around the local node's base record.
    ///
    /// `local_base` carries identity, hardware, tags, priority, and the
    /// advertised endpoint; its volatile fields are overridden on read.
    pub fn new(local_base: PeerInfo) -> Self {
        let node_state = local_base.node_state;
        Self {
            local_base,
            local: RwLock::new(LocalState {
                node_state,
                render_state: RenderState::Idle,
                active_job: String::new(),
                active_chunk: String::new(),
            }),
            peers: RwLock::new(HashMap::new()),
            leader_id: RwLock::new(None),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.local_base.node_id
    }

    pub fn local_endpoint(&self) -> &str {
        &self.local_base.endpoint
    }

    pub fn local_tags(&self) -> &[String] {
        &self.local_base.tags
    }

    /// The local node's full record with current volatile state.
    pub async fn local_info(&self) -> PeerInfo {
        let local = self.local.read().await;
        let mut info = self.local_base.clone();
        info.node_state = local.node_state;
        info.render_state = local.render_state;
        info.active_job = local.active_job.clone();
        info.active_chunk = local.active_chunk.clone();
        info.is_local = true;
        info.is_alive = true;
        info.is_leader = self.is_leader();
        info
    }

    /// Consistent snapshot of all peers (excludes the local node).
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Snapshot of peers plus the local record -- dispatch iterates this.
    pub async fn snapshot_with_local(&self) -> Vec<PeerInfo> {
        let mut all = self.snapshot().await;
        all.push(self.local_info().await);
        all
    }

    // ---- local state setters ----

    pub async fn set_render_state(&self, state: RenderState, job: &str, chunk: &str) {
        let mut local = self.local.write().await;
        local.render_state = state;
        local.active_job = job.to_string();
        local.active_chunk = chunk.to_string();
    }

    pub async fn set_node_state(&self, state: NodeState) {
        self.local.write().await.node_state = state;
    }

    pub async fn node_state(&self) -> NodeState {
        self.local.read().await.node_state
    }

    /// Optimistic local update after a remote stop/start call, so the
    /// change shows before the peer's next heartbeat confirms it.
    pub async fn set_peer_node_state(&self, node_id: &str, state: NodeState) {
        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            peer.node_state = state;
        }
    }

    // ---- discovery & liveness updates ----

    /// Insert a minimal record for a peer found via its endpoint file.
    /// Known peers are left untouched -- HTTP polling owns their detail.
    pub async fn upsert_from_endpoint_file(&self, ep: &PeerEndpoint) {
        if ep.node_id == self.local_base.node_id {
            return;
        }
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&ep.node_id) {
            tracing::info!(node_id = %ep.node_id, endpoint = %ep.endpoint(), "Discovered peer via endpoint file");
            peers.insert(
                ep.node_id.clone(),
                PeerInfo::minimal(&ep.node_id, ep.endpoint(), ContactOrigin::FromEndpointFile),
            );
        }
    }

    /// Fast-path upsert from a UDP heartbeat.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_udp_heartbeat(
        &self,
        node_id: &str,
        endpoint: String,
        node_state: NodeState,
        render_state: RenderState,
        active_job: String,
        active_chunk: String,
        priority: i32,
        now_ms: TimestampMs,
    ) {
        if node_id == self.local_base.node_id {
            return;
        }
        let mut peers = self.peers.write().await;
        let peer = peers.entry(node_id.to_string()).or_insert_with(|| {
            tracing::info!(node_id, endpoint = %endpoint, "Discovered peer via UDP");
            PeerInfo::minimal(node_id, endpoint.clone(), ContactOrigin::FromUdp)
        });

        peer.node_state = node_state;
        peer.render_state = render_state;
        peer.active_job = active_job;
        peer.active_chunk = active_chunk;
        peer.priority = priority;
        peer.is_alive = true;
        peer.failed_polls = 0;
        peer.has_udp_contact = true;
        peer.last_udp_contact_ms = now_ms;
        if peer.endpoint != endpoint {
            peer.endpoint = endpoint;
        }
    }

    pub async fn process_udp_goodbye(&self, node_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            tracing::info!(node_id, "Peer goodbye via UDP");
            peer.is_alive = false;
            peer.has_udp_contact = false;
        }
    }

    /// Merge a successful `GET /status` response, preserving the runtime
    /// bookkeeping the wire form does not carry.
    pub async fn apply_poll_success(&self, node_id: &str, wire: PeerInfo, now_ms: TimestampMs) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            let mut updated = wire;
            updated.is_local = false;
            updated.is_alive = true;
            updated.is_leader = peer.is_leader;
            updated.failed_polls = 0;
            updated.last_seen_ms = now_ms;
            updated.has_udp_contact = peer.has_udp_contact;
            updated.last_udp_contact_ms = peer.last_udp_contact_ms;
            updated.origin = Some(ContactOrigin::FromHttp);
            *peer = updated;
        }
    }

    /// Count one failed (or malformed) poll. Returns `true` when this
    /// failure crossed the dead threshold.
    pub async fn apply_poll_failure(&self, node_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(node_id) else {
            return false;
        };
        peer.failed_polls += 1;
        if peer.failed_polls >= DEAD_POLL_THRESHOLD && peer.is_alive {
            peer.is_alive = false;
            tracing::warn!(node_id, failed_polls = peer.failed_polls, "Peer dead");
            return true;
        }
        false
    }

    /// Clear `has_udp_contact` on peers whose UDP has gone silent.
    pub async fn expire_udp_contact(&self, now_ms: TimestampMs) {
        let mut peers = self.peers.write().await;
        for (id, peer) in peers.iter_mut() {
            if peer.has_udp_contact && now_ms - peer.last_udp_contact_ms > UDP_STALE_MS {
                peer.has_udp_contact = false;
                tracing::info!(node_id = %id, "UDP contact lost");
            }
        }
    }

    /// Which peers need an HTTP poll this cycle.
    ///
    /// A peer with fresh UDP contact and a recent successful poll is
    /// skipped -- UDP already proves liveness, and hardware detail does
    /// not change that fast. A peer never successfully polled is always
    /// polled so its record gets filled in.
    pub async fn peers_to_poll(&self, now_ms: TimestampMs) -> Vec<(NodeId, String)> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, p)| {
                !(p.has_udp_contact
                    && !p.hostname.is_empty()
                    && p.last_seen_ms > 0
                    && now_ms - p.last_seen_ms < UDP_FRESH_MS)
            })
            .map(|(id, p)| (id.clone(), p.endpoint.clone()))
            .collect()
    }

    /// Dead peers, candidates for garbage collection when their endpoint
    /// file is gone too.
    pub async fn dead_peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, p)| !p.is_alive)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn remove_peer(&self, node_id: &str) {
        if self.peers.write().await.remove(node_id).is_some() {
            tracing::info!(node_id, "Removed stale peer");
        }
    }

    // ---- election ----

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.leader_id.read().await.clone()
    }

    /// The current leader's endpoint, with the self-if-leader shortcut.
    pub async fn leader_endpoint(&self) -> Option<String> {
        if self.is_leader() {
            return Some(self.local_base.endpoint.clone());
        }
        self.peers
            .read()
            .await
            .values()
            .find(|p| p.is_leader && p.is_alive)
            .map(|p| p.endpoint.clone())
    }

    /// Recompute the leader from the local node plus all alive peers.
    ///
    /// Deterministic: every node running this over the same alive-set
    /// picks the same winner. Returns the new leader id.
    pub async fn recompute_leader(&self) -> Option<NodeId> {
        let mut peers = self.peers.write().await;

        let mut candidates = vec![Candidate::new(
            self.local_base.node_id.clone(),
            &self.local_base.tags,
        )];
        for (id, peer) in peers.iter() {
            if peer.is_alive {
                candidates.push(Candidate::new(id.clone(), &peer.tags));
            }
        }

        let winner = election::elect(&candidates);

        let previous = self.leader_id.read().await.clone();
        if winner != previous {
            tracing::info!(
                leader = winner.as_deref().unwrap_or("<none>"),
                is_self = winner.as_deref() == Some(self.node_id()),
                "Leader elected",
            );
        }

        let is_self = winner.as_deref() == Some(self.local_base.node_id.as_str());
        self.is_leader.store(is_self, Ordering::Relaxed);
        for (id, peer) in peers.iter_mut() {
            peer.is_leader = winner.as_deref() == Some(id.as_str());
        }
        *self.leader_id.write().await = winner.clone();

        winner
    }
}
