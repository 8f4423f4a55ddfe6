//! Leader-side store lifecycle.
//!
//! Only the elected leader holds the state store open. Becoming leader
//! restores the newest snapshot from the shared filesystem (or opens a
//! fresh store); losing leadership closes it. The open happens on the
//! transition watcher task so the HTTP surface and the registry loop
//! never wait on shared-filesystem I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use midrender_db::DbPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// How often the watcher compares election state against store state.
const TRANSITION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The leader store handle: `None` while this node is not the leader.
#[derive(Default)]
pub struct LeaderState {
    pool: RwLock<Option<DbPool>>,
    ready: AtomicBool,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the store is open and dispatch may run.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Clone of the open pool, if ready.
    pub async fn pool(&self) -> Option<DbPool> {
        if !self.is_ready() {
            return None;
        }
        self.pool.read().await.clone()
    }

    /// Open the store for a new leadership stint.
    ///
    /// Restores from the farm snapshot when one exists; falls back to a
    /// fresh store when the restore fails. On open failure the node
    /// simply never reports ready -- another candidate will take over.
    pub async fn open_store(&self, state: &AppState) {
        self.ready.store(false, Ordering::Relaxed);

        let snapshot = state.farm.snapshot_path();
        let local = state.config.data_dir.join("midrender.db");

        let pool = if tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
            tracing::info!("Restoring store from farm snapshot");
            match midrender_db::restore_from(&snapshot, &local).await {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(error = %e, "Snapshot restore failed, opening fresh store");
                    midrender_db::open(&local).await.ok()
                }
            }
        } else {
            midrender_db::open(&local).await.ok()
        };

        match pool {
            Some(pool) => {
                *self.pool.write().await = Some(pool);
                self.ready.store(true, Ordering::Relaxed);
                tracing::info!("Leader store ready");
            }
            None => {
                tracing::error!("Failed to open leader store; refusing to act as leader");
            }
        }
    }

    /// Close the store after losing leadership.
    pub async fn close_store(&self) {
        self.ready.store(false, Ordering::Relaxed);
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!("Leader store closed");
        }
    }
}

/// Watch for leadership transitions and open/close the store.
pub async fn run_transition_watcher(state: AppState, cancel: CancellationToken) {
    let mut was_leader = false;
    let mut ticker = tokio::time::interval(TRANSITION_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let is_leader = state.registry.is_leader();
                if is_leader && !was_leader {
                    tracing::info!("This node is now leader, opening store");
                    state.leader.open_store(&state).await;
                }
                if !is_leader && was_leader {
                    tracing::info!("No longer leader");
                    state.leader.close_store().await;
                }
                was_leader = is_leader;
            }
        }
    }

    // Leave no store open on the way out.
    state.leader.close_store().await;
}
