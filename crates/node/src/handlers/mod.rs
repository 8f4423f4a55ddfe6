//! HTTP mesh handlers.

pub mod dispatch;
pub mod jobs;
pub mod status;

use midrender_db::DbPool;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Guard for leader-only endpoints.
///
/// A non-leader replies 503 `not_leader` with the leader's endpoint when
/// known; an elected leader whose store is still opening (or failed to
/// open) replies 503 as well, so callers retry rather than mutate
/// nothing.
pub async fn require_leader(state: &AppState) -> AppResult<DbPool> {
    if !state.registry.is_leader() {
        return Err(AppError::NotLeader {
            leader_endpoint: state.registry.leader_endpoint().await,
        });
    }
    state.leader.pool().await.ok_or(AppError::LeaderNotReady)
}
