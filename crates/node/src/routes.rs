//! HTTP mesh router.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{dispatch, jobs, status};
use crate::state::AppState;

/// Request timeout for the mesh service. Generous -- peers use much
/// shorter client-side budgets.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the full mesh router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Every node.
        .route("/status", get(status::get_status))
        .route("/peers", get(status::get_peers))
        .route("/node/stop", post(status::post_node_stop))
        .route("/node/start", post(status::post_node_start))
        .route("/dispatch/assign", post(dispatch::post_assign))
        // Leader-only (handlers guard with 503 not_leader).
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/{id}/pause", post(jobs::pause_job))
        .route("/jobs/{id}/resume", post(jobs::resume_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/archive", post(jobs::archive_job))
        .route("/jobs/{id}/requeue", post(jobs::requeue_job))
        .route("/jobs/{id}/retry-failed", post(jobs::retry_failed))
        .route("/jobs/{id}/resubmit", post(jobs::resubmit_job))
        .route("/dispatch/complete", post(dispatch::post_complete))
        .route("/dispatch/failed", post(dispatch::post_failed))
        .route(
            "/dispatch/frame-complete",
            post(dispatch::post_frame_complete),
        )
        .route("/nodes/{id}/unsuspend", post(dispatch::post_unsuspend))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
