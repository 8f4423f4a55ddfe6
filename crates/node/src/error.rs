//! Application-level error type for HTTP handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use midrender_core::error::CoreError;
use serde_json::json;

/// Wraps [`CoreError`] for domain errors and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON
/// error bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// This node is not the leader; leader-only endpoints reply 503 so
    /// the caller can retry against `leader_endpoint`.
    #[error("Not the leader")]
    NotLeader { leader_endpoint: Option<String> },

    /// The leader's store is still opening (or failed to open).
    #[error("Leader store is not ready")]
    LeaderNotReady,

    /// Dispatch conflict: this worker cannot take the assignment.
    #[error("{0}")]
    Busy(&'static str),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    json!({"error": format!("{entity} '{id}' not found"), "code": "NOT_FOUND"}),
                ),
                CoreError::Validation(msg) => (
                    StatusCode::BAD_REQUEST,
                    json!({"error": msg, "code": "VALIDATION_ERROR"}),
                ),
                CoreError::Conflict(msg) => (
                    StatusCode::CONFLICT,
                    json!({"error": msg, "code": "CONFLICT"}),
                ),
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({"error": "An internal error occurred", "code": "INTERNAL_ERROR"}),
                    )
                }
            },

            AppError::Database(err) => match err {
                sqlx::Error::RowNotFound => (
                    StatusCode::NOT_FOUND,
                    json!({"error": "Resource not found", "code": "NOT_FOUND"}),
                ),
                other => {
                    tracing::error!(error = %other, "Database error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({"error": "An internal error occurred", "code": "INTERNAL_ERROR"}),
                    )
                }
            },

            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, json!({"error": msg, "code": "BAD_REQUEST"}))
            }

            AppError::NotLeader { leader_endpoint } => {
                let mut body = json!({"error": "not_leader"});
                if let Some(ep) = leader_endpoint {
                    body["leader_endpoint"] = json!(ep);
                }
                (StatusCode::SERVICE_UNAVAILABLE, body)
            }

            AppError::LeaderNotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "leader_db_not_ready"}),
            ),

            AppError::Busy(reason) => (StatusCode::CONFLICT, json!({"error": reason})),

            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "An internal error occurred", "code": "INTERNAL_ERROR"}),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}
