//! Domain error type shared by all crates.

use thiserror::Error;

/// Errors produced by domain-level validation and lookups.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A named entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        entity: &'static str,
        id: String,
    },

    /// Input failed an invariant check.
    #[error("{0}")]
    Validation(String),

    /// The operation conflicts with current state (e.g. busy worker).
    #[error("{0}")]
    Conflict(String),

    /// An unexpected internal failure.
    #[error("{0}")]
    Internal(String),
}

/// Convenience alias used throughout the domain crates.
pub type CoreResult<T> = Result<T, CoreError>;
