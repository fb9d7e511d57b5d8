//! Gateway-wide error taxonomy.
//!
//! Every failure that can reach a caller is one of these variants. The HTTP
//! layer turns them into `{ "error": kind, "message": ... }` responses; none of
//! them should take the serving process down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The context medium (Redis, SQLite, ...) could not be reached.
    #[error("context storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("backend '{id}' failed to load: {cause}")]
    BackendLoadFailed { id: String, cause: String },

    /// Anything that went wrong while resolving or invoking a backend for one turn.
    #[error("generation failed: {reason}")]
    GenerationFailed { reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("routing key '{0}' cannot be resolved to a registered backend")]
    RoutingKeyUnresolvable(String),

    #[error("invalid request parameters: {0}")]
    InvalidParameters(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::StorageUnavailable(_) => "storage_unavailable",
            GatewayError::BackendLoadFailed { .. } => "backend_load_failed",
            GatewayError::GenerationFailed { .. } => "generation_failed",
            GatewayError::SessionNotFound(_) => "session_not_found",
            GatewayError::RoutingKeyUnresolvable(_) => "routing_key_unresolvable",
            GatewayError::InvalidParameters(_) => "invalid_parameters",
            GatewayError::Config(_) => "configuration_error",
        }
    }

    /// Storage failures are transient from the caller's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::StorageUnavailable(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        GatewayError::StorageUnavailable(err.to_string())
    }

    pub fn generation(reason: impl Into<String>) -> Self {
        GatewayError::GenerationFailed { reason: reason.into() }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::storage(err)
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(err: r2d2::Error) -> Self {
        GatewayError::storage(err)
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::storage(err)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
