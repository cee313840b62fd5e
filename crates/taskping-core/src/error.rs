//! Error taxonomy for the delivery engine.
//!
//! Transport errors are classified at the channel boundary — callers above
//! the guard only ever see these variants, never raw HTTP/socket errors.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TaskPingError>;

/// Classified engine error.
#[derive(Debug, Clone, Error)]
pub enum TaskPingError {
    /// The chat platform asked us to back off. Retryable after the window.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Workspace token revoked or uninstalled. Fatal to the workspace,
    /// not the process — delivery stays disabled until re-authorized.
    #[error("authentication revoked for workspace {0}")]
    AuthRevoked(String),

    /// Target channel no longer exists. Fatal to the single record.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// Recipient unknown to the platform. Fatal to the single record.
    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    /// Service unavailable, timeout, internal error. Retryable with backoff.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Malformed input, rejected before enqueue. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(String),

    /// Bad or unloadable configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl TaskPingError {
    /// Whether the guard may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskPingError::RateLimited { .. } | TaskPingError::Transient(_)
        )
    }

    /// Rate-limit wait hint, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TaskPingError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Whether this error should terminate just the one record (not the
    /// workspace, not the queue).
    pub fn is_record_fatal(&self) -> bool {
        matches!(
            self,
            TaskPingError::ChannelNotFound(_)
                | TaskPingError::RecipientNotFound(_)
                | TaskPingError::Validation(_)
        )
    }
}
