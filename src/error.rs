//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    /// Malformed input. The caller must fix it and retry.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The store is unreachable, corrupt, or has an incompatible schema.
    #[error("storage error: {0}")]
    Storage(String),

    /// Key generation, binding or key material persistence failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Relay destination does not resolve to a registered peer. Retryable.
    #[error("peer unknown: {0}")]
    PeerUnknown(String),

    /// Transport refused or failed to hand off a payload. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation is gated off in the current configuration.
    #[error("denied: {0}")]
    Denied(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure already reported in detail elsewhere; carries only a summary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a relay scheduler may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::PeerUnknown(_) | AppError::Transport(_))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}
