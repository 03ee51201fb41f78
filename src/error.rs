//! Error types surfaced by the messaging facade
//!
//! Construction-time problems are [`ConfigError`](crate::config::ConfigError),
//! per-call runtime problems are [`TransportError`](crate::transport::TransportError),
//! and caller mistakes are rejected as `InvalidArgument` before any network work.

use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for messenger operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MessagingError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same call unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Transport(error) if !matches!(error, TransportError::PayloadTooLarge { .. })
        )
    }
}

/// Result type for messenger operations
pub type MessagingResult<T> = Result<T, MessagingError>;
