use thiserror::Error;

use crate::message::MessageId;

/// Failures reported by a storage gateway backend.
///
/// `DuplicateKey`, `NotOwned` and `NotFound` are expected outcomes of
/// concurrent access; the rest are infrastructure failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("message {0} is not owned by the caller")]
    NotOwned(MessageId),

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// True for lease conflicts and duplicate slots, which callers handle
    /// by aborting the local operation rather than retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            GatewayError::DuplicateKey(_) | GatewayError::NotOwned(_) | GatewayError::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

/// Top-level error type for the QueueForge runtime.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("message {0} is not owned by this worker")]
    NotOwned(MessageId),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
pub type Result<T> = std::result::Result<T, QueueError>;
