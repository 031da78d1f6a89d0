use thiserror::Error;

use crate::decision::RateLimitExceeded;

/// Error taxonomy surfaced by every public operation.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Bad algorithm/backend name, non-positive limit or window, malformed settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connectivity, timeout or serialization failure in the storage layer.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Raised by `enforce` when the request is denied.
    #[error("{0}")]
    RateLimitExceeded(RateLimitExceeded),
}

impl QuotaError {
    pub fn config(msg: impl Into<String>) -> Self {
        QuotaError::Configuration(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        QuotaError::Backend(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, QuotaError::Configuration(_))
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, QuotaError::Backend(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, QuotaError::RateLimitExceeded(_))
    }
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::Backend(format!("redis: {}", err))
    }
}

impl From<rusqlite::Error> for QuotaError {
    fn from(err: rusqlite::Error) -> Self {
        QuotaError::Backend(format!("database: {}", err))
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::Backend(format!("corrupt record: {}", err))
    }
}

impl From<RateLimitExceeded> for QuotaError {
    fn from(err: RateLimitExceeded) -> Self {
        QuotaError::RateLimitExceeded(err)
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
