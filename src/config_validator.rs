use crate::config::Config;
use crate::error::{QuotaError, Result};
use crate::backend::BackendKind;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(QuotaError::config("Redis URL cannot be empty"));
        }

        let scheme_ok = ["redis://", "rediss://", "unix://"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !scheme_ok {
            return Err(QuotaError::config(
                "Redis URL must start with 'redis://', 'rediss://' or 'unix://'",
            ));
        }

        Ok(())
    }

    pub fn validate_redis_endpoint(host: &str, port: u16) -> Result<()> {
        if host.is_empty() {
            return Err(QuotaError::config("Redis host cannot be empty"));
        }

        if port == 0 {
            return Err(QuotaError::config("Redis port must be greater than 0"));
        }

        Ok(())
    }

    pub fn validate_database_path(path: &str) -> Result<()> {
        if path.trim().is_empty() {
            return Err(QuotaError::config("Database path cannot be empty"));
        }

        Ok(())
    }

    pub fn validate_timeout(timeout_ms: u64) -> Result<()> {
        if timeout_ms == 0 {
            return Err(QuotaError::config("Backend timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Validates the settings relevant to the selected backend
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_timeout(config.backend_timeout_ms)?;
        config.default_algorithm()?;

        match config.backend_kind()? {
            BackendKind::Memory => Ok(()),
            BackendKind::Database => Self::validate_database_path(&config.database_path),
            BackendKind::Redis => match config.redis_url.as_deref().filter(|url| !url.is_empty()) {
                Some(url) => Self::validate_redis_url(url),
                None => Self::validate_redis_endpoint(&config.redis_host, config.redis_port),
            },
        }
    }
}
