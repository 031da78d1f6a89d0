use envconfig::Envconfig;
use std::time::Duration;

use crate::algorithms::Algorithm;
use crate::backend::{BackendConfig, BackendKind, RedisSettings};
use crate::config_validator::ConfigValidator;
use crate::error::Result;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Storage backend: memory, database or redis
    #[envconfig(from = "QUOTA_BACKEND", default = "memory")]
    pub backend: String,

    /// Algorithm used when a caller does not name one
    #[envconfig(from = "QUOTA_DEFAULT_ALGORITHM", default = "sliding_window")]
    pub default_algorithm: String,

    /// SQLite file for the database backend
    #[envconfig(from = "QUOTA_DATABASE_PATH", default = "quotaguard.db")]
    pub database_path: String,

    /// Redis connection URL; overrides host/port/db/password when set
    #[envconfig(from = "QUOTA_REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "QUOTA_REDIS_HOST", default = "127.0.0.1")]
    pub redis_host: String,

    #[envconfig(from = "QUOTA_REDIS_PORT", default = "6379")]
    pub redis_port: u16,

    #[envconfig(from = "QUOTA_REDIS_DB", default = "0")]
    pub redis_db: i64,

    #[envconfig(from = "QUOTA_REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Prefix for every storage key
    #[envconfig(from = "QUOTA_KEY_PREFIX", default = "quota")]
    pub key_prefix: String,

    /// Bound on every backend call, in milliseconds
    #[envconfig(from = "QUOTA_BACKEND_TIMEOUT_MS", default = "2000")]
    pub backend_timeout_ms: u64,

    /// Period of the CLI purge loop, in seconds
    #[envconfig(from = "QUOTA_PURGE_INTERVAL_SECS", default = "300")]
    pub purge_interval_secs: u64,

    #[envconfig(from = "QUOTA_LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.backend.parse()
    }

    pub fn default_algorithm(&self) -> Result<Algorithm> {
        self.default_algorithm.parse()
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.redis_url.clone().filter(|url| !url.is_empty()),
            host: self.redis_host.clone(),
            port: self.redis_port,
            db: self.redis_db,
            password: self.redis_password.clone().filter(|p| !p.is_empty()),
            timeout: self.backend_timeout(),
        }
    }

    /// Validates the settings and describes the backend to build.
    pub fn backend_config(&self) -> Result<BackendConfig> {
        ConfigValidator::validate(self)?;
        Ok(match self.backend_kind()? {
            BackendKind::Memory => BackendConfig::Memory,
            BackendKind::Database => BackendConfig::Database {
                path: self.database_path.clone(),
                timeout: self.backend_timeout(),
            },
            BackendKind::Redis => BackendConfig::Redis(self.redis_settings()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            default_algorithm: "sliding_window".to_string(),
            database_path: "quotaguard.db".to_string(),
            redis_url: None,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_password: None,
            key_prefix: "quota".to_string(),
            backend_timeout_ms: 2000,
            purge_interval_secs: 300,
            log_level: "info".to_string(),
        }
    }
}
