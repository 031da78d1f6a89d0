//! Storage backends.
//!
//! Every backend offers the same atomicity contract: counter increments and
//! structured-record read-modify-write cycles are atomic with respect to
//! concurrent callers on the same key, whether those callers are threads,
//! processes or hosts. The algorithms are written once against [`Backend`].

pub mod database;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{QuotaError, Result};

pub use self::database::DatabaseBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::{RedisBackend, RedisSettings};

/// Upper bound on compare-and-swap attempts before giving up.
pub const MAX_CAS_RETRIES: usize = 16;

/// Default bound on every blocking backend call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Computes the next record from the current one. Called again on conflict.
pub type ApplyFn<'a> = dyn FnMut(Option<&str>) -> Result<String> + 'a;

pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Atomically create-or-increment an integer counter and return the new value.
    /// The TTL is set only when the counter is created.
    fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Current counter value without touching it.
    fn read_counter(&self, key: &str) -> Result<Option<u64>>;

    fn read_structured(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write.
    fn write_structured(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Writes `new` only if the stored record still equals `expected`
    /// (`None` meaning absent or expired). Returns whether the write happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomic read-modify-write of a structured record.
    ///
    /// The default is an optimistic loop over [`Backend::compare_and_swap`],
    /// bounded by [`MAX_CAS_RETRIES`]. `apply` may run more than once; only
    /// the run whose write lands counts.
    fn read_modify_write(&self, key: &str, ttl: Duration, apply: &mut ApplyFn<'_>) -> Result<()> {
        for attempt in 0..MAX_CAS_RETRIES {
            let current = self.read_structured(key)?;
            let next = apply(current.as_deref())?;
            if self.compare_and_swap(key, current.as_deref(), &next, ttl)? {
                return Ok(());
            }
            warn!(key = key, attempt = attempt, "compare-and-swap conflict, retrying");
        }
        Err(QuotaError::backend(format!(
            "gave up on {} after {} conflicting updates (contention)",
            key, MAX_CAS_RETRIES
        )))
    }

    fn delete(&self, key: &str) -> Result<bool>;

    /// Remove expired records. Returns how many were removed; zero for stores
    /// that evict on their own.
    fn purge_expired(&self) -> Result<u64>;

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.kind())
    }
}

/// The closed set of storage implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Memory,
    Database,
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Database => "database",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "database" => Ok(BackendKind::Database),
            "redis" => Ok(BackendKind::Redis),
            other => Err(QuotaError::config(format!(
                "unknown backend '{}', expected one of: memory, database, redis",
                other
            ))),
        }
    }
}

/// How to construct a backend.
pub enum BackendConfig {
    Memory,
    Database { path: String, timeout: Duration },
    DatabaseConnection(rusqlite::Connection),
    Redis(RedisSettings),
    RedisClient { client: ::redis::Client, timeout: Duration },
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::Memory => f.write_str("Memory"),
            BackendConfig::Database { path, timeout } => f
                .debug_struct("Database")
                .field("path", path)
                .field("timeout", timeout)
                .finish(),
            BackendConfig::DatabaseConnection(_) => f.write_str("DatabaseConnection(..)"),
            BackendConfig::Redis(settings) => f
                .debug_struct("Redis")
                .field("url", &settings.url)
                .field("host", &settings.host)
                .field("port", &settings.port)
                .field("db", &settings.db)
                .field("password", &settings.password.as_ref().map(|_| "***"))
                .field("timeout", &settings.timeout)
                .finish(),
            BackendConfig::RedisClient { timeout, .. } => f
                .debug_struct("RedisClient")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Memory => BackendKind::Memory,
            BackendConfig::Database { .. } | BackendConfig::DatabaseConnection(_) => {
                BackendKind::Database
            }
            BackendConfig::Redis(_) | BackendConfig::RedisClient { .. } => BackendKind::Redis,
        }
    }

    pub fn build(self, clock: Arc<dyn Clock>) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match self {
            BackendConfig::Memory => Arc::new(MemoryBackend::with_clock(clock)),
            BackendConfig::Database { path, timeout } => {
                Arc::new(DatabaseBackend::open(&path, timeout, clock)?)
            }
            BackendConfig::DatabaseConnection(conn) => {
                Arc::new(DatabaseBackend::from_connection(conn, DEFAULT_TIMEOUT, clock)?)
            }
            BackendConfig::Redis(settings) => Arc::new(RedisBackend::new(&settings)?),
            BackendConfig::RedisClient { client, timeout } => {
                Arc::new(RedisBackend::from_client(client, timeout))
            }
        };
        info!(backend = %backend.kind(), "Storage backend initialized");
        Ok(backend)
    }
}

/// Named backend instances, resolved once at configuration time.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    default: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the single backend described by `config`, as default.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let backend_config = config.backend_config()?;
        let name = backend_config.kind().as_str().to_string();
        let backend = backend_config.build(clock)?;
        let mut registry = Self::new();
        registry.register(name.clone(), backend);
        registry.set_default(&name)?;
        Ok(registry)
    }

    /// Registers a backend. The first one registered becomes the default.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        let name = name.into();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.register(name, backend);
        self
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(QuotaError::config(format!("backend '{}' is not registered", name)));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| QuotaError::config(format!("backend '{}' is not registered", name)))
    }

    pub fn default_backend(&self) -> Result<Arc<dyn Backend>> {
        match &self.default {
            Some(name) => self.get(name),
            None => Err(QuotaError::config("no backend registered")),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
