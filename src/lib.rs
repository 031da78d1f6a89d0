//! Rate-limit decisions over pluggable storage.
//!
//! Three algorithms (fixed window, sliding window, token bucket) run over
//! three interchangeable backends (in-process memory, SQLite, Redis). The
//! [`RateLimiter`] facade answers "may this identifier proceed?" with a
//! [`Decision`] carrying remaining quota and retry hints.

pub mod algorithms;
pub mod backend;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod decision;
pub mod error;
pub mod key_generator;
pub mod maintenance;
pub mod rate_limiter;
pub mod validation;

pub use algorithms::{Algorithm, SlidingWindowMode};
pub use backend::{
    Backend, BackendConfig, BackendKind, BackendRegistry, DatabaseBackend, MemoryBackend,
    RedisBackend, RedisSettings,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decision::{Decision, RateLimitExceeded};
pub use error::{QuotaError, Result};
pub use maintenance::purge_expired;
pub use rate_limiter::{BackendSelector, RateLimitRequest, RateLimiter, Rule};
