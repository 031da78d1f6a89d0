//! Rate limiting algorithms module
//!
//! Each algorithm is a pure decision function over a [`Backend`]: it never
//! holds state of its own and relies on the backend for atomicity.

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::Backend;
use crate::decision::Decision;
use crate::error::{QuotaError, Result};
use crate::key_generator::RateKey;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowMode};
pub use token_bucket::TokenBucketLimiter;

/// The closed set of counting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::FixedWindow => "fixed_window",
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::SlidingWindow
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "fixed_window" => Ok(Algorithm::FixedWindow),
            other => Err(QuotaError::config(format!(
                "unknown algorithm '{}', expected one of: \
                 sliding_window, token_bucket, fixed_window",
                other
            ))),
        }
    }
}

/// Validated parameters shared by every algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitParams {
    pub limit: u64,
    pub window: Duration,
    /// Token bucket only; defaults to `limit`.
    pub burst_capacity: Option<u64>,
    /// Sliding window only.
    pub sliding_mode: SlidingWindowMode,
}

impl LimitParams {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            burst_capacity: None,
            sliding_mode: SlidingWindowMode::default(),
        }
    }

    pub fn window_secs(&self) -> f64 {
        self.window.as_secs_f64()
    }
}

/// Trait for rate limiting algorithms
pub trait RateLimitAlgorithm: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Decide and record the request. Exactly one atomic backend mutation.
    fn check(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision>;

    /// Report what `check` would see, without mutating anything.
    fn peek(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision>;

    /// Forget all state for the key.
    fn reset(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<()>;
}

/// Builds the limiter for `algorithm`.
pub fn build(algorithm: Algorithm, params: LimitParams) -> Box<dyn RateLimitAlgorithm> {
    match algorithm {
        Algorithm::SlidingWindow => Box::new(SlidingWindowLimiter::new(params)),
        Algorithm::TokenBucket => Box::new(TokenBucketLimiter::new(params)),
        Algorithm::FixedWindow => Box::new(FixedWindowLimiter::new(params)),
    }
}

/// Longest lifetime any stored record is given. Longer windows still decide
/// correctly; their records just expire earlier and start over.
pub const MAX_RECORD_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Record TTL for a span in seconds, saturating instead of overflowing.
pub(crate) fn record_ttl(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::MAX)
        .min(MAX_RECORD_TTL)
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(record: Option<&'a str>) -> Result<Option<T>> {
    match record {
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
        None => Ok(None),
    }
}

pub(crate) fn no_decision(key: &RateKey) -> QuotaError {
    QuotaError::backend(format!("update of {} completed without a decision", key))
}
