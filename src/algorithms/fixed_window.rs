//! Fixed window counting.
//!
//! One integer counter per `(scope, identifier, window start)`. A request at
//! exactly a window boundary starts a fresh counter, so up to `2 * limit`
//! requests can pass across a boundary.

use std::time::Duration;
use tracing::trace;

use super::{Algorithm, LimitParams, RateLimitAlgorithm, MAX_RECORD_TTL};
use crate::backend::Backend;
use crate::decision::Decision;
use crate::error::Result;
use crate::key_generator::RateKey;

pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(params: LimitParams) -> Self {
        Self {
            limit: params.limit,
            window: params.window,
        }
    }

    fn window_index(&self, now: f64) -> i64 {
        (now / self.window.as_secs_f64()).floor() as i64
    }

    /// Start of the window containing `now`, in epoch seconds.
    pub fn window_start(&self, now: f64) -> f64 {
        self.window_index(now) as f64 * self.window.as_secs_f64()
    }

    fn counter_key(&self, key: &RateKey, now: f64) -> RateKey {
        key.requalify(format!(
            "{}.{}.{}",
            Algorithm::FixedWindow,
            self.window.as_millis(),
            self.window_index(now)
        ))
    }

    fn decision(&self, count: u64, admitted: bool, now: f64) -> Decision {
        let reset_time = self.window_start(now) + self.window.as_secs_f64();
        if admitted {
            Decision::allowed(self.limit, self.limit.saturating_sub(count) as f64, reset_time)
        } else {
            Decision::denied(self.limit, 0.0, reset_time - now, reset_time)
        }
    }
}

impl RateLimitAlgorithm for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn check(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let counter_key = self.counter_key(key, now).render();
        let ttl = self.window.min(MAX_RECORD_TTL);
        let count = backend.increment_and_get(&counter_key, ttl)?;
        trace!(key = %counter_key, count = count, limit = self.limit, "Fixed window increment");
        Ok(self.decision(count, count <= self.limit, now))
    }

    fn peek(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let count = backend
            .read_counter(&self.counter_key(key, now).render())?
            .unwrap_or(0);
        Ok(self.decision(count, count < self.limit, now))
    }

    fn reset(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<()> {
        backend.delete(&self.counter_key(key, now).render())?;
        Ok(())
    }
}
