//! Token bucket.
//!
//! The bucket refills continuously at `limit / window` tokens per second up
//! to `burst_capacity`. Refill is computed from elapsed time on each request,
//! so an idle bucket needs no background work.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use super::{decode, no_decision, record_ttl, Algorithm, LimitParams, RateLimitAlgorithm};
use crate::backend::Backend;
use crate::decision::Decision;
use crate::error::Result;
use crate::key_generator::RateKey;

/// Accumulated floating-point error tolerated when testing for a whole token.
pub const TOKEN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: f64,
}

pub struct TokenBucketLimiter {
    limit: u64,
    capacity: f64,
    refill_rate: f64, // tokens per second
    window: Duration,
}

impl TokenBucketLimiter {
    pub fn new(params: LimitParams) -> Self {
        let capacity = params.burst_capacity.unwrap_or(params.limit);
        Self {
            limit: params.limit,
            capacity: capacity as f64,
            refill_rate: params.limit as f64 / params.window_secs(),
            window: params.window,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn bucket_key(&self, key: &RateKey) -> String {
        key.requalify(Algorithm::TokenBucket.as_str()).render()
    }

    /// An idle bucket is full again after `capacity / rate`; past that its
    /// record carries no information and may expire.
    fn ttl(&self) -> Duration {
        record_ttl(self.capacity / self.refill_rate + self.window.as_secs_f64())
    }

    /// Brings `state` up to `now`. A missing bucket starts full.
    fn refill(&self, state: Option<BucketState>, now: f64) -> BucketState {
        match state {
            None => BucketState {
                tokens: self.capacity,
                last_refill: now,
            },
            Some(state) => {
                let elapsed = (now - state.last_refill).max(0.0);
                let tokens = (state.tokens + elapsed * self.refill_rate).clamp(0.0, self.capacity);
                BucketState {
                    tokens,
                    last_refill: now.max(state.last_refill),
                }
            }
        }
    }

    fn has_token(state: &BucketState) -> bool {
        state.tokens >= 1.0 - TOKEN_EPSILON
    }

    fn decision(&self, state: &BucketState, admitted: bool, now: f64) -> Decision {
        let until_full = (self.capacity - state.tokens).max(0.0) / self.refill_rate;
        if admitted {
            Decision::allowed(self.limit, state.tokens, now + until_full)
        } else {
            let retry_after = (1.0 - state.tokens).max(0.0) / self.refill_rate;
            Decision::denied(self.limit, state.tokens, retry_after, now + until_full)
        }
    }
}

impl RateLimitAlgorithm for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn check(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let bucket_key = self.bucket_key(key);
        let mut outcome = None;
        backend.read_modify_write(&bucket_key, self.ttl(), &mut |current| {
            let mut state = self.refill(decode(current)?, now);
            let admitted = Self::has_token(&state);
            if admitted {
                state.tokens = (state.tokens - 1.0).clamp(0.0, self.capacity);
            }
            outcome = Some(self.decision(&state, admitted, now));
            Ok(serde_json::to_string(&state)?)
        })?;
        trace!(key = %bucket_key, "Token bucket updated");
        outcome.ok_or_else(|| no_decision(key))
    }

    fn peek(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let record = backend.read_structured(&self.bucket_key(key))?;
        let state = self.refill(decode(record.as_deref())?, now);
        Ok(self.decision(&state, Self::has_token(&state), now))
    }

    fn reset(&self, backend: &dyn Backend, key: &RateKey, _now: f64) -> Result<()> {
        backend.delete(&self.bucket_key(key))?;
        Ok(())
    }
}
