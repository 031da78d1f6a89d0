//! Sliding window rate limiting algorithm
//!
//! Two representations are available:
//!
//! * [`SlidingWindowMode::Log`] keeps every admitted timestamp inside the
//!   trailing window. Exact, memory proportional to `limit`. The default.
//! * [`SlidingWindowMode::Counter`] keeps two adjacent fixed-window counts and
//!   weights the previous one by how much of it still overlaps the trailing
//!   window. Constant memory, approximate.
//!
//! Both run as a single read-modify-write cycle on the backend per request.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

use super::{decode, no_decision, Algorithm, LimitParams, RateLimitAlgorithm, MAX_RECORD_TTL};
use crate::backend::Backend;
use crate::decision::Decision;
use crate::error::{QuotaError, Result};
use crate::key_generator::RateKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowMode {
    #[default]
    Log,
    Counter,
}

impl FromStr for SlidingWindowMode {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(SlidingWindowMode::Log),
            "counter" => Ok(SlidingWindowMode::Counter),
            other => Err(QuotaError::config(format!(
                "unknown sliding window mode '{}', expected log or counter",
                other
            ))),
        }
    }
}

/// Two adjacent fixed-window counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WindowPair {
    window_start: f64,
    previous: u64,
    current: u64,
}

impl WindowPair {
    /// Shift the pair so that `current` belongs to the window starting at `start`.
    fn roll(self, start: f64, window: f64) -> Self {
        if same_instant(self.window_start, start) {
            self
        } else if same_instant(self.window_start + window, start) {
            Self {
                window_start: start,
                previous: self.current,
                current: 0,
            }
        } else {
            Self {
                window_start: start,
                previous: 0,
                current: 0,
            }
        }
    }
}

fn same_instant(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

pub struct SlidingWindowLimiter {
    limit: u64,
    window: Duration,
    mode: SlidingWindowMode,
}

impl SlidingWindowLimiter {
    pub fn new(params: LimitParams) -> Self {
        Self {
            limit: params.limit,
            window: params.window,
            mode: params.sliding_mode,
        }
    }

    pub fn mode(&self) -> SlidingWindowMode {
        self.mode
    }

    fn record_key(&self, key: &RateKey) -> String {
        let record_key = match self.mode {
            SlidingWindowMode::Log => key.requalify(Algorithm::SlidingWindow.as_str()),
            SlidingWindowMode::Counter => {
                key.requalify(format!("{}.counter", Algorithm::SlidingWindow))
            }
        };
        record_key.render()
    }

    fn ttl(&self) -> Duration {
        let ttl = match self.mode {
            SlidingWindowMode::Log => self.window,
            // The previous window is still needed while the current one runs.
            SlidingWindowMode::Counter => self.window.checked_mul(2).unwrap_or(Duration::MAX),
        };
        ttl.min(MAX_RECORD_TTL)
    }

    // --- log variant ---

    fn prune(&self, log: &mut Vec<f64>, now: f64) {
        let horizon = now - self.window.as_secs_f64();
        log.retain(|&ts| ts > horizon);
    }

    fn log_decision(&self, log: &[f64], admitted: bool, now: f64) -> Decision {
        let window = self.window.as_secs_f64();
        let remaining = self.limit.saturating_sub(log.len() as u64) as f64;
        let oldest = log.iter().copied().fold(f64::INFINITY, f64::min);
        // Time until the oldest counted request ages out.
        let reset_time = if oldest.is_finite() { oldest + window } else { now };
        if admitted {
            Decision::allowed(self.limit, remaining, reset_time)
        } else {
            Decision::denied(self.limit, remaining, window - (now - oldest), reset_time)
        }
    }

    fn check_log(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let record_key = self.record_key(key);
        let mut outcome = None;
        backend.read_modify_write(&record_key, self.ttl(), &mut |current| {
            let mut log: Vec<f64> = decode(current)?.unwrap_or_default();
            self.prune(&mut log, now);
            let admitted = (log.len() as u64) < self.limit;
            if admitted {
                log.push(now);
            }
            outcome = Some(self.log_decision(&log, admitted, now));
            Ok(serde_json::to_string(&log)?)
        })?;
        trace!(key = %record_key, "Sliding window log updated");
        outcome.ok_or_else(|| no_decision(key))
    }

    fn peek_log(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let record = backend.read_structured(&self.record_key(key))?;
        let mut log: Vec<f64> = decode(record.as_deref())?.unwrap_or_default();
        self.prune(&mut log, now);
        let admissible = (log.len() as u64) < self.limit;
        Ok(self.log_decision(&log, admissible, now))
    }

    // --- counter variant ---

    fn window_start(&self, now: f64) -> f64 {
        let window = self.window.as_secs_f64();
        (now / window).floor() * window
    }

    fn estimate(&self, pair: &WindowPair, now: f64) -> f64 {
        let window = self.window.as_secs_f64();
        let overlap = 1.0 - ((now - pair.window_start) / window).clamp(0.0, 1.0);
        pair.previous as f64 * overlap + pair.current as f64
    }

    /// Seconds until one more request fits under the weighted estimate.
    fn counter_retry_after(&self, pair: &WindowPair, now: f64) -> f64 {
        let window = self.window.as_secs_f64();
        let limit = self.limit as f64;
        let current = pair.current as f64;
        let until_roll = pair.window_start + window - now;
        if current + 1.0 <= limit {
            // Wait for the previous window's weight to decay enough.
            let previous = pair.previous as f64;
            if previous <= 0.0 {
                return 0.0;
            }
            let needed_overlap = (limit - current - 1.0) / previous;
            let at = pair.window_start + window * (1.0 - needed_overlap);
            (at - now).max(0.0)
        } else {
            // The current window becomes the previous one and must decay.
            let needed_overlap = ((limit - 1.0) / current).clamp(0.0, 1.0);
            until_roll.max(0.0) + window * (1.0 - needed_overlap)
        }
    }

    fn counter_decision(&self, pair: &WindowPair, admitted: bool, now: f64) -> Decision {
        let window = self.window.as_secs_f64();
        let estimate = self.estimate(pair, now);
        let remaining = (self.limit as f64 - estimate).floor().max(0.0);
        if admitted {
            Decision::allowed(self.limit, remaining, pair.window_start + window)
        } else {
            let retry_after = self.counter_retry_after(pair, now);
            Decision::denied(self.limit, remaining, retry_after, now + retry_after)
        }
    }

    fn check_counter(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let record_key = self.record_key(key);
        let window = self.window.as_secs_f64();
        let start = self.window_start(now);
        let mut outcome = None;
        backend.read_modify_write(&record_key, self.ttl(), &mut |current| {
            let mut pair = decode::<WindowPair>(current)?
                .unwrap_or(WindowPair {
                    window_start: start,
                    previous: 0,
                    current: 0,
                })
                .roll(start, window);
            let admitted = self.estimate(&pair, now) + 1.0 <= self.limit as f64;
            if admitted {
                pair.current += 1;
            }
            outcome = Some(self.counter_decision(&pair, admitted, now));
            Ok(serde_json::to_string(&pair)?)
        })?;
        trace!(key = %record_key, "Sliding window counters updated");
        outcome.ok_or_else(|| no_decision(key))
    }

    fn peek_counter(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        let start = self.window_start(now);
        let record = backend.read_structured(&self.record_key(key))?;
        let pair = decode::<WindowPair>(record.as_deref())?
            .unwrap_or(WindowPair {
                window_start: start,
                previous: 0,
                current: 0,
            })
            .roll(start, self.window.as_secs_f64());
        let admissible = self.estimate(&pair, now) + 1.0 <= self.limit as f64;
        Ok(self.counter_decision(&pair, admissible, now))
    }
}

impl RateLimitAlgorithm for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn check(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        match self.mode {
            SlidingWindowMode::Log => self.check_log(backend, key, now),
            SlidingWindowMode::Counter => self.check_counter(backend, key, now),
        }
    }

    fn peek(&self, backend: &dyn Backend, key: &RateKey, now: f64) -> Result<Decision> {
        match self.mode {
            SlidingWindowMode::Log => self.peek_log(backend, key, now),
            SlidingWindowMode::Counter => self.peek_counter(backend, key, now),
        }
    }

    fn reset(&self, backend: &dyn Backend, key: &RateKey, _now: f64) -> Result<()> {
        backend.delete(&self.record_key(key))?;
        Ok(())
    }
}
