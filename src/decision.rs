use serde::Serialize;
use std::fmt;

/// Outcome of a single admission check.
///
/// Field names are stable: adapters build response headers from them.
/// Token bucket decisions carry a meaningful `retry_after`; window decisions
/// carry a meaningful `reset_time`. The other field is filled in for uniformity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Quota left after this decision. Fractional for token buckets.
    pub remaining: f64,
    /// Seconds until a retry can succeed.
    pub retry_after: Option<f64>,
    /// Epoch seconds at which the quota is restored.
    pub reset_time: Option<f64>,
    pub limit: u64,
}

impl Decision {
    pub fn allowed(limit: u64, remaining: f64, reset_time: f64) -> Self {
        Self {
            allowed: true,
            remaining: remaining.max(0.0),
            retry_after: None,
            reset_time: Some(reset_time),
            limit,
        }
    }

    pub fn denied(limit: u64, remaining: f64, retry_after: f64, reset_time: f64) -> Self {
        Self {
            allowed: false,
            remaining: remaining.max(0.0),
            retry_after: Some(retry_after.max(0.0)),
            reset_time: Some(reset_time),
            limit,
        }
    }

    /// Remaining quota rounded down for display.
    pub fn remaining_whole(&self) -> u64 {
        self.remaining.floor() as u64
    }

    /// Header values in the conventional `X-RateLimit-*` layout.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining_whole().to_string()),
        ];
        if let Some(reset) = self.reset_time {
            headers.push(("X-RateLimit-Reset", (reset.ceil() as u64).to_string()));
        }
        if !self.allowed {
            if let Some(retry) = self.retry_after {
                headers.push(("Retry-After", (retry.ceil() as u64).max(1).to_string()));
            }
        }
        headers
    }
}

/// Denial signal raised by `enforce`, carrying the full decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitExceeded {
    pub decision: Decision,
}

impl RateLimitExceeded {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }

    pub fn retry_after(&self) -> Option<f64> {
        self.decision.retry_after
    }

    pub fn reset_time(&self) -> Option<f64> {
        self.decision.reset_time
    }

    pub fn limit(&self) -> u64 {
        self.decision.limit
    }
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decision.retry_after {
            Some(retry) => write!(
                f,
                "Rate limit exceeded: limit {}, retry after {:.3}s",
                self.decision.limit, retry
            ),
            None => write!(f, "Rate limit exceeded: limit {}", self.decision.limit),
        }
    }
}
