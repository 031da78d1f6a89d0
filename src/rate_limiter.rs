//! Limiter facade.
//!
//! Resolves `(algorithm, backend, identifier, scope, limit, window, params)`
//! into a concrete algorithm over a concrete backend and returns a uniform
//! [`Decision`]. Backend failures are propagated unchanged: the facade never
//! substitutes a default allow or deny.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use validator::Validate;

use crate::algorithms::{self, Algorithm, LimitParams, RateLimitAlgorithm, SlidingWindowMode};
use crate::backend::{Backend, BackendRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::decision::{Decision, RateLimitExceeded};
use crate::error::Result;
use crate::key_generator::{RateKey, DEFAULT_KEY_PREFIX};
use crate::maintenance;
use crate::validation::{ensure_valid, validate_window};

/// Which backend a request runs against.
#[derive(Debug, Clone, Default)]
pub enum BackendSelector {
    /// The registry's default backend.
    #[default]
    Default,
    /// A backend registered under this name.
    Named(String),
    /// A pre-constructed instance, bypassing the registry.
    Instance(Arc<dyn Backend>),
}

/// One admission question.
#[derive(Debug, Clone, Validate)]
pub struct RateLimitRequest {
    #[validate(length(min = 1, message = "identifier must not be empty"))]
    pub identifier: String,
    pub scope: String,
    #[validate(range(min = 1, message = "limit must be greater than 0"))]
    pub limit: u64,
    #[validate(custom(function = "validate_window"))]
    pub window: Duration,
    /// `None` uses the limiter's default algorithm.
    pub algorithm: Option<Algorithm>,
    pub backend: BackendSelector,
    #[validate(range(min = 1, message = "burst_capacity must be greater than 0"))]
    pub burst_capacity: Option<u64>,
    pub sliding_mode: SlidingWindowMode,
}

impl RateLimitRequest {
    pub fn new(
        identifier: impl Into<String>,
        scope: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            scope: scope.into(),
            limit,
            window,
            algorithm: None,
            backend: BackendSelector::Default,
            burst_capacity: None,
            sliding_mode: SlidingWindowMode::default(),
        }
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Selects the algorithm by name; unknown names are a configuration error.
    pub fn algorithm_name(self, name: &str) -> Result<Self> {
        Ok(self.algorithm(name.parse()?))
    }

    pub fn backend(mut self, name: impl Into<String>) -> Self {
        self.backend = BackendSelector::Named(name.into());
        self
    }

    pub fn backend_instance(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = BackendSelector::Instance(backend);
        self
    }

    pub fn burst_capacity(mut self, capacity: u64) -> Self {
        self.burst_capacity = Some(capacity);
        self
    }

    pub fn sliding_mode(mut self, mode: SlidingWindowMode) -> Self {
        self.sliding_mode = mode;
        self
    }

    fn params(&self) -> LimitParams {
        LimitParams {
            limit: self.limit,
            window: self.window,
            burst_capacity: self.burst_capacity,
            sliding_mode: self.sliding_mode,
        }
    }
}

/// An algorithm bound to a backend with its parameters validated.
///
/// Resolve once, then call per identifier.
pub struct Rule {
    scope: String,
    algorithm: Box<dyn RateLimitAlgorithm>,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl Rule {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm.algorithm()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn key(&self, identifier: &str) -> RateKey {
        RateKey::with_prefix(&self.key_prefix, &self.scope, identifier, self.algorithm().as_str())
    }

    pub fn decide(&self, identifier: &str) -> Result<Decision> {
        let key = self.key(identifier);
        let now = self.clock.now();
        match self.algorithm.check(self.backend.as_ref(), &key, now) {
            Ok(decision) => {
                debug!(
                    key = %key,
                    algorithm = %self.algorithm(),
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate limit decision"
                );
                Ok(decision)
            }
            Err(err) => {
                error!(
                    key = %key,
                    backend = %self.backend.kind(),
                    error = %err,
                    "Rate limit check failed"
                );
                Err(err)
            }
        }
    }

    pub fn enforce(&self, identifier: &str) -> Result<Decision> {
        let decision = self.decide(identifier)?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitExceeded::new(decision).into())
        }
    }

    pub fn peek_status(&self, identifier: &str) -> Result<Decision> {
        self.algorithm
            .peek(self.backend.as_ref(), &self.key(identifier), self.clock.now())
    }

    pub fn reset(&self, identifier: &str) -> Result<()> {
        let key = self.key(identifier);
        self.algorithm.reset(self.backend.as_ref(), &key, self.clock.now())?;
        info!(key = %key, "Rate limit reset");
        Ok(())
    }
}

/// Entry point for callers: holds the backend registry and the clock.
#[derive(Clone)]
pub struct RateLimiter {
    registry: BackendRegistry,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    default_algorithm: Algorithm,
}

impl RateLimiter {
    pub fn new(registry: BackendRegistry) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: BackendRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_algorithm: Algorithm::default(),
        }
    }

    /// Builds the configured backend and a limiter over it.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = BackendRegistry::from_config(config, clock.clone())?;
        Ok(Self::with_clock(registry, clock)
            .key_prefix(&config.key_prefix)
            .default_algorithm(config.default_algorithm()?))
    }

    /// Algorithm for requests that do not name one.
    pub fn default_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn resolve_backend(&self, selector: &BackendSelector) -> Result<Arc<dyn Backend>> {
        match selector {
            BackendSelector::Default => self.registry.default_backend(),
            BackendSelector::Named(name) => self.registry.get(name),
            BackendSelector::Instance(backend) => Ok(backend.clone()),
        }
    }

    /// Validates the request and binds its algorithm to its backend.
    pub fn rule(&self, request: &RateLimitRequest) -> Result<Rule> {
        ensure_valid(request)?;
        let algorithm = request.algorithm.unwrap_or(self.default_algorithm);
        if request.burst_capacity.is_some() && algorithm != Algorithm::TokenBucket {
            debug!(algorithm = %algorithm, "burst_capacity ignored outside token_bucket");
        }
        Ok(Rule {
            scope: request.scope.clone(),
            algorithm: algorithms::build(algorithm, request.params()),
            backend: self.resolve_backend(&request.backend)?,
            clock: self.clock.clone(),
            key_prefix: self.key_prefix.clone(),
        })
    }

    /// Decide and record the request.
    pub fn decide(&self, request: &RateLimitRequest) -> Result<Decision> {
        self.rule(request)?.decide(&request.identifier)
    }

    /// Like [`RateLimiter::decide`], but a denial is returned as
    /// [`QuotaError::RateLimitExceeded`](crate::error::QuotaError::RateLimitExceeded).
    pub fn enforce(&self, request: &RateLimitRequest) -> Result<Decision> {
        self.rule(request)?.enforce(&request.identifier)
    }

    /// Current status without consuming quota.
    pub fn peek_status(&self, request: &RateLimitRequest) -> Result<Decision> {
        self.rule(request)?.peek_status(&request.identifier)
    }

    /// Whether the next request would be denied. Read-only.
    pub fn is_rate_limited(&self, request: &RateLimitRequest) -> Result<bool> {
        Ok(!self.peek_status(request)?.allowed)
    }

    pub fn reset(&self, request: &RateLimitRequest) -> Result<()> {
        self.rule(request)?.reset(&request.identifier)
    }

    /// Purges expired records from the named backend.
    pub fn purge_expired(&self, backend: &str) -> Result<u64> {
        maintenance::purge_expired(self.registry.get(backend)?.as_ref())
    }

    /// Pings every registered backend.
    pub fn health(&self) -> Vec<(String, bool)> {
        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let healthy = self
                    .registry
                    .get(&name)
                    .and_then(|backend| backend.ping())
                    .is_ok();
                (name, healthy)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::error::QuotaError;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(1_700_000_040.0));
        let memory = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let registry = BackendRegistry::new().with("memory", memory);
        (clock.clone(), RateLimiter::with_clock(registry, clock))
    }

    #[test]
    fn test_enforce_raises_with_metadata() {
        let (_, limiter) = limiter();
        let request = RateLimitRequest::new("user", "api", 1, Duration::from_secs(60))
            .algorithm(Algorithm::FixedWindow);
        assert!(limiter.enforce(&request).is_ok());
        match limiter.enforce(&request) {
            Err(QuotaError::RateLimitExceeded(exceeded)) => {
                assert_eq!(exceeded.limit(), 1);
                assert_eq!(exceeded.reset_time(), Some(1_700_000_100.0));
                assert_eq!(exceeded.retry_after(), Some(60.0));
            }
            other => panic!("expected RateLimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_parameters_are_configuration_errors() {
        let (_, limiter) = limiter();
        let zero_limit = RateLimitRequest::new("user", "api", 0, Duration::from_secs(60));
        assert!(limiter.decide(&zero_limit).unwrap_err().is_configuration());
        let zero_window = RateLimitRequest::new("user", "api", 5, Duration::ZERO);
        assert!(limiter.decide(&zero_window).unwrap_err().is_configuration());
        let zero_burst = RateLimitRequest::new("user", "api", 5, Duration::from_secs(1))
            .algorithm(Algorithm::TokenBucket)
            .burst_capacity(0);
        assert!(limiter.decide(&zero_burst).unwrap_err().is_configuration());
    }

    #[test]
    fn test_unknown_names_are_configuration_errors() {
        let (_, limiter) = limiter();
        assert!(RateLimitRequest::new("u", "s", 1, Duration::from_secs(1))
            .algorithm_name("gcra")
            .unwrap_err()
            .is_configuration());
        let request = RateLimitRequest::new("u", "s", 1, Duration::from_secs(1)).backend("redis");
        assert!(limiter.decide(&request).unwrap_err().is_configuration());
    }

    #[test]
    fn test_scopes_are_independent() {
        let (_, limiter) = limiter();
        let login = RateLimitRequest::new("10.0.0.1", "login", 1, Duration::from_secs(60));
        let search = RateLimitRequest::new("10.0.0.1", "search", 1, Duration::from_secs(60));
        assert!(limiter.decide(&login).unwrap().allowed);
        assert!(!limiter.decide(&login).unwrap().allowed);
        assert!(limiter.decide(&search).unwrap().allowed);
    }

    #[test]
    fn test_is_rate_limited_and_reset() {
        let (_, limiter) = limiter();
        let request = RateLimitRequest::new("user", "api", 2, Duration::from_secs(60))
            .algorithm(Algorithm::TokenBucket);
        limiter.decide(&request).unwrap();
        assert!(!limiter.is_rate_limited(&request).unwrap());
        limiter.decide(&request).unwrap();
        assert!(limiter.is_rate_limited(&request).unwrap());
        limiter.reset(&request).unwrap();
        assert!(!limiter.is_rate_limited(&request).unwrap());
    }

    #[test]
    fn test_instance_selector_bypasses_registry() {
        let (clock, limiter) = limiter();
        let private: Arc<dyn Backend> = Arc::new(MemoryBackend::with_clock(clock));
        let request = RateLimitRequest::new("user", "api", 1, Duration::from_secs(60))
            .backend_instance(private.clone());
        assert!(limiter.decide(&request).unwrap().allowed);
        // The shared default backend is untouched.
        let shared = RateLimitRequest::new("user", "api", 1, Duration::from_secs(60));
        assert!(limiter.decide(&shared).unwrap().allowed);
    }

    #[test]
    fn test_rule_is_reusable_across_identifiers() {
        let (_, limiter) = limiter();
        let rule = limiter
            .rule(&RateLimitRequest::new("template", "api", 1, Duration::from_secs(30)))
            .unwrap();
        assert_eq!(rule.algorithm(), Algorithm::SlidingWindow);
        assert!(rule.decide("alice").unwrap().allowed);
        assert!(rule.decide("bob").unwrap().allowed);
        assert!(rule.enforce("alice").unwrap_err().is_rate_limited());
    }

    #[test]
    fn test_unset_algorithm_uses_limiter_default() {
        let (_, limiter) = limiter();
        let limiter = limiter.default_algorithm(Algorithm::FixedWindow);
        let implicit = RateLimitRequest::new("user", "api", 1, Duration::from_secs(60));
        assert_eq!(limiter.rule(&implicit).unwrap().algorithm(), Algorithm::FixedWindow);
        let explicit = implicit.clone().algorithm(Algorithm::TokenBucket);
        assert_eq!(limiter.rule(&explicit).unwrap().algorithm(), Algorithm::TokenBucket);
    }

    #[test]
    fn test_from_config_applies_default_algorithm() {
        let config = Config {
            default_algorithm: "token_bucket".to_string(),
            ..Config::default()
        };
        let limiter = RateLimiter::from_config(&config).unwrap();
        let request = RateLimitRequest::new("user", "api", 5, Duration::from_secs(60));
        assert_eq!(limiter.rule(&request).unwrap().algorithm(), Algorithm::TokenBucket);
    }

    #[test]
    fn test_oversized_parameters_decide_without_panicking() {
        let (_, limiter) = limiter();
        let year = Duration::from_secs(365 * 24 * 60 * 60);
        let bucket = RateLimitRequest::new("user", "api", 1, year)
            .algorithm(Algorithm::TokenBucket)
            .burst_capacity(1_000_000_000_000);
        assert!(limiter.decide(&bucket).unwrap().allowed);

        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        let counter = RateLimitRequest::new("user", "api", 3, huge)
            .algorithm(Algorithm::SlidingWindow)
            .sliding_mode(SlidingWindowMode::Counter);
        assert!(limiter.decide(&counter).unwrap().allowed);

        let fixed = counter.clone().algorithm(Algorithm::FixedWindow);
        assert!(limiter.decide(&fixed).unwrap().allowed);
    }

    #[test]
    fn test_health_reports_each_backend() {
        let (_, limiter) = limiter();
        assert_eq!(limiter.health(), vec![("memory".to_string(), true)]);
    }
}
