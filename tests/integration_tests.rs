use std::sync::Arc;
use std::time::Duration;

use quotaguard::{
    Algorithm, Backend, BackendRegistry, Config, DatabaseBackend, ManualClock, MemoryBackend,
    QuotaError, RateLimitRequest, RateLimiter, SlidingWindowMode,
};
use tempfile::TempDir;

const T0: f64 = 1_700_000_040.0;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn memory_limiter() -> (Arc<ManualClock>, RateLimiter) {
    let clock = Arc::new(ManualClock::new(T0));
    let memory = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let registry = BackendRegistry::new().with("memory", memory);
    (clock.clone(), RateLimiter::with_clock(registry, clock))
}

/// Both backends registered against one manual clock; memory is the default.
fn dual_limiter() -> (TempDir, Arc<ManualClock>, RateLimiter) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let memory = Arc::new(MemoryBackend::with_clock(clock.clone()));
    let path = dir.path().join("quota.db");
    let database =
        Arc::new(DatabaseBackend::open(path, Duration::from_secs(5), clock.clone()).unwrap());
    let registry = BackendRegistry::new().with("memory", memory).with("database", database);
    (dir, clock.clone(), RateLimiter::with_clock(registry, clock))
}

#[test]
fn test_fixed_window_admits_exactly_limit() {
    let (_, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-a", "search", 3, Duration::from_secs(60))
        .algorithm(Algorithm::FixedWindow);

    let remaining: Vec<u64> = (0..3)
        .map(|_| limiter.decide(&request).unwrap())
        .inspect(|d| assert!(d.allowed))
        .map(|d| d.remaining_whole())
        .collect();
    assert_eq!(remaining, vec![2, 1, 0]);

    let denied = limiter.decide(&request).unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0.0);
    assert_eq!(denied.limit, 3);
    assert_eq!(denied.reset_time, Some(T0 + 60.0));
    assert_eq!(denied.retry_after, Some(60.0));
}

#[test]
fn test_fixed_window_opens_new_window() {
    let (clock, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-a", "search", 2, Duration::from_secs(60))
        .algorithm(Algorithm::FixedWindow);
    limiter.decide(&request).unwrap();
    limiter.decide(&request).unwrap();
    assert!(!limiter.decide(&request).unwrap().allowed);

    clock.advance_secs(60.0);
    let decision = limiter.decide(&request).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining_whole(), 1);
}

#[test]
fn test_sliding_window_recovers_after_window() {
    let (clock, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-b", "upload", 3, Duration::from_secs(10))
        .algorithm(Algorithm::SlidingWindow);

    for _ in 0..3 {
        assert!(limiter.decide(&request).unwrap().allowed);
    }
    let denied = limiter.decide(&request).unwrap();
    assert!(!denied.allowed);
    assert!(approx(denied.retry_after.unwrap(), 10.0));

    clock.advance_secs(10.0);
    assert!(limiter.decide(&request).unwrap().allowed);
}

#[test]
fn test_sliding_window_counter_mode_limits() {
    let (_, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-b", "upload", 4, Duration::from_secs(10))
        .sliding_mode(SlidingWindowMode::Counter);
    for _ in 0..4 {
        assert!(limiter.decide(&request).unwrap().allowed);
    }
    assert!(!limiter.decide(&request).unwrap().allowed);
}

#[test]
fn test_token_bucket_burst_then_refill_time() {
    let (clock, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-c", "export", 5, Duration::from_secs(60))
        .algorithm(Algorithm::TokenBucket)
        .burst_capacity(10);

    for _ in 0..10 {
        assert!(limiter.decide(&request).unwrap().allowed);
    }
    let denied = limiter.decide(&request).unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.limit, 5);
    assert!(approx(denied.retry_after.unwrap(), 12.0));

    clock.advance_secs(12.0);
    assert!(limiter.decide(&request).unwrap().allowed);
    assert!(!limiter.decide(&request).unwrap().allowed);
}

#[test]
fn test_enforce_surfaces_denial_as_error() {
    let (_, limiter) = memory_limiter();
    let request = RateLimitRequest::new("client-d", "login", 1, Duration::from_secs(30))
        .algorithm(Algorithm::FixedWindow);
    assert!(limiter.enforce(&request).is_ok());

    let err = limiter.enforce(&request).unwrap_err();
    assert!(err.is_rate_limited());
    if let QuotaError::RateLimitExceeded(exceeded) = err {
        assert_eq!(exceeded.limit(), 1);
        assert!(exceeded.retry_after().unwrap() > 0.0);
    }
}

#[test]
fn test_peek_does_not_consume() {
    let (_dir, _clock, limiter) = dual_limiter();
    for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingWindow, Algorithm::TokenBucket] {
        for backend in ["memory", "database"] {
            let request = RateLimitRequest::new("peeker", "reports", 2, Duration::from_secs(60))
                .algorithm(algorithm)
                .backend(backend);

            let fresh = limiter.peek_status(&request).unwrap();
            assert!(fresh.allowed, "{} on {}", algorithm, backend);
            assert_eq!(fresh.remaining_whole(), 2);

            limiter.decide(&request).unwrap();
            let first = limiter.peek_status(&request).unwrap();
            let second = limiter.peek_status(&request).unwrap();
            assert_eq!(first, second, "{} on {}", algorithm, backend);
            assert_eq!(first.remaining_whole(), 1);

            assert!(limiter.decide(&request).unwrap().allowed);
            assert!(limiter.is_rate_limited(&request).unwrap());
        }
    }
}

#[test]
fn test_backends_are_substitutable() {
    let (_dir, clock, limiter) = dual_limiter();
    // Offsets in seconds from T0 at which a request arrives.
    let arrivals = [0.0, 0.5, 1.0, 1.5, 2.0, 7.0, 11.0, 12.5, 20.0, 20.1, 20.2, 31.0];

    for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingWindow, Algorithm::TokenBucket] {
        let mut outcomes = Vec::new();
        for backend in ["memory", "database"] {
            clock.set(T0);
            let request = RateLimitRequest::new("same-user", "compare", 3, Duration::from_secs(10))
                .algorithm(algorithm)
                .backend(backend);
            let sequence: Vec<(bool, f64)> = arrivals
                .iter()
                .map(|offset| {
                    clock.set(T0 + offset);
                    let d = limiter.decide(&request).unwrap();
                    (d.allowed, d.remaining)
                })
                .collect();
            outcomes.push(sequence);
        }
        assert_eq!(outcomes[0], outcomes[1], "{} diverged between backends", algorithm);
    }
}

#[test]
fn test_scopes_and_identifiers_are_isolated() {
    let (_dir, _clock, limiter) = dual_limiter();
    let base = RateLimitRequest::new("user:1", "a", 1, Duration::from_secs(60))
        .algorithm(Algorithm::FixedWindow)
        .backend("database");
    assert!(limiter.decide(&base).unwrap().allowed);
    assert!(!limiter.decide(&base).unwrap().allowed);

    let other_scope = RateLimitRequest { scope: "b".into(), ..base.clone() };
    assert!(limiter.decide(&other_scope).unwrap().allowed);

    // "user" + "1:a" must not alias "user:1" + "a".
    let tricky = RateLimitRequest {
        identifier: "user".into(),
        scope: "1:a".into(),
        ..base.clone()
    };
    assert!(limiter.decide(&tricky).unwrap().allowed);
}

#[test]
fn test_reset_restores_quota() {
    let (_dir, _clock, limiter) = dual_limiter();
    for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingWindow, Algorithm::TokenBucket] {
        let request = RateLimitRequest::new("resettable", "jobs", 1, Duration::from_secs(60))
            .algorithm(algorithm)
            .backend("database");
        assert!(limiter.decide(&request).unwrap().allowed);
        assert!(!limiter.decide(&request).unwrap().allowed);
        limiter.reset(&request).unwrap();
        assert!(limiter.decide(&request).unwrap().allowed, "{}", algorithm);
    }
}

#[test]
fn test_purge_expired_removes_only_expired_records() {
    let (_dir, clock, limiter) = dual_limiter();
    let short = RateLimitRequest::new("short", "purge", 5, Duration::from_secs(1))
        .algorithm(Algorithm::FixedWindow)
        .backend("database");
    let long = RateLimitRequest::new("long", "purge", 5, Duration::from_secs(3600))
        .algorithm(Algorithm::FixedWindow)
        .backend("database");
    limiter.decide(&short).unwrap();
    limiter.decide(&long).unwrap();

    assert_eq!(limiter.purge_expired("database").unwrap(), 0);
    clock.advance_secs(5.0);
    assert_eq!(limiter.purge_expired("database").unwrap(), 1);
    assert_eq!(limiter.peek_status(&long).unwrap().remaining_whole(), 4);
}

#[test]
fn test_unreachable_backend_is_backend_error() {
    let (_, limiter) = memory_limiter();
    let config = Config {
        backend: "redis".to_string(),
        redis_port: 1,
        backend_timeout_ms: 200,
        ..Config::default()
    };
    let redis = quotaguard::BackendRegistry::from_config(&config, limiter.clock().clone()).unwrap();
    let request = RateLimitRequest::new("client", "api", 5, Duration::from_secs(60))
        .backend_instance(redis.default_backend().unwrap());
    let err = limiter.decide(&request).unwrap_err();
    assert!(err.is_backend(), "unexpected error: {}", err);
}

#[test]
fn test_from_config_builds_database_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backend: "database".to_string(),
        database_path: dir.path().join("cfg.db").to_string_lossy().into_owned(),
        ..Config::default()
    };
    let limiter = RateLimiter::from_config(&config).unwrap();
    assert_eq!(limiter.registry().names(), vec!["database".to_string()]);
    assert_eq!(limiter.health(), vec![("database".to_string(), true)]);

    let request = RateLimitRequest::new("cfg", "api", 2, Duration::from_secs(60));
    assert!(limiter.decide(&request).unwrap().allowed);
    let backend: Arc<dyn Backend> = limiter.registry().default_backend().unwrap();
    assert_eq!(backend.kind().as_str(), "database");
}
