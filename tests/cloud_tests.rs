use std::time::Duration;

use warden_backend::cloud::{
    BreakerState, CircuitBreaker, CloudClient, FailureKind, TokenTracker, classify_failure,
};
use warden_backend::error::CoreError;

// ═══════════════════════════════════════════════════════════════════════════
//  Circuit breaker
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn three_consecutive_failures_trip_the_breaker() {
    let breaker = CircuitBreaker::new();
    breaker.record_failure(FailureKind::Other);
    breaker.record_failure(FailureKind::Other);
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.allow_request());

    breaker.record_failure(FailureKind::Other);
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request());
}

#[test]
fn rate_limit_and_safety_trip_immediately() {
    for kind in [FailureKind::RateLimit, FailureKind::Safety] {
        let breaker = CircuitBreaker::new();
        breaker.record_failure(kind);
        assert_eq!(breaker.state(), BreakerState::Open, "{kind:?} should trip on first failure");
    }
}

#[test]
fn success_resets_the_failure_streak() {
    let breaker = CircuitBreaker::new();
    breaker.record_failure(FailureKind::Other);
    breaker.record_failure(FailureKind::Other);
    breaker.record_success();
    breaker.record_failure(FailureKind::Other);
    breaker.record_failure(FailureKind::Other);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn cooldown_admits_exactly_one_trial() {
    let breaker = CircuitBreaker::with_cooldown(Duration::ZERO);
    breaker.record_failure(FailureKind::RateLimit);
    assert_eq!(breaker.state(), BreakerState::Open);

    // Cooldown (zero) elapsed: first caller owns the trial, the next is
    // rejected until the trial resolves.
    assert!(breaker.allow_request());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert!(!breaker.allow_request());

    // Failed trial re-opens with the counter restarted.
    breaker.record_failure(FailureKind::Other);
    assert_eq!(breaker.state(), BreakerState::Open);

    // Next trial succeeds and closes the circuit.
    assert!(breaker.allow_request());
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.allow_request());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error classification
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn classification_is_substring_based() {
    assert_eq!(classify_failure("HTTP 429 Too Many Requests"), FailureKind::RateLimit);
    assert_eq!(classify_failure("RESOURCE_EXHAUSTED by upstream"), FailureKind::RateLimit);
    assert_eq!(classify_failure("daily Quota exceeded"), FailureKind::RateLimit);
    assert_eq!(classify_failure("candidate blocked by SAFETY settings"), FailureKind::Safety);
    assert_eq!(classify_failure("BLOCKED: PROHIBITED_CONTENT"), FailureKind::Safety);
    assert_eq!(classify_failure("connection reset by peer"), FailureKind::Other);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Daily token budget
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn budget_is_enforced_and_accumulates() {
    let tracker = TokenTracker::new(1000);
    assert!(tracker.check_budget().is_ok());
    tracker.add(400);
    tracker.add(500);
    assert_eq!(tracker.used(), 900);
    assert_eq!(tracker.remaining(), 100);
    assert!(tracker.check_budget().is_ok());

    tracker.add(200);
    assert!(matches!(
        tracker.check_budget(),
        Err(CoreError::DailyBudgetExceeded { used: 1100, budget: 1000 })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Client behaviour without a reachable endpoint
// ═══════════════════════════════════════════════════════════════════════════

fn dead_endpoint_client(budget: u64) -> CloudClient {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    CloudClient::new(
        http,
        "http://127.0.0.1:9",
        "test-key",
        "primary-model",
        "fallback-model",
        256,
        budget,
    )
}

#[tokio::test]
async fn spent_budget_fails_before_any_network_call() {
    let client = dead_endpoint_client(100);
    client.tokens.add(100);
    let result = client.generate("hello", None).await;
    assert!(matches!(result, Err(CoreError::DailyBudgetExceeded { .. })));
    // The breaker never saw a failure — nothing went out.
    assert_eq!(client.breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn repeated_endpoint_failures_open_the_breaker() {
    let client = dead_endpoint_client(1_000_000);
    for _ in 0..3 {
        let result = client.generate("hello", None).await;
        assert!(matches!(result, Err(CoreError::CloudCall(_))));
    }
    assert_eq!(client.breaker.state(), BreakerState::Open);

    // Fourth call is rejected without touching the endpoint.
    let result = client.generate("hello", None).await;
    assert!(matches!(result, Err(CoreError::CloudBreakerOpen)));
}
