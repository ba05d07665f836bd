//! Circuit Breaker
//!
//! One breaker per (tenant, trigger), created on first use and kept for the
//! process lifetime. Dispatch asks [`CircuitBreaker::is_call_permitted`].
//! Request/response outcomes are reported by completion and expiry, since
//! success is only known once the target answered; fire-and-forget outcomes
//! are reported by dispatch.
//!
//! State lives in atomics so concurrent dispatch and completion of the same
//! key never take a lock. Outcomes are counted in tumbling windows of
//! `window_size` calls; once `minimum_calls` outcomes are in, a failure rate
//! at or above the threshold opens the breaker.
//!
//! Trial calls whose outcome never arrives would otherwise hold the breaker
//! half-open forever, so half-open lasting longer than `half_open_max_wait`
//! re-opens it and a fresh set of trials follows the next open wait.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ets_config::CircuitBreakerSettings;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub window_size: u32,
    pub minimum_calls: u32,
    /// Percent
    pub failure_rate_threshold: u8,
    pub open_wait: Duration,
    pub half_open_permits: u32,
    pub half_open_max_wait: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            window_size: settings.window_size.max(1),
            minimum_calls: settings.minimum_calls.max(1),
            failure_rate_threshold: settings.failure_rate_threshold,
            open_wait: Duration::from_secs(settings.open_wait_secs),
            half_open_permits: settings.half_open_permits.max(1),
            half_open_max_wait: Duration::from_secs(settings.half_open_max_wait_secs),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_window(mut self, window_size: u32, minimum_calls: u32) -> Self {
        self.window_size = window_size.max(1);
        self.minimum_calls = minimum_calls.max(1);
        self
    }

    pub fn with_failure_rate_threshold(mut self, percent: u8) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    pub fn with_open_wait(mut self, wait: Duration) -> Self {
        self.open_wait = wait;
        self
    }

    pub fn with_half_open_permits(mut self, permits: u32) -> Self {
        self.half_open_permits = permits.max(1);
        self
    }

    pub fn with_half_open_max_wait(mut self, wait: Duration) -> Self {
        self.half_open_max_wait = wait;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    successes: AtomicU32,
    failures: AtomicU32,
    /// Millis since `epoch` at which the breaker last opened
    opened_at: AtomicI64,
    half_open_since: AtomicI64,
    half_open_issued: AtomicU32,
    half_open_successes: AtomicU32,
    last_duration_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            successes: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            opened_at: AtomicI64::new(0),
            half_open_since: AtomicI64::new(0),
            half_open_issued: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            last_duration_ms: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn reset_trials(&self) {
        self.half_open_issued.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
    }

    fn reset_window(&self) {
        self.successes.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
    }

    fn open(&self, from: CircuitState) {
        // opened_at is written before the state flips so readers of OPEN see it
        let previous = self.opened_at.swap(self.now_ms(), Ordering::AcqRel);
        if self.transition(from, CircuitState::Open) {
            self.reset_window();
            warn!(circuit = %self.name, from = %from, "Circuit opened");
        } else {
            self.opened_at.store(previous, Ordering::Release);
        }
    }

    /// Whether a dispatch may proceed. While open, the first call after the
    /// wait moves the breaker to half-open; half-open admits a fixed number
    /// of trial calls.
    pub fn is_call_permitted(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let open_for = self.now_ms() - self.opened_at.load(Ordering::Acquire);
                if open_for < self.config.open_wait.as_millis() as i64 {
                    return false;
                }
                // half_open_since is written before the state flips, like opened_at
                let previous = self.half_open_since.swap(self.now_ms(), Ordering::AcqRel);
                if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    self.reset_trials();
                    info!(circuit = %self.name, "Circuit half-open");
                } else {
                    self.half_open_since.store(previous, Ordering::Release);
                }
                self.try_acquire_trial()
            }
            CircuitState::HalfOpen => {
                if self.reopen_if_trials_stale() {
                    return false;
                }
                self.try_acquire_trial()
            }
        }
    }

    /// Re-open a breaker whose trials have gone unanswered past the max wait
    fn reopen_if_trials_stale(&self) -> bool {
        let half_open_for = self.now_ms() - self.half_open_since.load(Ordering::Acquire);
        if half_open_for < self.config.half_open_max_wait.as_millis() as i64 {
            return false;
        }
        let issued = self.half_open_issued.load(Ordering::Acquire);
        if issued < self.config.half_open_permits {
            return false;
        }
        let answered = self.half_open_successes.load(Ordering::Acquire);
        warn!(
            circuit = %self.name,
            outstanding = self.config.half_open_permits.saturating_sub(answered),
            "Trial calls unanswered, re-opening circuit"
        );
        self.open(CircuitState::HalfOpen);
        self.reset_trials();
        true
    }

    fn try_acquire_trial(&self) -> bool {
        if self.state() != CircuitState::HalfOpen {
            return self.state() == CircuitState::Closed;
        }
        self.half_open_issued.fetch_add(1, Ordering::AcqRel) < self.config.half_open_permits
    }

    pub fn on_success(&self, duration: Duration) {
        self.last_duration_ms.store(duration.as_millis() as i64, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                self.successes.fetch_add(1, Ordering::AcqRel);
                self.evaluate();
            }
            CircuitState::HalfOpen => {
                let successes =
                    self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_permits
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.reset_window();
                    info!(circuit = %self.name, "Circuit closed");
                }
            }
            // Late completion of a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn on_error(&self, duration: Duration, cause: &str) {
        self.last_duration_ms.store(duration.as_millis() as i64, Ordering::Relaxed);
        debug!(circuit = %self.name, cause, "Failure reported to circuit breaker");
        match self.state() {
            CircuitState::Closed => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                self.evaluate();
            }
            CircuitState::HalfOpen => self.open(CircuitState::HalfOpen),
            CircuitState::Open => {}
        }
    }

    fn evaluate(&self) {
        let failures = self.failures.load(Ordering::Acquire);
        let total = failures + self.successes.load(Ordering::Acquire);

        if total >= self.config.minimum_calls {
            let rate = failures.saturating_mul(100) / total.max(1);
            if rate >= u32::from(self.config.failure_rate_threshold) {
                self.open(CircuitState::Closed);
                return;
            }
        }
        if total >= self.config.window_size {
            self.reset_window();
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.state(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub successes: u32,
    pub failures: u32,
    pub last_duration_ms: i64,
}

/// Lazily created breakers keyed by (tenant, trigger)
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, tenant_id: &str, trigger_id: &str) -> Arc<CircuitBreaker> {
        let key = (tenant_id.to_string(), trigger_id.to_string());
        self.breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("{}:{}", tenant_id, trigger_id),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.iter().map(|b| b.value().stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_window(10, 4)
            .with_failure_rate_threshold(50)
            .with_open_wait(Duration::from_secs(3600))
            .with_half_open_permits(2)
            .with_half_open_max_wait(Duration::from_secs(3600))
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            breaker.on_error(Duration::from_millis(5), "boom");
        }
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let breaker = CircuitBreaker::new("acme:t1", config());
        for _ in 0..3 {
            breaker.on_error(Duration::from_millis(5), "boom");
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn test_opens_at_failure_rate() {
        let breaker = CircuitBreaker::new("acme:t1", config());
        breaker.on_success(Duration::from_millis(5));
        breaker.on_success(Duration::from_millis(5));
        breaker.on_error(Duration::from_millis(5), "boom");
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.on_error(Duration::from_millis(5), "boom");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_call_permitted());
    }

    #[test]
    fn test_healthy_traffic_keeps_closed() {
        let breaker = CircuitBreaker::new("acme:t1", config());
        for i in 0..50 {
            if i % 5 == 0 {
                breaker.on_error(Duration::from_millis(5), "boom");
            } else {
                breaker.on_success(Duration::from_millis(5));
            }
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_wait_and_closes_on_trials() {
        let breaker = CircuitBreaker::new("acme:t1", config().with_open_wait(Duration::ZERO));
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.is_call_permitted());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_call_permitted());
        assert!(!breaker.is_call_permitted(), "only two trial calls");

        breaker.on_success(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("acme:t1", config().with_open_wait(Duration::ZERO));
        trip(&breaker);
        assert!(breaker.is_call_permitted());

        breaker.on_error(Duration::from_millis(5), "still broken");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_unanswered_trials_reopen_after_max_wait() {
        let breaker = CircuitBreaker::new(
            "acme:t1",
            CircuitBreakerConfig::default()
                .with_window(4, 4)
                .with_failure_rate_threshold(50)
                .with_open_wait(Duration::ZERO)
                .with_half_open_permits(2)
                .with_half_open_max_wait(Duration::ZERO),
        );
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Two trials that never report back
        assert!(breaker.is_call_permitted());
        assert!(breaker.is_call_permitted());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(!breaker.is_call_permitted());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next round of trials is admitted and can close the breaker
        assert!(breaker.is_call_permitted());
        assert!(breaker.is_call_permitted());
        breaker.on_success(Duration::from_millis(5));
        breaker.on_success(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn test_outstanding_trials_hold_half_open_within_max_wait() {
        let breaker = CircuitBreaker::new("acme:t1", config().with_open_wait(Duration::ZERO));
        trip(&breaker);
        assert!(breaker.is_call_permitted());
        assert!(breaker.is_call_permitted());

        for _ in 0..5 {
            assert!(!breaker.is_call_permitted());
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_registry_isolates_keys() {
        let registry = CircuitBreakerRegistry::new(config());
        trip(&registry.get("acme", "t1"));

        assert!(!registry.get("acme", "t1").is_call_permitted());
        assert!(registry.get("acme", "t2").is_call_permitted());
        assert!(registry.get("globex", "t1").is_call_permitted());
        assert_eq!(registry.len(), 3);
        assert!(Arc::ptr_eq(&registry.get("acme", "t1"), &registry.get("acme", "t1")));
    }
}
