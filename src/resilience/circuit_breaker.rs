use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::Dependency;

/// Circuit breaker thresholds for one dependency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub open_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Failing fast, the dependency is not called
    Open,
    /// Trial calls, one at a time
    HalfOpen,
}

/// Point-in-time copy of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }
}

/// Per-dependency circuit breaker shared by all instrument workers
///
/// State transitions happen under a short mutex critical section; the
/// lock is never held across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: Dependency,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.config.open_timeout_secs)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitState {
        let inner = self.lock();
        CircuitState {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }

    /// Ask to make a call. None means fail fast.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => Some(BreakerPermit::new(self, false)),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.open_timeout())
                    .unwrap_or(true);
                if !elapsed {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.success_count = 0;
                inner.trial_in_flight = true;
                tracing::info!(dependency = %self.dependency, "Circuit half-open, allowing trial call");
                Some(BreakerPermit::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(BreakerPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();

        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.close();
                    tracing::info!(dependency = %self.dependency, "Circuit closed");
                }
            }
            _ => {}
        }
    }

    /// Returns true if this failure opened the circuit
    fn on_failure(&self, trial: bool) -> bool {
        let mut inner = self.lock();
        inner.last_failure = Some(Utc::now());

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    tracing::error!(
                        dependency = %self.dependency,
                        failures = inner.failure_count,
                        "Circuit opened"
                    );
                    return true;
                }
                false
            }
            BreakerState::HalfOpen if trial => {
                inner.failure_count += 1;
                inner.open();
                tracing::error!(dependency = %self.dependency, "Trial call failed, circuit re-opened");
                true
            }
            _ => false,
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    /// Open immediately regardless of the failure count
    ///
    /// Returns false if the circuit was already open.
    pub fn force_open(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            return false;
        }
        inner.open();
        tracing::error!(dependency = %self.dependency, "Circuit forced open");
        true
    }

    /// Close and clear all counters
    pub fn reset(&self) {
        self.lock().close();
    }
}

/// Right to make one call through a breaker
///
/// Dropping a permit without settling it (e.g. the call was cancelled)
/// frees the half-open trial slot.
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Returns true if this failure opened the circuit
    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Dependency::ExecutionGateway, CircuitBreakerConfig::default())
    }

    fn fail_times(breaker: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            breaker.try_acquire().expect("permit").fail();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker();

        fail_times(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Closed);

        let opened = breaker.try_acquire().unwrap().fail();
        assert!(opened);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker();

        fail_times(&breaker, 4);
        breaker.try_acquire().unwrap().succeed();
        fail_times(&breaker, 4);

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_allows_single_trial() {
        let breaker = breaker();
        fail_times(&breaker, 5);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().expect("trial call after timeout");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Only one trial in flight
        assert!(breaker.try_acquire().is_none());
        trial.succeed();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_three_half_open_successes() {
        let breaker = breaker();
        fail_times(&breaker, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        for i in 0..3 {
            assert_eq!(breaker.state(), if i == 0 { BreakerState::Open } else { BreakerState::HalfOpen });
            breaker.try_acquire().expect("trial").succeed();
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        fail_times(&breaker, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        breaker.try_acquire().unwrap().succeed();
        assert!(breaker.try_acquire().unwrap().fail());
        assert_eq!(breaker.state(), BreakerState::Open);

        // The open timeout starts over
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let breaker = breaker();
        fail_times(&breaker, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);

        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_reset() {
        let breaker = breaker();
        assert!(breaker.force_open());
        assert!(!breaker.force_open());
        assert!(breaker.try_acquire().is_none());

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_records_last_failure() {
        let breaker = breaker();
        assert!(breaker.snapshot().last_failure.is_none());

        fail_times(&breaker, 1);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 1);
        assert!(snapshot.last_failure.is_some());
    }
}
