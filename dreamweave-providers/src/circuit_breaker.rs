//! # Circuit Breaker Module
//!
//! Per-provider three-state gate that keeps a failing upstream from being
//! hammered while it recovers.
//!
//! ## States
//!
//! - **Closed**: dispatch allowed. Failures are counted; the circuit trips
//!   to Open when consecutive failures reach the threshold *or* the failure
//!   rate over the recent-request ring crosses the rate threshold with
//!   enough samples.
//! - **Open**: dispatch denied. After the cooldown elapses the next
//!   admission attempt moves the circuit to Half-Open.
//! - **Half-Open**: exactly one probe is admitted. Probe success closes the
//!   circuit; probe failure reopens it and the cooldown restarts.
//!
//! Admission returns a [`CircuitGuard`] that must be resolved with
//! [`CircuitGuard::success`] or [`CircuitGuard::failure`]. Dropping the
//! guard unresolved (timeout, cancellation, panic unwind) releases the
//! half-open probe hold without recording an outcome, so a cancelled probe
//! can never wedge the circuit. State transitions are atomic with the
//! consecutive-failure update: both happen under one lock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failure detected, requests blocked
    Open,
    /// Testing recovery, a single probe allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Failure rate over the recent-request ring that also opens the circuit
    pub failure_rate_threshold: f64,
    /// Minimum samples in the ring before the rate rule applies
    pub min_samples: usize,
    /// Time the circuit stays open before admitting a probe
    #[serde(with = "crate::duration_serde")]
    pub cooldown: Duration,
    /// Size of the recent-request ring
    pub window: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
            window: 20,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// Recent outcomes, true = success
    recent: VecDeque<bool>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            recent: VecDeque::new(),
        }
    }
}

/// Read-only view of breaker state for dashboards and health derivation.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// How long the circuit has been open, if it is
    pub open_for: Option<Duration>,
    pub probe_in_flight: bool,
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy)]
pub enum CircuitRejection {
    /// Circuit is open and the cooldown has not elapsed
    Open { retry_after: Duration },
    /// Circuit is half-open and its single probe slot is taken
    ProbeInFlight,
}

/// Per-provider circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A poisoned lock only means a holder panicked between two field
        // writes that are individually valid; recover the inner state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to dispatch. Returns a guard that must be resolved with the
    /// outcome, or a rejection explaining why dispatch is denied.
    pub fn try_acquire(&self) -> Result<CircuitGuard<'_>, CircuitRejection> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CircuitGuard {
                breaker: self,
                probe: false,
                resolved: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(provider = %self.name, "circuit transitioning to half-open");
                    Ok(CircuitGuard {
                        breaker: self,
                        probe: true,
                        resolved: false,
                    })
                } else {
                    Err(CircuitRejection::Open {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitRejection::ProbeInFlight)
                } else {
                    inner.probe_in_flight = true;
                    Ok(CircuitGuard {
                        breaker: self,
                        probe: true,
                        resolved: false,
                    })
                }
            }
        }
    }

    fn record_success(&self, probe: bool) -> Option<CircuitState> {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        Self::push_outcome(&mut inner, self.config.window, true);
        if probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.recent.clear();
            tracing::info!(provider = %self.name, "circuit closed after successful probe");
            return Some(CircuitState::Closed);
        }
        None
    }

    fn record_failure(&self, probe: bool) -> Option<CircuitState> {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        Self::push_outcome(&mut inner, self.config.window, false);
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                let rate_tripped = inner.recent.len() >= self.config.min_samples
                    && Self::failure_rate(&inner.recent) >= self.config.failure_rate_threshold;
                if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        provider = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(provider = %self.name, "probe failed, circuit reopened");
                Some(CircuitState::Open)
            }
            // Late completion of a request admitted before the trip.
            CircuitState::Open => None,
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    fn push_outcome(inner: &mut BreakerInner, window: usize, success: bool) {
        if inner.recent.len() >= window {
            inner.recent.pop_front();
        }
        inner.recent.push_back(success);
    }

    fn failure_rate(recent: &VecDeque<bool>) -> f64 {
        if recent.is_empty() {
            return 0.0;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        failures as f64 / recent.len() as f64
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner.opened_at.map(|at| at.elapsed()),
            probe_in_flight: inner.probe_in_flight,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Manually open the circuit (administrative / test hook).
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Manually reset the circuit (administrative / test hook).
    pub fn force_closed(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::default();
    }
}

/// Admission token for one dispatch. Resolve with [`success`](Self::success)
/// or [`failure`](Self::failure); dropping it unresolved releases any probe
/// hold without recording an outcome.
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl CircuitGuard<'_> {
    /// Whether this admission is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful outcome. Returns the new state on transition.
    pub fn success(mut self) -> Option<CircuitState> {
        self.resolved = true;
        self.breaker.record_success(self.probe)
    }

    /// Record a failed outcome. Returns the new state on transition.
    pub fn failure(mut self) -> Option<CircuitState> {
        self.resolved = true;
        self.breaker.record_failure(self.probe)
    }
}

impl Drop for CircuitGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_millis(100),
            window: 20,
        }
    }

    fn fail_once(breaker: &CircuitBreaker) {
        breaker.try_acquire().expect("admission").failure();
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new("test", test_config());
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn opens_on_the_threshold_failure_exactly() {
        let breaker = CircuitBreaker::new("test", test_config());
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", test_config());
        fail_once(&breaker);
        fail_once(&breaker);
        breaker.try_acquire().expect("admission").success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_circuit_rejects_until_cooldown() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        assert!(matches!(
            breaker.try_acquire(),
            Err(CircuitRejection::Open { .. })
        ));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        std::thread::sleep(Duration::from_millis(120));

        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        // Second admission while the probe is outstanding must be refused.
        assert!(matches!(
            breaker.try_acquire(),
            Err(CircuitRejection::ProbeInFlight)
        ));
        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        std::thread::sleep(Duration::from_millis(120));

        let probe = breaker.try_acquire().expect("probe admitted");
        assert_eq!(probe.failure(), Some(CircuitState::Open));
        assert!(matches!(
            breaker.try_acquire(),
            Err(CircuitRejection::Open { .. })
        ));
    }

    #[test]
    fn dropping_an_unresolved_probe_releases_the_hold() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        std::thread::sleep(Duration::from_millis(120));

        {
            let probe = breaker.try_acquire().expect("probe admitted");
            assert!(probe.is_probe());
            // Dropped without an outcome, e.g. the request was cancelled.
        }
        // The slot is free again for the next probe.
        let probe = breaker.try_acquire().expect("second probe admitted");
        assert!(probe.is_probe());
    }

    #[test]
    fn failure_rate_trips_with_enough_samples() {
        let mut config = test_config();
        config.failure_threshold = 100; // keep the consecutive rule out of the way
        let breaker = CircuitBreaker::new("test", config);

        // Alternate so consecutive failures never accumulate: 5 ok, 5 failed
        // out of 10 is exactly the 0.5 rate threshold.
        for _ in 0..5 {
            breaker.try_acquire().expect("admission").success();
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
