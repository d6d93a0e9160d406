//! Circuit breaker — per-server failure-isolation state machine
//!
//! Three states:
//! - **Closed**: normal operation; failures accumulate, successes bleed
//!   the count back down (gradual recovery, not an instant reset)
//! - **Open**: the server is excluded from selection; once the recovery
//!   timeout elapses, a single successful health probe closes the
//!   circuit outright, while a forwarded request is admitted as a trial
//! - **HalfOpen**: a bounded number of trial calls decide the next state
//!
//! The breaker never reads the wall clock itself; callers pass `now` so
//! transitions are deterministic under test. State transitions are
//! returned to the caller, which owns event emission.

use crate::config::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Instant;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Failure threshold reached; server excluded from selection
    Open,
    /// Recovery timeout elapsed and a trial call was admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Observable state transition, reported to the caller for event emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed or half-open → open
    Opened,
    /// Open or half-open → closed
    Closed,
}

/// Point-in-time breaker view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failure count
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

/// Per-server circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker with zero failures
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_calls: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.read().unwrap().state
    }

    /// Whether the circuit is open (server excluded from selection)
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().unwrap().consecutive_failures
    }

    /// When the most recent failure was recorded
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.inner.read().unwrap().last_failure_at
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().unwrap();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Whether a request may be dispatched to this server right now.
    ///
    /// Closed always admits. Open rejects until the recovery timeout has
    /// elapsed, after which the first admission moves the circuit to
    /// half-open as a trial. Half-open admits up to `half_open_max_calls`
    /// trials (each admission counts).
    pub fn admit(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.write().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => match inner.next_attempt_at {
                Some(at) if now >= at => {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 1;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request outcome
    pub fn record_success(&self, _now: Instant) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }
        let mut inner = self.inner.write().unwrap();
        match inner.state {
            CircuitState::Closed => {
                // Gradual recovery — bleed one failure per success
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
                None
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_calls = 0;
                inner.last_failure_at = None;
                inner.next_attempt_at = None;
                tracing::info!("circuit breaker closed after successful trial");
                Some(Transition::Closed)
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed request outcome
    pub fn record_failure(&self, now: Instant) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }
        let mut inner = self.inner.write().unwrap();
        inner.last_failure_at = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_attempt_at = Some(now + self.config.recovery_timeout());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    Some(Transition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                // Failed trial re-opens with a fresh recovery window
                inner.state = CircuitState::Open;
                inner.half_open_calls = 0;
                inner.consecutive_failures += 1;
                inner.next_attempt_at = Some(now + self.config.recovery_timeout());
                tracing::warn!("circuit breaker re-opened after failed trial");
                Some(Transition::Opened)
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
                None
            }
        }
    }

    /// Report a successful external health probe.
    ///
    /// Once the recovery timeout has elapsed, a single probe success
    /// closes an open circuit outright with the failure count zeroed;
    /// before the timeout it is ignored. A probe success while half-open
    /// counts as the trial outcome and closes the circuit.
    pub fn record_probe_success(&self, now: Instant) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }
        let mut inner = self.inner.write().unwrap();
        match inner.state {
            CircuitState::Open => {
                match inner.next_attempt_at {
                    Some(at) if now >= at => {
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.half_open_calls = 0;
                        inner.next_attempt_at = None;
                        tracing::info!("circuit breaker closed after probe success");
                        Some(Transition::Closed)
                    }
                    _ => None,
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_calls = 0;
                inner.next_attempt_at = None;
                tracing::info!("circuit breaker closed after probe success");
                Some(Transition::Closed)
            }
            CircuitState::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            recovery_timeout_ms: 1_000,
            half_open_max_calls: 2,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(fast_config())
    }

    fn trip(cb: &CircuitBreaker, now: Instant) {
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.record_failure(now), Some(Transition::Opened));
    }

    // --- Initial state ---

    #[test]
    fn test_starts_closed_with_zero_failures() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.admit(Instant::now()));
    }

    // --- Closed: failure accumulation ---

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = breaker();
        let now = Instant::now();
        assert_eq!(cb.record_failure(now), None);
        assert_eq!(cb.record_failure(now), None);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
        assert!(!cb.admit(now));
    }

    // --- Closed: gradual recovery ---

    #[test]
    fn test_success_decrements_not_resets() {
        let cb = breaker();
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success(now);
        assert_eq!(cb.consecutive_failures(), 1);
        cb.record_success(now);
        assert_eq!(cb.consecutive_failures(), 0);
        // Floor at zero
        cb.record_success(now);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    // --- Open → HalfOpen gate ---

    #[test]
    fn test_probe_success_before_timeout_stays_open() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert_eq!(cb.record_probe_success(now + Duration::from_millis(500)), None);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_single_probe_success_after_timeout_closes() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert_eq!(cb.consecutive_failures(), 3);

        let transition = cb.record_probe_success(now + Duration::from_millis(1_000));
        assert_eq!(transition, Some(Transition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.admit(now + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_elapsed_time_alone_does_not_release() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        // Time passing without a reported outcome keeps the circuit open
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    // --- Trial admission ---

    #[test]
    fn test_trial_admitted_only_after_timeout() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert!(!cb.admit(now + Duration::from_millis(999)));
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.admit(now + Duration::from_millis(1_000)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.is_open());
    }

    // --- HalfOpen outcomes ---

    #[test]
    fn test_half_open_closes_on_success() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert!(cb.admit(now + Duration::from_secs(1)));
        let transition = cb.record_success(now + Duration::from_secs(1));
        assert_eq!(transition, Some(Transition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_closes_on_probe_success() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert!(cb.admit(now + Duration::from_secs(1)));
        let transition = cb.record_probe_success(now + Duration::from_secs(1));
        assert_eq!(transition, Some(Transition::Closed));
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        assert!(cb.admit(now + Duration::from_secs(1)));
        let transition = cb.record_failure(now + Duration::from_secs(1));
        assert_eq!(transition, Some(Transition::Opened));
        assert_eq!(cb.state(), CircuitState::Open);

        // New recovery window: probe success right away must not release
        assert_eq!(cb.record_probe_success(now + Duration::from_secs(1)), None);
        // But after another full timeout it closes again
        let transition = cb.record_probe_success(now + Duration::from_secs(2));
        assert_eq!(transition, Some(Transition::Closed));
    }

    // --- Half-open trial cap ---

    #[test]
    fn test_half_open_admits_up_to_max_calls() {
        let cb = breaker();
        let now = Instant::now();
        trip(&cb, now);
        let later = now + Duration::from_secs(1);
        assert!(cb.admit(later)); // releasing admission counts as trial 1
        assert!(cb.admit(later));
        assert!(!cb.admit(later)); // cap of 2
    }

    // --- Disabled breaker ---

    #[test]
    fn test_disabled_breaker_never_opens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..fast_config()
        });
        let now = Instant::now();
        for _ in 0..10 {
            assert_eq!(cb.record_failure(now), None);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.admit(now));
    }

    // --- Display / serde ---

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }

    #[test]
    fn test_snapshot_serialization() {
        let cb = breaker();
        cb.record_failure(Instant::now());
        let snap = cb.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"closed\""));
        assert!(json.contains("\"consecutive_failures\":1"));
    }
}
