//! Per-credential circuit breaker.
//!
//! A credential that keeps failing is tripped open so selection skips it
//! without waiting for cooldowns to accumulate. After the open window elapses
//! the health sweep moves it to half-open, where a short streak of successes
//! closes it again and any failure re-opens it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consecutive failures before the circuit trips.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long a tripped circuit stays open before probing recovery.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Successes required in half-open before the circuit closes.
const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Credential is failing, selection skips it.
    Open,
    /// Probing recovery, limited traffic allowed.
    HalfOpen,
}

/// Failure-threshold state machine attached to one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub threshold: u32,
    #[serde(with = "crate::scheduler::credential::duration_secs")]
    pub timeout: Duration,
    pub last_failure: Option<DateTime<Utc>>,
    /// Meaningful only while `state == Open`.
    pub next_attempt: Option<DateTime<Utc>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            threshold,
            timeout,
            last_failure: None,
            next_attempt: None,
        }
    }

    /// Records a failure. Returns `true` when the circuit is open afterwards.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.failure_count += 1;
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.threshold {
                    self.trip(now);
                }
            },
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.trip(now);
            },
            CircuitState::Open => {},
        }

        self.state == CircuitState::Open
    }

    /// Records a success. Returns `true` when this success closed the circuit.
    ///
    /// Successes while closed leave the failure counter untouched; it only
    /// resets when the circuit closes out of half-open.
    pub fn record_success(&mut self) -> bool {
        if self.state != CircuitState::HalfOpen {
            return false;
        }

        self.success_count += 1;
        if self.success_count >= HALF_OPEN_SUCCESS_THRESHOLD {
            self.state = CircuitState::Closed;
            self.failure_count = 0;
            self.success_count = 0;
            self.next_attempt = None;
            return true;
        }
        false
    }

    /// Moves an open circuit whose window has elapsed into half-open.
    /// Returns `true` when the transition happened.
    pub fn try_half_open(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }
        let expired = self.next_attempt.is_none_or(|t| now >= t);
        if expired {
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
        }
        expired
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.next_attempt = Some(
            now + ChronoDuration::from_std(self.timeout).unwrap_or(ChronoDuration::seconds(60)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_open_at_threshold() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        assert!(!breaker.record_failure(now));
        assert!(!breaker.record_failure(now));
        assert!(breaker.record_failure(now));
        assert_eq!(breaker.state, CircuitState::Open);
        assert!(breaker.next_attempt.is_some());
    }

    #[test]
    fn test_closed_success_does_not_reset_failures() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.failure_count, 2);

        assert!(breaker.record_failure(now));
        assert_eq!(breaker.state, CircuitState::Open);
    }

    #[test]
    fn test_half_open_recovery_closes_after_three() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));

        breaker.record_failure(now);
        assert_eq!(breaker.state, CircuitState::Open);

        let later = now + ChronoDuration::seconds(61);
        assert!(breaker.try_half_open(later));
        assert_eq!(breaker.state, CircuitState::HalfOpen);

        assert!(!breaker.record_success());
        assert!(!breaker.record_success());
        assert!(breaker.record_success());
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(breaker.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));

        breaker.record_failure(now);
        let later = now + ChronoDuration::seconds(61);
        breaker.try_half_open(later);
        breaker.record_success();

        assert!(breaker.record_failure(later));
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.success_count, 0);
        assert!(breaker.next_attempt.is_some_and(|t| t > later));
    }

    #[test]
    fn test_open_window_not_elapsed() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure(now);

        assert!(!breaker.try_half_open(now + ChronoDuration::seconds(30)));
        assert_eq!(breaker.state, CircuitState::Open);
    }
}
