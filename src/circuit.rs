//! Per-model circuit breaker.
//!
//! Generalizes the teacher's per-key `DashMap` state idiom (`RateLimiter`'s
//! `DashMap<IpAddr, Bucket>`) to a `DashMap<model_id, State>` finite state
//! machine, so one model's outage never blocks accounting or admission for
//! any other model.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct State {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
}

impl State {
    fn closed(initial_cooldown: Duration) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: initial_cooldown,
        }
    }
}

/// Whether an [`AdapterError`] should count against a model's circuit.
/// `ClientInvalid` is a caller bug, not a provider outage, so it is excluded.
pub fn counts_as_circuit_failure(err: &AdapterError) -> bool {
    !matches!(err, AdapterError::ClientInvalid(_))
}

/// Finite state machine tracking upstream health per model.
pub struct CircuitBreaker {
    states: DashMap<String, State>,
    failure_threshold: u32,
    initial_cooldown: Duration,
    max_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, initial_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            states: DashMap::new(),
            failure_threshold,
            initial_cooldown,
            max_cooldown,
        }
    }

    /// Whether a call to `model_id` is currently permitted. `OPEN` circuits
    /// past their cooldown are transitioned to `HALF_OPEN` as a side effect
    /// of this check — exactly one probing call is meant to pass through
    /// before the next `record_outcome` resolves the state.
    pub fn can_proceed(&self, model_id: &str) -> bool {
        let mut entry = self
            .states
            .entry(model_id.to_string())
            .or_insert_with(|| State::closed(self.initial_cooldown));

        match entry.status {
            CircuitStatus::Closed => true,
            CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= entry.cooldown {
                    entry.status = CircuitStatus::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn status(&self, model_id: &str) -> CircuitStatus {
        self.states
            .get(model_id)
            .map(|s| s.status)
            .unwrap_or(CircuitStatus::Closed)
    }

    /// Record a successful call. Resets the circuit to `CLOSED`.
    pub fn record_success(&self, model_id: &str) {
        let mut entry = self
            .states
            .entry(model_id.to_string())
            .or_insert_with(|| State::closed(self.initial_cooldown));
        entry.status = CircuitStatus::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        entry.cooldown = self.initial_cooldown;
    }

    /// Record a failed call. Transitions `CLOSED -> OPEN` after the
    /// threshold is reached, or `HALF_OPEN -> OPEN` immediately with
    /// exponential backoff on the cooldown.
    pub fn record_failure(&self, model_id: &str, err: &AdapterError) {
        if !counts_as_circuit_failure(err) {
            return;
        }

        let mut entry = self
            .states
            .entry(model_id.to_string())
            .or_insert_with(|| State::closed(self.initial_cooldown));

        match entry.status {
            CircuitStatus::HalfOpen => {
                let doubled = entry.cooldown.saturating_mul(2);
                entry.cooldown = doubled.min(self.max_cooldown);
                entry.status = CircuitStatus::Open;
                entry.opened_at = Some(Instant::now());
            }
            CircuitStatus::Closed | CircuitStatus::Open => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.status = CircuitStatus::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(20), Duration::from_secs(5))
    }

    #[test]
    fn starts_closed() {
        let cb = breaker();
        assert!(cb.can_proceed("m1"));
        assert_eq!(cb.status("m1"), CircuitStatus::Closed);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("m1", &AdapterError::Transient("boom".into()));
        }
        assert_eq!(cb.status("m1"), CircuitStatus::Open);
        assert!(!cb.can_proceed("m1"));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker();
        cb.record_failure("m1", &AdapterError::Transient("x".into()));
        cb.record_failure("m1", &AdapterError::Transient("x".into()));
        cb.record_success("m1");
        cb.record_failure("m1", &AdapterError::Transient("x".into()));
        // Only one consecutive failure since the reset — should still be closed.
        assert_eq!(cb.status("m1"), CircuitStatus::Closed);
    }

    #[test]
    fn client_invalid_does_not_count_against_circuit() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure("m1", &AdapterError::ClientInvalid("bad request".into()));
        }
        assert_eq!(cb.status("m1"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_cooldown_then_closed_on_success() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("m1", &AdapterError::Transient("x".into()));
        }
        assert!(!cb.can_proceed("m1"));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.can_proceed("m1"), "should allow a probe after cooldown");
        assert_eq!(cb.status("m1"), CircuitStatus::HalfOpen);

        cb.record_success("m1");
        assert_eq!(cb.status("m1"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_backoff() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("m1", &AdapterError::Transient("x".into()));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cb.can_proceed("m1"));
        cb.record_failure("m1", &AdapterError::Transient("still failing".into()));
        assert_eq!(cb.status("m1"), CircuitStatus::Open);
        assert!(!cb.can_proceed("m1"), "should stay open for the doubled cooldown");
    }

    #[test]
    fn independent_models_have_independent_circuits() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("m1", &AdapterError::Transient("x".into()));
        }
        assert!(!cb.can_proceed("m1"));
        assert!(cb.can_proceed("m2"), "m2's circuit must be unaffected by m1's failures");
    }
}
