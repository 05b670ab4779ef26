//! Circuit breaker guarding the cache backing store.
//!
//! After `failure_threshold` consecutive failures the circuit opens and every
//! cache call is answered as a miss without touching the store. Once the
//! cooldown elapses a single trial call is let through (half-open); success
//! closes the circuit, failure re-opens it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Observable state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: Mutex<u32>,
    cooldown: Mutex<Duration>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: Mutex::new(failure_threshold.max(1)),
            cooldown: Mutex::new(cooldown),
        }
    }

    /// Changes the thresholds without resetting the current state.
    pub fn reconfigure(&self, failure_threshold: u32, cooldown: Duration) {
        *self.failure_threshold.lock() = failure_threshold.max(1);
        *self.cooldown.lock() = cooldown;
    }

    /// Returns whether a store call may be attempted now.
    pub fn allow(&self) -> bool {
        let cooldown = *self.cooldown.lock();
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened_at) if opened_at.elapsed() >= cooldown && !state.trial_in_flight => {
                state.trial_in_flight = true;
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.opened_at.is_some() {
            info!("cache store recovered, closing circuit");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let threshold = *self.failure_threshold.lock();
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let reopen = state.trial_in_flight;
        state.trial_in_flight = false;

        if reopen || (state.opened_at.is_none() && state.consecutive_failures >= threshold) {
            warn!(
                failures = state.consecutive_failures,
                "cache store failing, opening circuit"
            );
            state.opened_at = Some(Instant::now());
            metrics::counter!("permgate_cache_circuit_opened_total").increment(1);
        }
    }

    pub fn state(&self) -> CircuitState {
        let cooldown = *self.cooldown.lock();
        let state = self.state.lock();
        match state.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) if opened_at.elapsed() >= cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }
}
