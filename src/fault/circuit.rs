//! Circuit breaker
//!
//! A three-state machine over a stream of call outcomes. Closed passes
//! calls through and counts consecutive failures; at the threshold the
//! circuit opens and rejects calls without executing them. After the
//! recovery timeout a single probe call is let through (half-open): one
//! success closes the circuit, one failure re-opens it. The probe slot is
//! claimed under the state lock before the operation runs, so concurrent
//! callers in the half-open window are rejected rather than racing the
//! probe.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Snapshot of the breaker for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures observed while closed.
    pub consecutive_failures: u32,
    /// Total calls rejected while open.
    pub rejected_calls: u64,
    /// Milliseconds since the circuit last opened, if it ever has.
    pub open_for_ms: Option<u64>,
}

enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
    // Half-open with the probe slot already claimed by a caller whose
    // operation is still in flight. Publicly reported as HalfOpen.
    HalfOpenProbing,
}

/// Fail-fast wrapper around an unreliable operation.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    rejected: Mutex<u64>,
}

impl CircuitBreaker {
    /// Create a breaker with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a breaker opening after `failure_threshold` consecutive
    /// failures and probing after `recovery_timeout`.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            rejected: Mutex::new(0),
        }
    }

    /// Current state, accounting for recovery-timeout expiry.
    pub fn state(&self) -> BreakerState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        match *state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen | State::HalfOpenProbing => BreakerState::HalfOpen,
        }
    }

    /// Monitoring snapshot.
    pub fn get_status(&self) -> BreakerStatus {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        let (breaker_state, consecutive_failures, open_for_ms) = match *state {
            State::Closed {
                consecutive_failures,
            } => (BreakerState::Closed, consecutive_failures, None),
            State::Open { opened_at } => (
                BreakerState::Open,
                0,
                Some(opened_at.elapsed().as_millis() as u64),
            ),
            State::HalfOpen | State::HalfOpenProbing => (BreakerState::HalfOpen, 0, None),
        };

        BreakerStatus {
            state: breaker_state,
            consecutive_failures,
            rejected_calls: *self.rejected.lock(),
            open_for_ms,
        }
    }

    /// Move Open to HalfOpen once the recovery timeout has elapsed.
    fn refresh(&self, state: &mut State) {
        if let State::Open { opened_at } = *state {
            if opened_at.elapsed() >= self.config.recovery_timeout {
                *state = State::HalfOpen;
                log::info!("circuit breaker half-open, probing downstream");
            }
        }
    }

    /// Execute `operation` if the circuit allows it. While open, and
    /// while another caller holds the half-open probe slot,
    /// [`TaskError::CircuitOpen`] is returned without invoking the
    /// operation.
    pub fn execute<F, T>(&self, operation: F) -> TaskResult<T>
    where
        F: FnOnce() -> TaskResult<T>,
    {
        {
            let mut state = self.state.lock();
            self.refresh(&mut state);
            match *state {
                State::Open { .. } | State::HalfOpenProbing => {
                    *self.rejected.lock() += 1;
                    return Err(TaskError::CircuitOpen);
                }
                State::HalfOpen => {
                    // Claim the single probe slot before releasing the
                    // lock; everyone else fails fast until it resolves.
                    *state = State::HalfOpenProbing;
                }
                State::Closed { .. } => {}
            }
        }

        match operation() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        match *state {
            State::HalfOpen | State::HalfOpenProbing => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
                log::info!("circuit breaker closed after successful probe");
            }
            State::Closed { .. } => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
            State::Open { .. } => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::HalfOpen | State::HalfOpenProbing => {
                *state = State::Open {
                    opened_at: Instant::now(),
                };
                log::warn!("circuit breaker re-opened after failed probe");
            }
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                    log::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        failures
                    );
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        *self.state.lock() = State::Closed {
            consecutive_failures: 0,
        };
        *self.rejected.lock() = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
