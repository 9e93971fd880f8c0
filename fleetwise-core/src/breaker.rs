//! # Circuit Breaker
//!
//! Per-instance three-state gate that protects a failing upstream and the
//! caller from it. Breakers prevent cascading failures by rejecting calls to
//! an instance that has failed repeatedly, then probing recovery with a
//! single trial call at a time.
//!
//! ## States
//!
//! - **Closed** (initial): calls pass; a success resets the failure count, a
//!   failure increments it; at `failure_threshold` the breaker opens
//! - **Open**: calls are rejected immediately until `timeout` has elapsed
//!   since the last failure, then the breaker moves to half-open
//! - **HalfOpen**: one trial call at a time is admitted; `success_threshold`
//!   consecutive successes close the breaker, any failure reopens it
//!
//! All transitions are logged. Manual overrides (`force_open`,
//! `force_close`, `reset`) bypass the state machine and clear counters.
//!
//! Gate decisions never suspend, so state lives behind a plain mutex. For a
//! fixed sequence of outcomes the state trajectory depends only on the
//! configured thresholds and timeout.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,
    /// Failing, calls rejected
    Open,
    /// Testing recovery with limited trial calls
    HalfOpen,
}

/// Thresholds and timing for breaker behavior.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing recovery
    pub timeout: Duration,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    /// Whether a half-open trial call is currently outstanding
    trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of a breaker, for admin introspection.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub instance_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Per-instance circuit breaker.
pub struct CircuitBreaker {
    instance_id: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(instance_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            instance_id: instance_id.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Ask for permission to call the instance.
    ///
    /// Returns `false` when the circuit is open (and the timeout has not
    /// elapsed) or when a half-open trial is already outstanding. A `true`
    /// from half-open claims the single trial slot; the caller must report
    /// the outcome via [`CircuitBreaker::on_success`] or
    /// [`CircuitBreaker::on_failure`].
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(false);
                if elapsed {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.trial_in_flight = true;
                    tracing::info!(
                        instance_id = %self.instance_id,
                        "circuit breaker transitioning to HALF-OPEN"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Whether a call could currently be admitted, without claiming the
    /// half-open trial slot or transitioning state. Candidate filtering uses
    /// this; dispatch must still go through [`CircuitBreaker::try_acquire`].
    pub fn available(&self) -> bool {
        let state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state
                .last_failure_at
                .map(|at| at.elapsed() >= self.config.timeout)
                .unwrap_or(false),
            CircuitState::HalfOpen => !state.trial_in_flight,
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.trial_in_flight = false;
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    tracing::info!(
                        instance_id = %self.instance_id,
                        "circuit breaker CLOSED - instance recovered"
                    );
                }
            }
            CircuitState::Open => {
                // A call admitted just before the circuit opened can still
                // land here; it does not change the open state.
            }
        }
    }

    /// Record a failed or timed-out call.
    pub fn on_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.trial_in_flight = false;
        state.last_failure_at = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        failures = state.failure_count,
                        "circuit breaker OPEN - too many failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.success_count = 0;
                tracing::warn!(
                    instance_id = %self.instance_id,
                    "circuit breaker reopened - trial call failed"
                );
            }
            CircuitState::Open => {
                state.failure_count += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            instance_id: self.instance_id.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
        }
    }

    /// Manually open the circuit, clearing counters.
    pub fn force_open(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState {
            state: CircuitState::Open,
            last_failure_at: Some(Instant::now()),
            ..BreakerState::default()
        };
        tracing::info!(instance_id = %self.instance_id, "circuit breaker forced OPEN");
    }

    /// Manually close the circuit, clearing counters.
    pub fn force_close(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::default();
        tracing::info!(instance_id = %self.instance_id, "circuit breaker forced CLOSED");
    }

    /// Reset to the initial closed state. Alias of `force_close` kept for
    /// the admin surface.
    pub fn reset(&self) {
        self.force_close();
    }
}
