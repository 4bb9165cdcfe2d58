//! Circuit breaker: single-owner CLOSED/OPEN/HALF_OPEN state machine.
//!
//! The engine has exactly one writer task driving the sink, so unlike a
//! library meant for concurrent callers this breaker needs no atomics or
//! `Arc`-shared state: it is plain owned fields mutated through `&mut self`.

use crate::clock::{Clock, MonotonicClock};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; caller should wait `wait_remaining` before retrying.
    CircuitOpen { wait_remaining: Duration },
    /// The operation ran and failed.
    Failure(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen { wait_remaining } => {
                write!(f, "circuit breaker is open, retry available in {wait_remaining:?}")
            }
            Self::Failure(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failure(e) => Some(e),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> BreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// CLOSED/OPEN/HALF_OPEN state machine guarding the database writer.
pub struct CircuitBreaker {
    state: CircuitState,
    failures: usize,
    last_failure: Option<u64>,
    last_success: Option<u64>,
    config: CircuitBreakerConfig,
    clock: Box<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state)
            .field("failures", &self.failures)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Box::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Box<dyn Clock>) -> Self {
        Self { state: CircuitState::Closed, failures: 0, last_failure: None, last_success: None, config, clock }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Run `op` through the breaker. Transitions HALF_OPEN → CLOSED on success,
    /// CLOSED/HALF_OPEN → OPEN on a failure that crosses the threshold.
    pub async fn execute<T, E, Fut, Op>(&mut self, op: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        if self.state == CircuitState::Open {
            let elapsed = self.elapsed_since(self.last_failure);
            if elapsed >= self.config.reset_timeout.as_millis() as u64 {
                tracing::info!("circuit_breaker_half_open");
                self.state = CircuitState::HalfOpen;
            } else {
                let remaining = self.config.reset_timeout.as_millis() as u64 - elapsed;
                return Err(BreakerError::CircuitOpen { wait_remaining: Duration::from_millis(remaining) });
            }
        }

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Failure(e))
            }
        }
    }

    fn on_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            tracing::info!(failures = self.failures, "circuit_breaker_closed");
            self.state = CircuitState::Closed;
        }
        self.failures = 0;
        self.last_success = Some(self.clock.now_millis());
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(self.clock.now_millis());

        match self.state {
            CircuitState::HalfOpen => {
                tracing::warn!(failures = self.failures, "circuit_breaker_reopened");
                self.state = CircuitState::Open;
            }
            CircuitState::Closed if self.failures >= self.config.failure_threshold => {
                tracing::error!(
                    failures = self.failures,
                    threshold = self.config.failure_threshold,
                    "circuit_breaker_tripped"
                );
                self.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    fn elapsed_since(&self, instant_millis: Option<u64>) -> u64 {
        match instant_millis {
            Some(t) => self.clock.now_millis().saturating_sub(t),
            None => u64::MAX,
        }
    }
}
