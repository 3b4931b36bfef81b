/// Circuit Breaker Pattern for monitored operations and backend servers
///
/// One state machine shared by the error handler (keyed by operation name),
/// the load balancer (keyed by server id) and the external cache tier.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow through normally
    Closed,
    /// Requests are rejected until the recovery timeout passes
    Open,
    /// A bounded number of trial requests are admitted
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Time since the last failure before a trial call is admitted
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open; this many consecutive
    /// successes close the circuit
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    half_open_successes: usize,
    half_open_calls: usize,
    /// When the most recent half-open trial slot was handed out
    last_trial_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            half_open_calls: 0,
            last_trial_at: None,
            last_failure_at: None,
            opened_at: None,
        }
    }

    fn recovery_elapsed(&self, timeout: Duration, now: Instant) -> bool {
        self.last_failure_at
            .map(|at| now.duration_since(at) >= timeout)
            .unwrap_or(true)
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
        self.half_open_calls = 0;
        self.last_trial_at = None;
    }

    fn take_trial(&mut self, now: Instant) {
        self.half_open_calls += 1;
        self.last_trial_at = Some(now);
    }

    /// Trials that never reported back within `timeout` are presumed lost
    /// and their slots handed out again.
    fn reclaim_stale_trials(&mut self, timeout: Duration, now: Instant, max_calls: usize) -> bool {
        let stale = self.half_open_calls >= max_calls
            && self
                .last_trial_at
                .map(|at| now.duration_since(at) >= timeout)
                .unwrap_or(true);
        if stale {
            self.half_open_calls = self.half_open_successes;
        }
        stale
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.half_open_calls = 0;
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_operations: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            total_operations: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit or reject one call. A half-open admission consumes a trial slot.
    pub async fn allow_request(&self) -> bool {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.recovery_elapsed(self.config.recovery_timeout, now) {
                    inner.enter_half_open();
                    inner.take_trial(now);
                    tracing::info!("Circuit breaker '{}' transitioning to half-open", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.reclaim_stale_trials(
                    self.config.recovery_timeout,
                    now,
                    self.config.half_open_max_calls,
                ) {
                    tracing::warn!(
                        "Circuit breaker '{}' reclaimed half-open trials with no result",
                        self.name
                    );
                }
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.take_trial(now);
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Whether a call would currently be admitted, without taking a trial
    /// slot. Still performs the open -> half-open transition once due.
    pub async fn is_call_permitted(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.recovery_elapsed(self.config.recovery_timeout, now) {
                    inner.enter_half_open();
                    tracing::info!("Circuit breaker '{}' transitioning to half-open", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.reclaim_stale_trials(
                    self.config.recovery_timeout,
                    now,
                    self.config.half_open_max_calls,
                );
                inner.half_open_calls < self.config.half_open_max_calls
            }
        }
    }

    /// Hand back a trial slot whose call never reached the protected
    /// operation. Counts as neither success nor failure.
    pub async fn release_trial(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls > inner.half_open_successes
        {
            inner.half_open_calls -= 1;
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    *inner = BreakerState::closed();
                    tracing::info!(
                        "Circuit breaker '{}' closed after successful recovery",
                        self.name
                    );
                }
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open(now);
                    tracing::warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        self.name,
                        inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open(now);
                tracing::warn!(
                    "Circuit breaker '{}' reopened after failure in half-open state",
                    self.name
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Get current circuit state
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == CircuitState::Open
    }

    /// Remaining time before an open circuit admits a trial call
    pub async fn retry_after(&self) -> Duration {
        let inner = self.inner.lock().await;
        match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => self
                .config
                .recovery_timeout
                .saturating_sub(Instant::now().duration_since(at)),
            _ => Duration::ZERO,
        }
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        let now = Instant::now();

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_calls: inner.half_open_calls,
            total_operations: self.total_operations.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            open_for_ms: inner
                .opened_at
                .filter(|_| inner.state == CircuitState::Open)
                .map(|t| now.duration_since(t).as_millis() as u64),
        }
    }

    /// Reset the circuit breaker (admin)
    pub async fn reset(&self) {
        *self.inner.lock().await = BreakerState::closed();
        tracing::info!("Circuit breaker '{}' manually reset", self.name);
    }

    /// Execute an async operation with circuit breaker protection
    pub async fn execute_async<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow_request().await {
            return Err(CircuitBreakerError::CircuitOpen {
                name: self.name.clone(),
                retry_after: self.retry_after().await,
            });
        }

        match f().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }
}

/// Circuit breaker error
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E: Into<AppError>> From<CircuitBreakerError<E>> for AppError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { name, retry_after } => {
                AppError::CircuitOpen { name, retry_after }
            }
            CircuitBreakerError::OperationFailed(e) => e.into(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub half_open_calls: usize,
    pub total_operations: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub open_for_ms: Option<u64>,
}
