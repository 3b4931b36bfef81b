//! Structured error handling: classification, recovery strategies,
//! per-operation circuit breakers and a bounded error history.

mod classify;

pub use classify::{classify, ErrorType, RecoveryStrategy, Severity};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::config::ErrorHandlerConfig;
use crate::error::{AppError, AppResult, ErrorCategory};
use crate::health::ComponentHealth;

/// Where an error happened and what the caller allows
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    #[serde(skip)]
    pub retry_delay: Option<Duration>,
    #[serde(skip)]
    pub allow_recovery: bool,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            session_id: None,
            user_id: None,
            task_id: None,
            retry_delay: None,
            allow_recovery: true,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn allow_recovery(mut self, allow: bool) -> Self {
        self.allow_recovery = allow;
        self
    }
}

/// One recorded error. After it enters the history only
/// `recovery_successful` changes, once the retried call reports back.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub error_id: Uuid,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub recovery_time_ms: Option<f64>,
}

/// Result of `handle_error`
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub error_id: Uuid,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub category: ErrorCategory,
    /// The strategy waited out its delay; the caller may try again
    pub retry: bool,
    pub recovery_time: Option<Duration>,
}

/// Receives critical-severity errors
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, record: &ErrorRecord);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, record: &ErrorRecord) {
        tracing::error!(
            error_id = %record.error_id,
            error_type = %record.error_type,
            operation = %record.context.operation,
            session_id = ?record.context.session_id,
            message = %record.message,
            "Critical error"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMetrics {
    pub total_errors: u64,
    pub history_len: usize,
    pub by_type: BTreeMap<ErrorType, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub recovery_attempts: usize,
    pub recovery_successes: usize,
    pub recovery_success_rate: f64,
    pub average_recovery_time_ms: f64,
    pub open_circuits: Vec<String>,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
}

pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    history: Mutex<VecDeque<ErrorRecord>>,
    strategies: RwLock<HashMap<ErrorType, RecoveryStrategy>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    alert_sink: Arc<dyn AlertSink>,
    total_errors: AtomicU64,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self::with_alert_sink(config, Arc::new(LogAlertSink))
    }

    pub fn with_alert_sink(config: ErrorHandlerConfig, alert_sink: Arc<dyn AlertSink>) -> Self {
        let strategies = ErrorType::ALL
            .iter()
            .map(|t| (*t, RecoveryStrategy::default_for(*t, &config)))
            .collect();

        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            strategies: RwLock::new(strategies),
            breakers: RwLock::new(HashMap::new()),
            alert_sink,
            total_errors: AtomicU64::new(0),
            config,
        }
    }

    /// Replace the strategy used for one error type
    pub async fn register_strategy(&self, error_type: ErrorType, strategy: RecoveryStrategy) {
        self.strategies.write().await.insert(error_type, strategy);
    }

    pub async fn strategy(&self, error_type: ErrorType) -> RecoveryStrategy {
        self.strategies
            .read()
            .await
            .get(&error_type)
            .copied()
            .unwrap_or_else(|| RecoveryStrategy::default_for(error_type, &self.config))
    }

    /// Get or create the breaker guarding `operation`
    pub async fn circuit_breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(operation) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    operation,
                    CircuitBreakerConfig {
                        failure_threshold: self.config.failure_threshold,
                        recovery_timeout: self.config.recovery_timeout(),
                        half_open_max_calls: self.config.half_open_max_calls,
                    },
                ))
            })
            .clone()
    }

    /// Classify, run the recovery strategy and record.
    ///
    /// For a retrying strategy the delay is waited out here, so when
    /// `retry` comes back true the caller can go again immediately.
    pub async fn handle_error(&self, error: &AppError, context: ErrorContext) -> RecoveryOutcome {
        let (error_type, severity) = classify(error);
        let strategy = self.strategy(error_type).await;

        let delay = if context.allow_recovery {
            strategy.retry_delay(context.retry_delay)
        } else {
            None
        };

        let recovery_time = match delay {
            Some(delay) => {
                let started = Instant::now();
                tokio::time::sleep(delay).await;
                Some(started.elapsed())
            }
            None => None,
        };

        let record = ErrorRecord {
            error_id: Uuid::new_v4(),
            error_type,
            severity,
            category: error.category(),
            message: error.to_string(),
            context,
            timestamp: Utc::now(),
            recovery_attempted: delay.is_some(),
            recovery_successful: false,
            recovery_time_ms: recovery_time.map(|d| d.as_secs_f64() * 1000.0),
        };

        let outcome = RecoveryOutcome {
            error_id: record.error_id,
            error_type,
            severity,
            category: record.category,
            retry: delay.is_some(),
            recovery_time,
        };

        self.push(record).await;
        outcome
    }

    /// Mark whether the call retried after `error_id` went on to succeed
    pub async fn record_recovery_result(&self, error_id: Uuid, succeeded: bool) {
        let mut history = self.history.lock().await;
        if let Some(record) = history
            .iter_mut()
            .rev()
            .find(|r| r.error_id == error_id && r.recovery_attempted)
        {
            record.recovery_successful = succeeded;
        }
    }

    /// Record without attempting recovery
    pub async fn record_error(&self, error: &AppError, context: ErrorContext) -> Uuid {
        self.handle_error(error, context.allow_recovery(false))
            .await
            .error_id
    }

    async fn push(&self, record: ErrorRecord) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);

        match record.severity {
            Severity::Critical | Severity::High => tracing::error!(
                "[{}] {} in {}: {}",
                record.error_type,
                record.error_id,
                record.context.operation,
                record.message
            ),
            Severity::Medium => tracing::warn!(
                "[{}] {} in {}: {}",
                record.error_type,
                record.error_id,
                record.context.operation,
                record.message
            ),
            Severity::Low => tracing::debug!(
                "[{}] {} in {}: {}",
                record.error_type,
                record.error_id,
                record.context.operation,
                record.message
            ),
        }

        if record.severity == Severity::Critical {
            self.alert_sink.alert(&record).await;
        }

        let mut history = self.history.lock().await;
        while history.len() >= self.config.history_size {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Run `f` under the operation's breaker, retrying recoverable failures
    /// up to `max_attempts` calls in total.
    pub async fn execute<T, F, Fut>(&self, operation: &str, max_attempts: u32, mut f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let breaker = self.circuit_breaker(operation).await;
        let mut attempt = 0;
        let mut recovering: Option<Uuid> = None;

        loop {
            attempt += 1;
            let error = match breaker.execute_async(|| f()).await {
                Ok(value) => {
                    if let Some(error_id) = recovering {
                        self.record_recovery_result(error_id, true).await;
                    }
                    return Ok(value);
                }
                Err(e) => AppError::from(e),
            };

            let context = ErrorContext::new(operation).allow_recovery(attempt < max_attempts);
            let outcome = self.handle_error(&error, context).await;
            if !outcome.retry {
                return Err(error);
            }
            recovering = Some(outcome.error_id);
            tracing::debug!("Retrying {} (attempt {})", operation, attempt + 1);
        }
    }

    /// Newest first
    pub async fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn metrics(&self) -> ErrorMetrics {
        let mut by_type = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut attempts = 0;
        let mut successes = 0;
        let mut recovery_ms = Vec::new();

        let history_len = {
            let history = self.history.lock().await;
            for record in history.iter() {
                *by_type.entry(record.error_type).or_insert(0) += 1;
                *by_category
                    .entry(format!("{:?}", record.category).to_lowercase())
                    .or_insert(0) += 1;
                *by_severity.entry(record.severity).or_insert(0) += 1;
                if record.recovery_attempted {
                    attempts += 1;
                }
                if record.recovery_successful {
                    successes += 1;
                }
                if let Some(ms) = record.recovery_time_ms {
                    recovery_ms.push(ms);
                }
            }
            history.len()
        };

        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut circuit_breakers = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            circuit_breakers.push(breaker.stats().await);
        }
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));
        let open_circuits = circuit_breakers
            .iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.name.clone())
            .collect();

        ErrorMetrics {
            total_errors: self.total_errors.load(Ordering::Relaxed),
            history_len,
            by_type,
            by_category,
            by_severity,
            recovery_attempts: attempts,
            recovery_successes: successes,
            recovery_success_rate: if attempts == 0 {
                1.0
            } else {
                successes as f64 / attempts as f64
            },
            average_recovery_time_ms: if recovery_ms.is_empty() {
                0.0
            } else {
                recovery_ms.iter().sum::<f64>() / recovery_ms.len() as f64
            },
            open_circuits,
            circuit_breakers,
        }
    }

    pub async fn health(&self) -> ComponentHealth {
        let metrics = self.metrics().await;
        let health = if metrics.open_circuits.is_empty() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded(format!(
                "open circuits: {}",
                metrics.open_circuits.join(", ")
            ))
        };

        health
            .with_metric("total_errors", metrics.total_errors)
            .with_metric("recovery_success_rate", metrics.recovery_success_rate)
            .with_metric("open_circuits", metrics.open_circuits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<ErrorType>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn alert(&self, record: &ErrorRecord) {
            self.alerts.lock().await.push(record.error_type);
        }
    }

    fn config() -> ErrorHandlerConfig {
        ErrorHandlerConfig {
            history_size: 3,
            failure_threshold: 2,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_strategy_waits_delay() {
        let handler = ErrorHandler::new(config());
        let started = Instant::now();
        let outcome = handler
            .handle_error(
                &AppError::Network("reset".into()),
                ErrorContext::new("send"),
            )
            .await;

        assert!(outcome.retry);
        assert_eq!(outcome.error_type, ErrorType::NetworkError);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        let started = Instant::now();
        let outcome = handler
            .handle_error(
                &AppError::Timeout("handler".into()),
                ErrorContext::new("task").with_retry_delay(Duration::from_secs(7)),
            )
            .await;
        assert!(outcome.retry);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_counts_as_successful_only_when_reported() {
        let handler = ErrorHandler::new(config());
        let first = handler
            .handle_error(&AppError::Network("reset".into()), ErrorContext::new("send"))
            .await;
        let second = handler
            .handle_error(&AppError::Network("reset".into()), ErrorContext::new("send"))
            .await;

        let metrics = handler.metrics().await;
        assert_eq!(metrics.recovery_attempts, 2);
        assert_eq!(metrics.recovery_successes, 0);
        assert_eq!(metrics.recovery_success_rate, 0.0);

        handler.record_recovery_result(first.error_id, true).await;
        handler.record_recovery_result(second.error_id, false).await;
        let metrics = handler.metrics().await;
        assert_eq!(metrics.recovery_successes, 1);
        assert_eq!(metrics.recovery_success_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_and_disallowed() {
        let handler = ErrorHandler::new(config());
        let outcome = handler
            .handle_error(&AppError::Auth("expired".into()), ErrorContext::new("connect"))
            .await;
        assert!(!outcome.retry);

        let outcome = handler
            .handle_error(
                &AppError::Timeout("handler".into()),
                ErrorContext::new("task").allow_recovery(false),
            )
            .await;
        assert!(!outcome.retry);
        assert!(outcome.recovery_time.is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_alerts_critical() {
        let sink = Arc::new(RecordingSink::default());
        let handler = ErrorHandler::with_alert_sink(config(), sink.clone());

        handler
            .record_error(&AppError::Internal("a".into()), ErrorContext::new("op"))
            .await;
        for i in 0..4 {
            handler
                .record_error(&AppError::Validation(format!("bad {}", i)), ErrorContext::new("op"))
                .await;
        }

        let recent = handler.recent_errors(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "Validation error: bad 3");
        assert_eq!(sink.alerts.lock().await.as_slice(), &[ErrorType::SystemError]);

        let metrics = handler.metrics().await;
        assert_eq!(metrics.total_errors, 5);
        assert_eq!(metrics.by_type.get(&ErrorType::ValidationError), Some(&3));
        assert_eq!(metrics.recovery_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_then_succeeds() {
        let handler = ErrorHandler::new(config());
        let calls = AtomicUsize::new(0);

        let value = handler
            .execute("fetch", 3, || async {
                if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(AppError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let metrics = handler.metrics().await;
        assert_eq!(metrics.recovery_successes, 1);
        assert!(metrics.average_recovery_time_ms >= 2000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_opens_breaker() {
        let handler = ErrorHandler::new(config());
        let calls = AtomicUsize::new(0);

        let result: AppResult<()> = handler
            .execute("db", 5, || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(AppError::Timeout("slow".into()))
            })
            .await;

        // two failures open the breaker, the third attempt is rejected
        assert!(matches!(result, Err(AppError::CircuitOpen { .. })));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let metrics = handler.metrics().await;
        assert_eq!(metrics.open_circuits, vec!["db".to_string()]);
        assert_eq!(
            handler.health().await.status,
            crate::health::HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_register_strategy() {
        let handler = ErrorHandler::new(config());
        handler
            .register_strategy(ErrorType::NetworkError, RecoveryStrategy::Unrecoverable)
            .await;
        let outcome = handler
            .handle_error(&AppError::Network("down".into()), ErrorContext::new("op"))
            .await;
        assert!(!outcome.retry);
    }
}
