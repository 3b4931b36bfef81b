use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::ErrorHandlerConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ConnectionTimeout,
    AuthFailure,
    SerializationError,
    NetworkError,
    RateLimit,
    ResourceExhaustion,
    ValidationError,
    SystemError,
    ServiceUnavailable,
}

impl ErrorType {
    pub const ALL: [ErrorType; 9] = [
        ErrorType::ConnectionTimeout,
        ErrorType::AuthFailure,
        ErrorType::SerializationError,
        ErrorType::NetworkError,
        ErrorType::RateLimit,
        ErrorType::ResourceExhaustion,
        ErrorType::ValidationError,
        ErrorType::SystemError,
        ErrorType::ServiceUnavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ConnectionTimeout => "connection_timeout",
            ErrorType::AuthFailure => "auth_failure",
            ErrorType::SerializationError => "serialization_error",
            ErrorType::NetworkError => "network_error",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::ResourceExhaustion => "resource_exhaustion",
            ErrorType::ValidationError => "validation_error",
            ErrorType::SystemError => "system_error",
            ErrorType::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Map an error onto its type and severity
pub fn classify(error: &AppError) -> (ErrorType, Severity) {
    match error {
        AppError::Timeout(_) => (ErrorType::ConnectionTimeout, Severity::Medium),
        AppError::Network(_) | AppError::Http(_) | AppError::Redis(_) => {
            (ErrorType::NetworkError, Severity::Medium)
        }
        AppError::RateLimited(_) => (ErrorType::RateLimit, Severity::Low),
        AppError::ResourceExhausted(_)
        | AppError::QueueFull { .. }
        | AppError::PoolExhausted { .. }
        | AppError::MaxWorkersReached(_) => (ErrorType::ResourceExhaustion, Severity::High),
        AppError::Auth(_) => (ErrorType::AuthFailure, Severity::High),
        AppError::Serialization(_) => (ErrorType::SerializationError, Severity::Medium),
        AppError::Validation(_) | AppError::NoHandler(_) | AppError::NotFound(_) => {
            (ErrorType::ValidationError, Severity::Low)
        }
        AppError::CircuitOpen { .. } | AppError::NoServerAvailable(_) => {
            (ErrorType::ServiceUnavailable, Severity::High)
        }
        AppError::Config(_) | AppError::Internal(_) | AppError::Io(_) => {
            (ErrorType::SystemError, Severity::Critical)
        }
    }
}

/// What to do about one error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Wait, then let the caller retry
    RetryAfter(Duration),
    /// Report failure immediately
    Unrecoverable,
}

impl RecoveryStrategy {
    /// Delay before the retry, or `None` when the error is final. A caller
    /// supplied delay replaces the strategy's own.
    pub fn retry_delay(&self, requested: Option<Duration>) -> Option<Duration> {
        match self {
            RecoveryStrategy::RetryAfter(delay) => Some(requested.unwrap_or(*delay)),
            RecoveryStrategy::Unrecoverable => None,
        }
    }

    pub fn default_for(error_type: ErrorType, config: &ErrorHandlerConfig) -> Self {
        let secs = match error_type {
            ErrorType::ConnectionTimeout => config.connection_retry_delay_seconds,
            ErrorType::NetworkError => config.network_retry_delay_seconds,
            ErrorType::RateLimit => config.rate_limit_retry_delay_seconds,
            ErrorType::ResourceExhaustion => config.resource_retry_delay_seconds,
            ErrorType::AuthFailure
            | ErrorType::SerializationError
            | ErrorType::ValidationError
            | ErrorType::SystemError
            | ErrorType::ServiceUnavailable => return RecoveryStrategy::Unrecoverable,
        };
        RecoveryStrategy::RetryAfter(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&AppError::Timeout("handler".into())),
            (ErrorType::ConnectionTimeout, Severity::Medium)
        );
        assert_eq!(
            classify(&AppError::Internal("boom".into())).1,
            Severity::Critical
        );
        assert_eq!(
            classify(&AppError::NoServerAvailable("all open".into())).0,
            ErrorType::ServiceUnavailable
        );
    }

    #[test]
    fn test_default_strategies() {
        let config = ErrorHandlerConfig::default();
        assert_eq!(
            RecoveryStrategy::default_for(ErrorType::NetworkError, &config),
            RecoveryStrategy::RetryAfter(Duration::from_secs(2))
        );
        for unrecoverable in [
            ErrorType::AuthFailure,
            ErrorType::ValidationError,
            ErrorType::SystemError,
            ErrorType::ServiceUnavailable,
        ] {
            assert_eq!(
                RecoveryStrategy::default_for(unrecoverable, &config),
                RecoveryStrategy::Unrecoverable
            );
        }
    }

    #[test]
    fn test_requested_delay_overrides() {
        let strategy = RecoveryStrategy::RetryAfter(Duration::from_secs(5));
        assert_eq!(strategy.retry_delay(None), Some(Duration::from_secs(5)));
        assert_eq!(
            strategy.retry_delay(Some(Duration::from_millis(10))),
            Some(Duration::from_millis(10))
        );
        assert_eq!(RecoveryStrategy::Unrecoverable.retry_delay(Some(Duration::ZERO)), None);
    }
}
