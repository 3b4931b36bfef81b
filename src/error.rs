use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::processor::Priority;

#[derive(Error, Debug)]
pub enum AppError {
    // Capacity
    #[error("Queue full: {priority} queue is at capacity ({capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("Connection pool exhausted: {max_connections} connections in use")]
    PoolExhausted { max_connections: usize },

    #[error("Max workers reached: {0}")]
    MaxWorkersReached(usize),

    // Transient
    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Structural
    #[error("No handler registered for message type '{0}'")]
    NoHandler(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Unavailable
    #[error("Circuit open for '{name}', retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("No server available: {0}")]
    NoServerAvailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse grouping that drives how callers react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Queue full, pool exhausted, max workers. Surfaced immediately.
    Capacity,
    /// Timeouts, network and rate limits. Retried locally.
    Transient,
    /// Bad input or configuration. Never retried.
    Structural,
    /// Circuit open or no server. Callers should back off.
    Unavailable,
    Internal,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::QueueFull { .. }
            | AppError::PoolExhausted { .. }
            | AppError::MaxWorkersReached(_) => ErrorCategory::Capacity,
            AppError::Timeout(_)
            | AppError::Network(_)
            | AppError::RateLimited(_)
            | AppError::ResourceExhausted(_)
            | AppError::Http(_)
            | AppError::Redis(_) => ErrorCategory::Transient,
            AppError::NoHandler(_)
            | AppError::Validation(_)
            | AppError::Auth(_)
            | AppError::Serialization(_)
            | AppError::NotFound(_)
            | AppError::Config(_) => ErrorCategory::Structural,
            AppError::CircuitOpen { .. } | AppError::NoServerAvailable(_) => {
                ErrorCategory::Unavailable
            }
            AppError::Internal(_) | AppError::Io(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Backpressure hint for callers that map errors onto a retry-after signal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            AppError::QueueFull { .. }
            | AppError::PoolExhausted { .. }
            | AppError::MaxWorkersReached(_)
            | AppError::RateLimited(_) => Some(Duration::from_secs(1)),
            AppError::NoServerAvailable(_) => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}: {:?}", status, self);
        }

        let mut response_builder = HttpResponse::build(status);
        if let Some(retry_after) = self.retry_after() {
            response_builder.insert_header((
                header::RETRY_AFTER,
                retry_after.as_secs().max(1).to_string(),
            ));
        }

        response_builder.json(ErrorResponse {
            detail: self.to_string(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::QueueFull { .. }
            | AppError::PoolExhausted { .. }
            | AppError::MaxWorkersReached(_)
            | AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::CircuitOpen { .. } | AppError::NoServerAvailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::NoHandler(_) | AppError::Validation(_) | AppError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Network(_) | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::ResourceExhausted(_)
            | AppError::Redis(_)
            | AppError::Config(_)
            | AppError::Internal(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<deadpool_redis::PoolError> for AppError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        AppError::Redis(err.to_string())
    }
}

impl From<deadpool_redis::CreatePoolError> for AppError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        AppError::Config(format!("Invalid Redis configuration: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let full = AppError::QueueFull {
            priority: Priority::Low,
            capacity: 10,
        };
        assert_eq!(full.category(), ErrorCategory::Capacity);
        assert!(!full.is_retryable());

        assert!(AppError::Timeout("handler".into()).is_retryable());
        assert_eq!(
            AppError::NoHandler("chat".into()).category(),
            ErrorCategory::Structural
        );
        assert_eq!(
            AppError::CircuitOpen {
                name: "redis".into(),
                retry_after: Duration::from_secs(3),
            }
            .category(),
            ErrorCategory::Unavailable
        );
    }

    #[test]
    fn test_backpressure_mapping() {
        let err = AppError::CircuitOpen {
            name: "server-1".into(),
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));

        let resp = err.error_response();
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &header::HeaderValue::from_static("12")
        );

        let full = AppError::PoolExhausted {
            max_connections: 4,
        };
        assert_eq!(full.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(AppError::Validation("bad".into()).retry_after().is_none());
    }
}
