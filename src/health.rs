/// Component health reporting and aggregation
///
/// Every component reports a `ComponentHealth`; the service folds them into
/// one `SystemHealth` where the worst status wins.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status of a component or of the whole system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Component health information
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: i64,
    pub metrics: HashMap<String, serde_json::Value>,
}

impl ComponentHealth {
    fn with_status(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check: chrono::Utc::now().timestamp(),
            metrics: HashMap::new(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(HealthStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, Some(message.into()))
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Critical, Some(message.into()))
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}

/// System-wide health check
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub timestamp: i64,
}

impl SystemHealth {
    /// Any critical component makes the system critical; any degraded one
    /// makes it at least degraded.
    pub fn aggregate(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            components,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.status == HealthStatus::Critical
    }
}
