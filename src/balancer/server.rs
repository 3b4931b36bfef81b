use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Healthy,
    Degraded,
    Unhealthy,
    /// Set by an operator; skipped by health checks
    Maintenance,
    /// Set by an operator; skipped by health checks
    Offline,
}

impl ServerState {
    pub fn is_routable(&self) -> bool {
        matches!(self, ServerState::Healthy | ServerState::Degraded)
    }

    pub fn is_operator_controlled(&self) -> bool {
        matches!(self, ServerState::Maintenance | ServerState::Offline)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Healthy => "healthy",
            ServerState::Degraded => "degraded",
            ServerState::Unhealthy => "unhealthy",
            ServerState::Maintenance => "maintenance",
            ServerState::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(ServerState::Healthy),
            "degraded" => Ok(ServerState::Degraded),
            "unhealthy" => Ok(ServerState::Unhealthy),
            "maintenance" => Ok(ServerState::Maintenance),
            "offline" => Ok(ServerState::Offline),
            other => Err(format!("Unknown server state '{}'", other)),
        }
    }
}

/// Routing target as seen by the strategies
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: usize,
    pub current_connections: usize,
    /// 0.0 - 1.0
    pub cpu_usage: f64,
    /// 0.0 - 1.0
    pub memory_usage: f64,
    /// Average over the stats window, in milliseconds
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub state: ServerState,
    pub tags: BTreeSet<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServerInfo {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            server_id: config.server_id.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: config.weight,
            max_connections: config.max_connections,
            current_connections: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            response_time_ms: 0.0,
            error_rate: 0.0,
            state: ServerState::Healthy,
            tags: config.tags.iter().cloned().collect(),
            last_health_check: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_connections < self.max_connections
    }

    /// Weighted CPU/memory load used by least-load
    pub fn load_score(&self) -> f64 {
        self.cpu_usage * 0.6 + self.memory_usage * 0.4
    }

    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

/// Sliding window of request outcomes and latencies, bounded by both count
/// and age.
#[derive(Debug)]
pub(crate) struct StatsWindow {
    outcomes: VecDeque<(Instant, bool)>,
    latencies: VecDeque<(Instant, f64)>,
    max_samples: usize,
    max_age: Duration,
}

impl StatsWindow {
    pub(crate) fn new(max_samples: usize, max_age: Duration) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(max_samples),
            latencies: VecDeque::with_capacity(max_samples),
            max_samples,
            max_age,
        }
    }

    fn push<T>(queue: &mut VecDeque<(Instant, T)>, max: usize, value: T) {
        while queue.len() >= max {
            queue.pop_front();
        }
        queue.push_back((Instant::now(), value));
    }

    pub(crate) fn record_outcome(&mut self, success: bool) {
        Self::push(&mut self.outcomes, self.max_samples, success);
    }

    pub(crate) fn record_latency(&mut self, millis: f64) {
        Self::push(&mut self.latencies, self.max_samples, millis);
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        let max_age = self.max_age;
        while matches!(self.outcomes.front(), Some((at, _)) if now.duration_since(*at) > max_age) {
            self.outcomes.pop_front();
        }
        while matches!(self.latencies.front(), Some((at, _)) if now.duration_since(*at) > max_age) {
            self.latencies.pop_front();
        }
    }

    pub(crate) fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub(crate) fn average_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().map(|(_, ms)| ms).sum::<f64>() / self.latencies.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_bounds() {
        let mut window = StatsWindow::new(4, Duration::from_secs(10));
        window.record_outcome(false);
        window.record_outcome(false);
        for _ in 0..2 {
            window.record_outcome(true);
        }
        assert_eq!(window.error_rate(), 0.5);

        // count bound drops the oldest failure
        window.record_outcome(true);
        assert_eq!(window.error_rate(), 0.25);

        window.record_latency(100.0);
        window.record_latency(300.0);
        assert_eq!(window.average_latency(), 200.0);

        tokio::time::advance(Duration::from_secs(11)).await;
        window.prune(Instant::now());
        assert_eq!(window.error_rate(), 0.0);
        assert_eq!(window.average_latency(), 0.0);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("Maintenance".parse::<ServerState>(), Ok(ServerState::Maintenance));
        assert!("sleepy".parse::<ServerState>().is_err());
        assert!(ServerState::Degraded.is_routable());
        assert!(!ServerState::Unhealthy.is_routable());
    }
}
