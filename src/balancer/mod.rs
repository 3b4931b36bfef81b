//! Health-aware load balancer over the backend server fleet.
//!
//! Each server carries a sliding stats window and its own circuit breaker.
//! Selection filters to routable servers under their connection cap whose
//! breaker admits a call, then defers to the configured strategy.

mod health;
mod server;
mod strategy;

pub use health::{HealthProbe, HttpHealthProbe, ProbeReport};
pub use server::{ServerInfo, ServerState};
pub use strategy::{build_strategy, LoadBalancingStrategy, SelectionContext, SelectionStrategy};

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::{LoadBalancerConfig, ServerConfig};
use crate::error::{AppError, AppResult};
use crate::health::ComponentHealth;
use server::StatsWindow;

struct ServerEntry {
    info: ServerInfo,
    window: StatsWindow,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub info: ServerInfo,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub total_servers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub maintenance: usize,
    pub offline: usize,
    pub open_circuits: Vec<String>,
    pub total_connections: usize,
    pub total_routed: u64,
    pub total_rejected: u64,
    pub servers: Vec<ServerStatus>,
}

impl BalancerStats {
    /// Servers a request could be routed to right now
    pub fn available_servers(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.info.state.is_routable() && s.circuit != CircuitState::Open)
            .count()
    }
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    servers: RwLock<BTreeMap<String, ServerEntry>>,
    strategy: Box<dyn SelectionStrategy>,
    probe: Option<Arc<dyn HealthProbe>>,
    total_routed: AtomicU64,
    total_rejected: AtomicU64,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        let strategy = build_strategy(config.strategy, config.virtual_nodes);
        let servers: BTreeMap<String, ServerEntry> = config
            .servers
            .iter()
            .map(|s| (s.server_id.clone(), Self::entry(&config, s)))
            .collect();

        let infos: Vec<ServerInfo> = servers.values().map(|e| e.info.clone()).collect();
        strategy.rebuild(&infos);

        Self {
            config,
            servers: RwLock::new(servers),
            strategy,
            probe: None,
            total_routed: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    fn entry(config: &LoadBalancerConfig, server: &ServerConfig) -> ServerEntry {
        ServerEntry {
            info: ServerInfo::from_config(server),
            window: StatsWindow::new(config.stats_window_size, config.stats_window()),
            breaker: Arc::new(CircuitBreaker::new(
                format!("server:{}", server.server_id),
                CircuitBreakerConfig {
                    failure_threshold: config.circuit_breaker_failure_threshold,
                    recovery_timeout: config.recovery_timeout(),
                    half_open_max_calls: config.half_open_max_calls,
                },
            )),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy.kind()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Pick a server for a new connection.
    ///
    /// A server whose breaker loses the race for its last half-open slot is
    /// dropped and selection runs again over the rest.
    pub async fn select_server(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
        tags: &[String],
    ) -> AppResult<ServerInfo> {
        let ctx = SelectionContext {
            session_id,
            user_id,
        };
        let mut excluded: HashSet<String> = HashSet::new();

        loop {
            let candidates: Vec<(ServerInfo, Arc<CircuitBreaker>)> = {
                let servers = self.servers.read().await;
                servers
                    .values()
                    .filter(|e| !excluded.contains(&e.info.server_id))
                    .filter(|e| e.info.state.is_routable())
                    .filter(|e| e.info.has_capacity())
                    .filter(|e| e.info.has_tags(tags))
                    .map(|e| (e.info.clone(), e.breaker.clone()))
                    .collect()
            };

            let mut eligible = Vec::with_capacity(candidates.len());
            for (info, breaker) in candidates {
                if breaker.is_call_permitted().await {
                    eligible.push((info, breaker));
                }
            }

            if eligible.is_empty() {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(AppError::NoServerAvailable(if tags.is_empty() {
                    "no healthy server with capacity".to_string()
                } else {
                    format!("no healthy server with capacity and tags {:?}", tags)
                }));
            }

            let infos: Vec<ServerInfo> = eligible.iter().map(|(info, _)| info.clone()).collect();
            let idx = self
                .strategy
                .select(&infos, &ctx)
                .filter(|i| *i < eligible.len())
                .unwrap_or(0);
            let (info, breaker) = &eligible[idx];

            if breaker.allow_request().await {
                self.total_routed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Selected server {} via {} for session {:?}",
                    info.server_id,
                    self.strategy.kind(),
                    session_id
                );
                return Ok(info.clone());
            }
            excluded.insert(info.server_id.clone());
        }
    }

    async fn with_entry<R>(&self, server_id: &str, f: impl FnOnce(&mut ServerEntry) -> R) -> Option<R> {
        let mut servers = self.servers.write().await;
        let result = servers.get_mut(server_id).map(f);
        if result.is_none() {
            tracing::debug!("Ignoring update for unknown server {}", server_id);
        }
        result
    }

    pub async fn record_connection(&self, server_id: &str) {
        self.with_entry(server_id, |e| e.info.current_connections += 1)
            .await;
    }

    pub async fn record_disconnection(&self, server_id: &str) {
        self.with_entry(server_id, |e| {
            e.info.current_connections = e.info.current_connections.saturating_sub(1)
        })
        .await;
    }

    pub async fn record_response_time(&self, server_id: &str, millis: f64) {
        self.with_entry(server_id, |e| e.window.record_latency(millis))
            .await;
    }

    pub async fn record_success(&self, server_id: &str) {
        let breaker = self
            .with_entry(server_id, |e| {
                e.window.record_outcome(true);
                e.breaker.clone()
            })
            .await;
        if let Some(breaker) = breaker {
            breaker.record_success().await;
        }
    }

    pub async fn record_error(&self, server_id: &str) {
        let breaker = self
            .with_entry(server_id, |e| {
                e.window.record_outcome(false);
                e.breaker.clone()
            })
            .await;
        if let Some(breaker) = breaker {
            breaker.record_failure().await;
        }
    }

    /// Undo a selection whose connection was never opened, e.g. because
    /// the local pool refused it. Hands back a half-open trial slot.
    pub async fn release_selection(&self, server_id: &str) {
        if let Some(breaker) = self.circuit_breaker(server_id).await {
            breaker.release_trial().await;
        }
    }

    fn evaluate(&self, error_rate: f64, response_time_ms: f64) -> ServerState {
        if error_rate >= self.config.unhealthy_error_rate {
            ServerState::Unhealthy
        } else if error_rate > self.config.degraded_error_rate
            || response_time_ms > self.config.degraded_response_time_ms
        {
            ServerState::Degraded
        } else {
            ServerState::Healthy
        }
    }

    /// One health-check pass over every server not under operator control.
    ///
    /// Never closes a breaker itself; an open breaker only recovers through
    /// its own half-open trial.
    pub async fn run_health_checks(&self) {
        let targets: Vec<ServerInfo> = {
            let servers = self.servers.read().await;
            servers
                .values()
                .filter(|e| !e.info.state.is_operator_controlled())
                .map(|e| e.info.clone())
                .collect()
        };

        if let Some(probe) = &self.probe {
            let timeout = self.config.health_check_timeout();
            let probes = targets.iter().map(|server| {
                let probe = probe.clone();
                async move {
                    let started = Instant::now();
                    let result = match tokio::time::timeout(timeout, probe.probe(server)).await {
                        Ok(result) => result,
                        Err(_) => Err(AppError::Timeout(format!(
                            "health probe for {} after {:?}",
                            server.server_id, timeout
                        ))),
                    };
                    (server.server_id.clone(), started.elapsed(), result)
                }
            });

            for (server_id, elapsed, result) in join_all(probes).await {
                match result {
                    Ok(report) => {
                        self.with_entry(&server_id, |e| {
                            e.window.record_latency(elapsed.as_secs_f64() * 1000.0);
                            if let Some(cpu) = report.cpu_usage {
                                e.info.cpu_usage = cpu;
                            }
                            if let Some(memory) = report.memory_usage {
                                e.info.memory_usage = memory;
                            }
                        })
                        .await;
                        self.record_success(&server_id).await;
                    }
                    Err(e) => {
                        tracing::warn!("Health probe failed for {}: {}", server_id, e);
                        self.record_error(&server_id).await;
                    }
                }
            }
        }

        let now = Instant::now();
        let checked_at = chrono::Utc::now();
        let mut servers = self.servers.write().await;
        for entry in servers.values_mut() {
            if entry.info.state.is_operator_controlled() {
                continue;
            }
            entry.window.prune(now);
            entry.info.error_rate = entry.window.error_rate();
            entry.info.response_time_ms = entry.window.average_latency();
            entry.info.last_health_check = Some(checked_at);

            let state = self.evaluate(entry.info.error_rate, entry.info.response_time_ms);
            if state != entry.info.state {
                tracing::info!(
                    "Server {} {} -> {} (error rate {:.2}, response time {:.0}ms)",
                    entry.info.server_id,
                    entry.info.state,
                    state,
                    entry.info.error_rate,
                    entry.info.response_time_ms
                );
                entry.info.state = state;
            }
        }
    }

    pub fn start_health_checks(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        let period = balancer.config.health_check_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => balancer.run_health_checks().await,
                }
            }
            tracing::debug!("Load balancer health checks stopped");
        })
    }

    async fn rebuild_strategy(&self) {
        let infos: Vec<ServerInfo> = self
            .servers
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        self.strategy.rebuild(&infos);
    }

    pub async fn add_server(&self, server: ServerConfig) -> AppResult<()> {
        {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&server.server_id) {
                return Err(AppError::Validation(format!(
                    "server {} already registered",
                    server.server_id
                )));
            }
            servers.insert(server.server_id.clone(), Self::entry(&self.config, &server));
        }
        self.rebuild_strategy().await;
        tracing::info!("Added server {} ({}:{})", server.server_id, server.host, server.port);
        Ok(())
    }

    pub async fn remove_server(&self, server_id: &str) -> Option<ServerInfo> {
        let removed = self.servers.write().await.remove(server_id)?;
        self.rebuild_strategy().await;
        tracing::info!("Removed server {}", server_id);
        Some(removed.info)
    }

    pub async fn set_server_state(&self, server_id: &str, state: ServerState) -> AppResult<()> {
        self.with_entry(server_id, |e| {
            tracing::info!("Server {} set to {} by operator", server_id, state);
            e.info.state = state;
        })
        .await
        .ok_or_else(|| AppError::NotFound(format!("server {}", server_id)))
    }

    pub async fn update_server_load(&self, server_id: &str, cpu_usage: f64, memory_usage: f64) -> AppResult<()> {
        self.with_entry(server_id, |e| {
            e.info.cpu_usage = cpu_usage.clamp(0.0, 1.0);
            e.info.memory_usage = memory_usage.clamp(0.0, 1.0);
        })
        .await
        .ok_or_else(|| AppError::NotFound(format!("server {}", server_id)))
    }

    pub async fn server(&self, server_id: &str) -> Option<ServerInfo> {
        self.servers.read().await.get(server_id).map(|e| e.info.clone())
    }

    pub async fn circuit_breaker(&self, server_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.servers.read().await.get(server_id).map(|e| e.breaker.clone())
    }

    pub async fn stats(&self) -> BalancerStats {
        let entries: Vec<(ServerInfo, Arc<CircuitBreaker>)> = self
            .servers
            .read()
            .await
            .values()
            .map(|e| (e.info.clone(), e.breaker.clone()))
            .collect();

        let mut servers = Vec::with_capacity(entries.len());
        for (info, breaker) in entries {
            servers.push(ServerStatus {
                info,
                circuit: breaker.state().await,
            });
        }

        let count = |state: ServerState| servers.iter().filter(|s| s.info.state == state).count();

        BalancerStats {
            strategy: self.strategy.kind(),
            total_servers: servers.len(),
            healthy: count(ServerState::Healthy),
            degraded: count(ServerState::Degraded),
            unhealthy: count(ServerState::Unhealthy),
            maintenance: count(ServerState::Maintenance),
            offline: count(ServerState::Offline),
            open_circuits: servers
                .iter()
                .filter(|s| s.circuit == CircuitState::Open)
                .map(|s| s.info.server_id.clone())
                .collect(),
            total_connections: servers.iter().map(|s| s.info.current_connections).sum(),
            total_routed: self.total_routed.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            servers,
        }
    }

    pub async fn health(&self) -> ComponentHealth {
        let stats = self.stats().await;
        let available = stats.available_servers();

        let health = if stats.total_servers == 0 {
            ComponentHealth::healthy()
        } else if available == 0 {
            ComponentHealth::critical("no backend server available")
        } else if available * 2 < stats.total_servers || !stats.open_circuits.is_empty() {
            ComponentHealth::degraded(format!(
                "{} of {} servers available",
                available, stats.total_servers
            ))
        } else {
            ComponentHealth::healthy()
        };

        health
            .with_metric("servers", stats.total_servers)
            .with_metric("available", available)
            .with_metric("connections", stats.total_connections)
            .with_metric("strategy", stats.strategy.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn config(strategy: LoadBalancingStrategy, servers: &[&str]) -> LoadBalancerConfig {
        LoadBalancerConfig {
            strategy,
            servers: servers
                .iter()
                .map(|id| {
                    let mut s = ServerConfig::new(*id, "127.0.0.1", 9000);
                    s.max_connections = 2;
                    s
                })
                .collect(),
            circuit_breaker_failure_threshold: 2,
            circuit_breaker_recovery_timeout_seconds: 10.0,
            half_open_max_calls: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_least_connections_spreads_load() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::LeastConnections, &["a", "b"]));

        let first = lb.select_server(Some("s1"), None, &[]).await.unwrap();
        lb.record_connection(&first.server_id).await;
        let second = lb.select_server(Some("s2"), None, &[]).await.unwrap();
        assert_ne!(first.server_id, second.server_id);
    }

    #[tokio::test]
    async fn test_excludes_full_server() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::RoundRobin, &["a", "b"]));
        lb.record_connection("a").await;
        lb.record_connection("a").await;

        for i in 0..10 {
            let picked = lb.select_server(Some(&format!("s{}", i)), None, &[]).await.unwrap();
            assert_eq!(picked.server_id, "b");
        }

        lb.record_connection("b").await;
        lb.record_connection("b").await;
        assert!(matches!(
            lb.select_server(None, None, &[]).await,
            Err(AppError::NoServerAvailable(_))
        ));
        assert_eq!(lb.stats().await.total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excludes_open_circuit_even_if_only_healthy() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::RoundRobin, &["only"]));
        lb.record_error("only").await;
        lb.record_error("only").await;

        // state is still healthy, the breaker alone excludes it
        assert_eq!(lb.server("only").await.unwrap().state, ServerState::Healthy);
        assert!(lb.select_server(None, None, &[]).await.is_err());
        assert_eq!(lb.health().await.status, crate::health::HealthStatus::Critical);

        // half-open admits exactly one trial
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(lb.select_server(None, None, &[]).await.is_ok());
        assert!(lb.select_server(None, None, &[]).await.is_err());

        lb.record_success("only").await;
        assert!(lb.select_server(None, None, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_tags_and_operator_state() {
        let mut cfg = config(LoadBalancingStrategy::RoundRobin, &["a"]);
        let mut gpu = ServerConfig::new("gpu", "127.0.0.2", 9000);
        gpu.tags = vec!["gpu".into()];
        cfg.servers.push(gpu);
        let lb = LoadBalancer::new(cfg);

        let tags = vec!["gpu".to_string()];
        for _ in 0..4 {
            assert_eq!(lb.select_server(None, None, &tags).await.unwrap().server_id, "gpu");
        }

        lb.set_server_state("gpu", ServerState::Maintenance).await.unwrap();
        assert!(lb.select_server(None, None, &tags).await.is_err());
        assert!(matches!(
            lb.set_server_state("missing", ServerState::Offline).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_flips_state_without_closing_breaker() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::RoundRobin, &["a"]));
        for _ in 0..3 {
            lb.record_error("a").await;
        }
        lb.run_health_checks().await;
        let info = lb.server("a").await.unwrap();
        assert_eq!(info.state, ServerState::Unhealthy);
        assert_eq!(info.error_rate, 1.0);

        // samples age out of the window; the breaker stays open regardless
        tokio::time::advance(Duration::from_secs(61)).await;
        lb.run_health_checks().await;
        assert_eq!(lb.server("a").await.unwrap().state, ServerState::Healthy);
        let breaker = lb.circuit_breaker("a").await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_slow_server_degraded() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::RoundRobin, &["a"]));
        lb.record_response_time("a", 2500.0).await;
        lb.record_success("a").await;
        lb.run_health_checks().await;
        assert_eq!(lb.server("a").await.unwrap().state, ServerState::Degraded);
        // degraded servers stay routable
        assert!(lb.select_server(None, None, &[]).await.is_ok());
    }

    struct ScriptedProbe {
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, server: &ServerInfo) -> AppResult<ProbeReport> {
            if self.failing.lock().await.contains(&server.server_id) {
                Err(AppError::Network("refused".into()))
            } else {
                Ok(ProbeReport {
                    cpu_usage: Some(0.25),
                    memory_usage: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn test_active_probe() {
        let probe = Arc::new(ScriptedProbe {
            failing: Mutex::new(["b".to_string()].into_iter().collect()),
        });
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::RoundRobin, &["a", "b"]))
            .with_probe(probe);

        lb.run_health_checks().await;
        assert_eq!(lb.server("a").await.unwrap().cpu_usage, 0.25);
        assert_eq!(lb.server("b").await.unwrap().state, ServerState::Unhealthy);

        for _ in 0..4 {
            assert_eq!(lb.select_server(None, None, &[]).await.unwrap().server_id, "a");
        }
    }

    #[tokio::test]
    async fn test_add_remove_server() {
        let lb = LoadBalancer::new(config(LoadBalancingStrategy::ConsistentHash, &["a"]));
        lb.add_server(ServerConfig::new("b", "127.0.0.3", 9000)).await.unwrap();
        assert!(lb.add_server(ServerConfig::new("b", "127.0.0.3", 9000)).await.is_err());
        assert_eq!(lb.stats().await.total_servers, 2);

        assert!(lb.remove_server("a").await.is_some());
        let picked = lb.select_server(Some("s"), Some("u"), &[]).await.unwrap();
        assert_eq!(picked.server_id, "b");
    }
}
