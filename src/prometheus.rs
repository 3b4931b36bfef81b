/// Prometheus Metrics Exporter
///
/// Renders a `ServiceMetrics` snapshot and the aggregated health in the
/// Prometheus text exposition format.
use std::fmt::{Display, Write};

use crate::circuit_breaker::CircuitState;
use crate::health::{HealthStatus, SystemHealth};
use crate::service::ServiceMetrics;

const PREFIX: &str = "realtime";

pub struct PrometheusExporter<'a> {
    metrics: &'a ServiceMetrics,
    health: Option<&'a SystemHealth>,
}

fn health_value(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Critical => 2,
    }
}

fn circuit_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) -> std::fmt::Result {
    writeln!(out, "# HELP {}_{} {}", PREFIX, name, help)?;
    writeln!(out, "# TYPE {}_{} {}", PREFIX, name, kind)
}

/// One unlabeled sample with its HELP/TYPE lines
fn metric(
    out: &mut String,
    name: &str,
    help: &str,
    kind: &str,
    value: impl Display,
) -> std::fmt::Result {
    header(out, name, help, kind)?;
    writeln!(out, "{}_{} {}", PREFIX, name, value)?;
    writeln!(out)
}

fn sample(out: &mut String, name: &str, labels: &str, value: impl Display) -> std::fmt::Result {
    writeln!(out, "{}_{}{{{}}} {}", PREFIX, name, labels, value)
}

impl<'a> PrometheusExporter<'a> {
    pub fn new(metrics: &'a ServiceMetrics) -> Self {
        Self {
            metrics,
            health: None,
        }
    }

    pub fn with_health(mut self, health: &'a SystemHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Generate Prometheus metrics in text format
    pub fn export(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        let m = self.metrics;

        writeln!(&mut out, "# Realtime Service Metrics")?;
        writeln!(&mut out)?;

        // Connections
        metric(
            &mut out,
            "connections_active",
            "Live connections in the pool",
            "gauge",
            m.active_connections,
        )?;
        metric(
            &mut out,
            "connections_created_total",
            "Connections created since startup",
            "counter",
            m.pool.total_created,
        )?;
        metric(
            &mut out,
            "connections_reaped_total",
            "Connections removed by the reaper",
            "counter",
            m.pool.total_reaped,
        )?;
        metric(
            &mut out,
            "connections_evicted_total",
            "Idle connections evicted to admit new ones",
            "counter",
            m.pool.total_evicted,
        )?;
        metric(
            &mut out,
            "pool_utilization",
            "Pool size relative to its capacity",
            "gauge",
            m.pool.utilization,
        )?;

        // Processor
        header(&mut out, "queue_depth", "Queued tasks per priority", "gauge")?;
        for (priority, depth) in &m.processor.queue_depths {
            sample(&mut out, "queue_depth", &format!("priority=\"{}\"", priority), depth)?;
        }
        writeln!(&mut out)?;

        metric(
            &mut out,
            "tasks_processed_total",
            "Tasks completed successfully",
            "counter",
            m.processor.processed,
        )?;
        metric(
            &mut out,
            "tasks_failed_total",
            "Tasks that failed permanently",
            "counter",
            m.processor.failed,
        )?;
        metric(
            &mut out,
            "tasks_retried_total",
            "Task retries scheduled",
            "counter",
            m.processor.retried,
        )?;
        metric(
            &mut out,
            "tasks_dropped_total",
            "Tasks dropped for lack of a handler",
            "counter",
            m.processor.dropped,
        )?;
        metric(
            &mut out,
            "task_processing_time_ms",
            "Mean processing time of successful tasks",
            "gauge",
            m.processor.average_processing_time_ms,
        )?;
        metric(
            &mut out,
            "throughput",
            "Successful tasks per second",
            "gauge",
            m.throughput,
        )?;
        metric(
            &mut out,
            "workers",
            "Running worker tasks",
            "gauge",
            m.processor.workers,
        )?;
        metric(
            &mut out,
            "worker_utilization",
            "Fraction of workers busy",
            "gauge",
            m.worker_utilization,
        )?;

        // Cache
        metric(
            &mut out,
            "cache_hit_rate",
            "Local cache hit rate",
            "gauge",
            m.cache_hit_rate,
        )?;
        metric(
            &mut out,
            "cache_memory_bytes",
            "Bytes held by the local cache tier",
            "gauge",
            m.cache.memory_bytes,
        )?;
        header(&mut out, "cache_requests_total", "Cache lookups by type and result", "counter")?;
        for (cache_type, stats) in &m.cache.per_type {
            sample(
                &mut out,
                "cache_requests_total",
                &format!("type=\"{}\",result=\"hit\"", cache_type),
                stats.hits,
            )?;
            sample(
                &mut out,
                "cache_requests_total",
                &format!("type=\"{}\",result=\"miss\"", cache_type),
                stats.misses,
            )?;
        }
        writeln!(&mut out)?;

        // Servers
        metric(
            &mut out,
            "servers_healthy",
            "Backend servers in the healthy state",
            "gauge",
            m.healthy_servers,
        )?;
        header(&mut out, "server_connections", "Connections routed to each server", "gauge")?;
        for server in &m.balancer.servers {
            sample(
                &mut out,
                "server_connections",
                &format!("server=\"{}\"", server.info.server_id),
                server.info.current_connections,
            )?;
        }
        writeln!(&mut out)?;
        header(
            &mut out,
            "server_circuit_state",
            "Server circuit breaker (0=closed, 1=half-open, 2=open)",
            "gauge",
        )?;
        for server in &m.balancer.servers {
            sample(
                &mut out,
                "server_circuit_state",
                &format!("server=\"{}\"", server.info.server_id),
                circuit_value(server.circuit),
            )?;
        }
        writeln!(&mut out)?;

        // Errors
        metric(
            &mut out,
            "errors_total",
            "Errors recorded by the error handler",
            "counter",
            m.errors.total_errors,
        )?;
        metric(
            &mut out,
            "error_rate",
            "Failed share of finished tasks",
            "gauge",
            m.error_rate,
        )?;
        header(&mut out, "errors_by_type", "Errors in history by type", "gauge")?;
        for (error_type, count) in &m.errors.by_type {
            sample(&mut out, "errors_by_type", &format!("type=\"{}\"", error_type), count)?;
        }
        writeln!(&mut out)?;
        metric(
            &mut out,
            "recovery_success_rate",
            "Share of recovery attempts that succeeded",
            "gauge",
            m.errors.recovery_success_rate,
        )?;

        if let Some(health) = self.health {
            metric(
                &mut out,
                "health_status",
                "Overall health (0=healthy, 1=degraded, 2=critical)",
                "gauge",
                health_value(health.status),
            )?;
            header(
                &mut out,
                "component_health_status",
                "Component health (0=healthy, 1=degraded, 2=critical)",
                "gauge",
            )?;
            let mut components: Vec<_> = health.components.iter().collect();
            components.sort_by(|a, b| a.0.cmp(b.0));
            for (name, component) in components {
                sample(
                    &mut out,
                    "component_health_status",
                    &format!("component=\"{}\"", name),
                    health_value(component.status),
                )?;
            }
            writeln!(&mut out)?;
        }

        Ok(out)
    }
}
