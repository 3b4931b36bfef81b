use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::balancer::LoadBalancingStrategy;
use crate::cache::{CacheType, EvictionPolicy};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerSettings,
    pub logging: LoggingConfig,
    pub redis: RedisConfig,
    #[validate(nested)]
    pub cache: CacheConfig,
    #[validate(nested)]
    pub pool: PoolConfig,
    #[validate(nested)]
    pub processor: ProcessorConfig,
    #[validate(nested)]
    pub balancer: LoadBalancerConfig,
    #[validate(nested)]
    pub errors: ErrorHandlerConfig,
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
}

/// Admin HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub cors_allow_origin: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8091,
            cors_allow_origin: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Defaults applied to entries of one cache type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTypeConfig {
    pub ttl_seconds: Option<f64>,
    pub eviction_policy: EvictionPolicy,
    pub max_size: usize,
}

impl CacheTypeConfig {
    pub fn new(ttl_seconds: f64, max_size: usize) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            eviction_policy: EvictionPolicy::Lru,
            max_size,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_cache"))]
pub struct CacheConfig {
    /// `<domain>` segment of every external key
    #[validate(length(min = 1))]
    pub namespace: String,
    #[validate(range(min = 1))]
    pub max_memory_bytes: usize,
    pub cleanup_interval_seconds: f64,
    pub external_timeout_seconds: f64,
    pub single_flight: bool,
    pub types: HashMap<CacheType, CacheTypeConfig>,
}

impl CacheConfig {
    pub fn type_config(&self, cache_type: CacheType) -> CacheTypeConfig {
        self.types
            .get(&cache_type)
            .cloned()
            .unwrap_or_else(|| cache_type.default_config())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_interval_seconds)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.external_timeout_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "realtime".to_string(),
            max_memory_bytes: 64 * 1024 * 1024,
            cleanup_interval_seconds: 60.0,
            external_timeout_seconds: 0.5,
            single_flight: true,
            types: CacheType::ALL
                .iter()
                .map(|t| (*t, t.default_config()))
                .collect(),
        }
    }
}

fn validate_cache(cfg: &CacheConfig) -> Result<(), ValidationError> {
    if cfg.cleanup_interval_seconds <= 0.0 || cfg.external_timeout_seconds <= 0.0 {
        return Err(ValidationError::new("cache_intervals")
            .with_message("cache intervals must be positive".into()));
    }
    for (cache_type, type_cfg) in &cfg.types {
        if type_cfg.max_size == 0 {
            return Err(ValidationError::new("cache_max_size").with_message(
                format!("max_size for cache type '{}' must be at least 1", cache_type).into(),
            ));
        }
        if matches!(type_cfg.ttl_seconds, Some(ttl) if ttl <= 0.0) {
            return Err(ValidationError::new("cache_ttl").with_message(
                format!("ttl for cache type '{}' must be positive", cache_type).into(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PoolConfig {
    #[validate(range(min = 1))]
    pub max_connections: usize,
    #[validate(range(min = 0.001))]
    pub idle_timeout_seconds: f64,
    #[validate(range(min = 0.001))]
    pub reap_interval_seconds: f64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_seconds)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reap_interval_seconds)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            idle_timeout_seconds: 300.0,
            reap_interval_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_processor"))]
pub struct ProcessorConfig {
    /// Capacity of each of the four priority queues
    #[validate(range(min = 1))]
    pub priority_queue_capacity: usize,
    /// Hard limit on concurrent workers
    #[validate(range(min = 1))]
    pub max_workers: usize,
    /// Floor for the auto-scaler and the initial worker count
    #[validate(range(min = 1))]
    pub min_workers: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub worker_scale_up_threshold: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub worker_scale_down_threshold: f64,
    pub scale_cooldown_seconds: f64,
    #[validate(range(min = 0.001))]
    pub scale_interval_seconds: f64,
    #[validate(range(min = 1))]
    pub scale_batch_size: usize,
    #[validate(range(min = 0.001))]
    pub processing_timeout_seconds: f64,
    #[validate(length(min = 1))]
    pub retry_delays: Vec<f64>,
    pub default_max_retries: u32,
    pub shutdown_grace_seconds: f64,
}

impl ProcessorConfig {
    pub fn scale_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.scale_cooldown_seconds)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scale_interval_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.processing_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_seconds)
    }

    /// Backoff before retry number `retry_count + 1`; the last delay repeats.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let idx = (retry_count as usize).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays
            .get(idx)
            .map(|secs| Duration::from_secs_f64(*secs))
            .unwrap_or_default()
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            priority_queue_capacity: 10_000,
            max_workers: 20,
            min_workers: 2,
            worker_scale_up_threshold: 0.8,
            worker_scale_down_threshold: 0.2,
            scale_cooldown_seconds: 30.0,
            scale_interval_seconds: 5.0,
            scale_batch_size: 2,
            processing_timeout_seconds: 30.0,
            retry_delays: vec![1.0, 2.0, 5.0, 10.0, 30.0],
            default_max_retries: 3,
            shutdown_grace_seconds: 10.0,
        }
    }
}

fn validate_processor(cfg: &ProcessorConfig) -> Result<(), ValidationError> {
    if cfg.min_workers > cfg.max_workers {
        return Err(ValidationError::new("worker_bounds")
            .with_message("min_workers must not exceed max_workers".into()));
    }
    if cfg.worker_scale_down_threshold >= cfg.worker_scale_up_threshold {
        return Err(ValidationError::new("scale_thresholds").with_message(
            "worker_scale_down_threshold must be below worker_scale_up_threshold".into(),
        ));
    }
    if cfg.retry_delays.iter().any(|d| *d < 0.0) {
        return Err(ValidationError::new("retry_delays")
            .with_message("retry delays must not be negative".into()));
    }
    Ok(())
}

/// Static description of one backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_server_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_server_max_connections() -> usize {
    1000
}

impl ServerConfig {
    pub fn new(server_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            server_id: server_id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_server_max_connections(),
            tags: Vec::new(),
        }
    }
}

impl FromStr for ServerConfig {
    type Err = String;

    /// `host:port[:weight[:max_connections]]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(format!("Invalid server '{}', expected host:port", s));
        }
        let port = parts[1]
            .parse()
            .map_err(|e| format!("Invalid port in '{}': {}", s, e))?;
        let mut server = ServerConfig::new(format!("{}:{}", parts[0], port), parts[0], port);
        if let Some(weight) = parts.get(2) {
            server.weight = weight
                .parse()
                .map_err(|e| format!("Invalid weight in '{}': {}", s, e))?;
        }
        if let Some(max) = parts.get(3) {
            server.max_connections = max
                .parse()
                .map_err(|e| format!("Invalid max_connections in '{}': {}", s, e))?;
        }
        Ok(server)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    pub servers: Vec<ServerConfig>,
    #[validate(range(min = 0.001))]
    pub health_check_interval: f64,
    #[validate(range(min = 0.001))]
    pub health_check_timeout: f64,
    /// Enables the active HTTP probe when set
    pub health_probe_path: Option<String>,
    #[validate(range(min = 1))]
    pub circuit_breaker_failure_threshold: usize,
    pub circuit_breaker_recovery_timeout_seconds: f64,
    #[validate(range(min = 1))]
    pub half_open_max_calls: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub degraded_error_rate: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub unhealthy_error_rate: f64,
    pub degraded_response_time_ms: f64,
    #[validate(range(min = 1))]
    pub stats_window_size: usize,
    pub stats_window_seconds: f64,
    #[validate(range(min = 1))]
    pub virtual_nodes: usize,
}

impl LoadBalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_timeout)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.circuit_breaker_recovery_timeout_seconds)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs_f64(self.stats_window_seconds)
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::LeastConnections,
            servers: Vec::new(),
            health_check_interval: 10.0,
            health_check_timeout: 2.0,
            health_probe_path: None,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout_seconds: 30.0,
            half_open_max_calls: 3,
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            degraded_response_time_ms: 1000.0,
            stats_window_size: 100,
            stats_window_seconds: 60.0,
            virtual_nodes: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    #[validate(range(min = 1))]
    pub history_size: usize,
    #[validate(range(min = 1))]
    pub failure_threshold: usize,
    pub recovery_timeout_seconds: f64,
    #[validate(range(min = 1))]
    pub half_open_max_calls: usize,
    /// Fixed delays used by the retrying recovery strategies
    pub connection_retry_delay_seconds: f64,
    pub network_retry_delay_seconds: f64,
    pub rate_limit_retry_delay_seconds: f64,
    pub resource_retry_delay_seconds: f64,
}

impl ErrorHandlerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_seconds)
    }
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            failure_threshold: 5,
            recovery_timeout_seconds: 60.0,
            half_open_max_calls: 3,
            connection_retry_delay_seconds: 1.0,
            network_retry_delay_seconds: 2.0,
            rate_limit_retry_delay_seconds: 5.0,
            resource_retry_delay_seconds: 10.0,
        }
    }
}

/// Per-user send rate limit
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub per_second: u32,
    #[validate(range(min = 1))]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_second: 50,
            burst: 100,
        }
    }
}

fn parse_env<T>(name: &str, target: &mut T) -> AppResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid {}: {}", name, e)))?;
    }
    Ok(())
}

impl Config {
    /// Defaults overridden by environment variables (and `.env`).
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }
        parse_env("PORT", &mut config.server.port)?;
        if let Ok(origin) = env::var("CORS_ALLOW_ORIGIN") {
            config.server.cors_allow_origin = origin;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        parse_env("LOG_JSON", &mut config.logging.json)?;

        parse_env("ENABLE_REDIS", &mut config.redis.enabled)?;
        if let Ok(url) = env::var("REDIS_URL") {
            config.redis.url = url;
        }

        if let Ok(namespace) = env::var("CACHE_NAMESPACE") {
            config.cache.namespace = namespace;
        }
        parse_env("CACHE_MAX_MEMORY_BYTES", &mut config.cache.max_memory_bytes)?;
        parse_env(
            "CACHE_CLEANUP_INTERVAL_SECONDS",
            &mut config.cache.cleanup_interval_seconds,
        )?;
        parse_env(
            "CACHE_EXTERNAL_TIMEOUT_SECONDS",
            &mut config.cache.external_timeout_seconds,
        )?;
        parse_env("CACHE_SINGLE_FLIGHT", &mut config.cache.single_flight)?;

        parse_env("POOL_MAX_CONNECTIONS", &mut config.pool.max_connections)?;
        parse_env(
            "POOL_IDLE_TIMEOUT_SECONDS",
            &mut config.pool.idle_timeout_seconds,
        )?;
        parse_env(
            "POOL_REAP_INTERVAL_SECONDS",
            &mut config.pool.reap_interval_seconds,
        )?;

        let processor = &mut config.processor;
        parse_env(
            "PROCESSOR_PRIORITY_QUEUE_CAPACITY",
            &mut processor.priority_queue_capacity,
        )?;
        parse_env("PROCESSOR_MAX_WORKERS", &mut processor.max_workers)?;
        parse_env("PROCESSOR_MIN_WORKERS", &mut processor.min_workers)?;
        parse_env(
            "PROCESSOR_SCALE_UP_THRESHOLD",
            &mut processor.worker_scale_up_threshold,
        )?;
        parse_env(
            "PROCESSOR_SCALE_DOWN_THRESHOLD",
            &mut processor.worker_scale_down_threshold,
        )?;
        parse_env(
            "PROCESSOR_SCALE_COOLDOWN_SECONDS",
            &mut processor.scale_cooldown_seconds,
        )?;
        parse_env(
            "PROCESSOR_PROCESSING_TIMEOUT_SECONDS",
            &mut processor.processing_timeout_seconds,
        )?;
        parse_env(
            "PROCESSOR_DEFAULT_MAX_RETRIES",
            &mut processor.default_max_retries,
        )?;
        if let Ok(delays) = env::var("PROCESSOR_RETRY_DELAYS") {
            processor.retry_delays = delays
                .split(',')
                .map(|d| d.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| AppError::Config(format!("Invalid PROCESSOR_RETRY_DELAYS: {}", e)))?;
        }

        let balancer = &mut config.balancer;
        parse_env("LB_STRATEGY", &mut balancer.strategy)?;
        parse_env(
            "LB_HEALTH_CHECK_INTERVAL",
            &mut balancer.health_check_interval,
        )?;
        parse_env("LB_HEALTH_CHECK_TIMEOUT", &mut balancer.health_check_timeout)?;
        if let Ok(path) = env::var("LB_HEALTH_PROBE_PATH") {
            balancer.health_probe_path = Some(path);
        }
        parse_env(
            "LB_CIRCUIT_BREAKER_FAILURE_THRESHOLD",
            &mut balancer.circuit_breaker_failure_threshold,
        )?;
        parse_env(
            "LB_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECONDS",
            &mut balancer.circuit_breaker_recovery_timeout_seconds,
        )?;
        if let Ok(servers) = env::var("LB_SERVERS") {
            balancer.servers = servers
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ServerConfig::from_str)
                .collect::<Result<_, _>>()
                .map_err(|e| AppError::Config(format!("Invalid LB_SERVERS: {}", e)))?;
        }

        parse_env("ERROR_HISTORY_SIZE", &mut config.errors.history_size)?;

        parse_env("RATE_LIMIT_ENABLED", &mut config.rate_limit.enabled)?;
        parse_env("RATE_LIMIT_PER_SECOND", &mut config.rate_limit.per_second)?;
        parse_env("RATE_LIMIT_BURST", &mut config.rate_limit.burst)?;

        config.validate()?;
        Ok(config)
    }

    /// Layered file configuration with `REALTIME__SECTION__KEY` overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("REALTIME").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }
}
