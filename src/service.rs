//! Composition root for the realtime layer.
//!
//! `RealtimeService` owns the connection pool, message processor, cache,
//! load balancer, error handler and send rate limiter, and exposes the
//! connection and messaging API the request layer calls into.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::balancer::{BalancerStats, HealthProbe, HttpHealthProbe, LoadBalancer};
use crate::cache::{CacheManager, CacheStats, CacheType, ExternalCache, RedisCache, SetOptions};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::error_handler::{AlertSink, ErrorContext, ErrorHandler, ErrorMetrics};
use crate::health::{ComponentHealth, SystemHealth};
use crate::pool::{Connection, ConnectionPool, PoolStats, ReapedConnection, RemovalReason};
use crate::processor::{
    Message, MessageHandler, MessageProcessor, MessageType, Priority, ProcessorStats,
};
use crate::rate_limit::SendRateLimiter;

/// Connection state kept in the cache so `send` can resolve a session
/// without touching the pool lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionMetadata {
    pub session_id: String,
    pub user_id: Option<String>,
    pub server_id: Option<String>,
    pub tags: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

impl From<&Connection> for ConnectionMetadata {
    fn from(connection: &Connection) -> Self {
        Self {
            session_id: connection.session_id.clone(),
            user_id: connection.user_id.clone(),
            server_id: connection.server_id.clone(),
            tags: connection.tags.iter().cloned().collect(),
            connected_at: connection.connected_at,
        }
    }
}

/// Which live connections a broadcast reaches. Empty criteria match
/// everything; all given criteria must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastFilter {
    pub user_ids: Option<HashSet<String>>,
    pub server_ids: Option<HashSet<String>>,
    /// Connection must carry every one of these tags
    pub tags: Vec<String>,
    pub exclude_sessions: HashSet<String>,
}

impl BroadcastFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn users<I, S>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_ids = Some(user_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn servers<I, S>(mut self, server_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_ids = Some(server_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn excluding(mut self, session_id: impl Into<String>) -> Self {
        self.exclude_sessions.insert(session_id.into());
        self
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        if !connection.is_live() || self.exclude_sessions.contains(&connection.session_id) {
            return false;
        }
        if let Some(users) = &self.user_ids {
            match &connection.user_id {
                Some(uid) if users.contains(uid) => {}
                _ => return false,
            }
        }
        if let Some(servers) = &self.server_ids {
            match &connection.server_id {
                Some(sid) if servers.contains(sid) => {}
                _ => return false,
            }
        }
        self.tags.iter().all(|t| connection.tags.contains(t))
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BroadcastReport {
    pub targeted: usize,
    pub enqueued: usize,
    pub failed: usize,
    #[serde(skip)]
    pub task_ids: Vec<Uuid>,
}

/// Headline numbers plus full per-component detail
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub throughput: f64,
    pub error_rate: f64,
    pub queue_depth: usize,
    pub cache_hit_rate: f64,
    pub worker_utilization: f64,
    pub healthy_servers: usize,
    pub active_connections: usize,
    pub pool: PoolStats,
    pub processor: ProcessorStats,
    pub cache: CacheStats,
    pub balancer: BalancerStats,
    pub errors: ErrorMetrics,
    pub timestamp: i64,
}

pub struct RealtimeServiceBuilder {
    config: Config,
    external_cache: Option<Arc<dyn ExternalCache>>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl RealtimeServiceBuilder {
    pub fn external_cache(mut self, cache: Arc<dyn ExternalCache>) -> Self {
        self.external_cache = Some(cache);
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn build(self) -> AppResult<RealtimeService> {
        let config = self.config;

        let errors = Arc::new(match self.alert_sink {
            Some(sink) => ErrorHandler::with_alert_sink(config.errors.clone(), sink),
            None => ErrorHandler::new(config.errors.clone()),
        });

        let mut cache = CacheManager::new(config.cache.clone());
        if let Some(external) = self.external_cache {
            cache = cache.with_external(
                external,
                CircuitBreakerConfig {
                    failure_threshold: config.errors.failure_threshold,
                    recovery_timeout: config.errors.recovery_timeout(),
                    half_open_max_calls: 1,
                },
            );
        }

        let probe = match self.health_probe {
            Some(probe) => Some(probe),
            None => match &config.balancer.health_probe_path {
                Some(path) => Some(Arc::new(HttpHealthProbe::new(
                    path.clone(),
                    config.balancer.health_check_timeout(),
                )?) as Arc<dyn HealthProbe>),
                None => None,
            },
        };
        let mut balancer = LoadBalancer::new(config.balancer.clone());
        if let Some(probe) = probe {
            balancer = balancer.with_probe(probe);
        }

        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        // subscribe before anything can be evicted
        let removals = pool.subscribe();

        Ok(RealtimeService {
            processor: MessageProcessor::new(config.processor.clone(), errors.clone()),
            rate_limiter: SendRateLimiter::new(&config.rate_limit),
            cache: Arc::new(cache),
            balancer: Arc::new(balancer),
            pool,
            errors,
            removals: Mutex::new(Some(removals)),
            background: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }
}

pub struct RealtimeService {
    config: Config,
    pool: Arc<ConnectionPool>,
    processor: MessageProcessor,
    cache: Arc<CacheManager>,
    balancer: Arc<LoadBalancer>,
    errors: Arc<ErrorHandler>,
    rate_limiter: SendRateLimiter,
    removals: Mutex<Option<broadcast::Receiver<ReapedConnection>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RealtimeService {
    pub fn builder(config: Config) -> RealtimeServiceBuilder {
        RealtimeServiceBuilder {
            config,
            external_cache: None,
            health_probe: None,
            alert_sink: None,
        }
    }

    /// Build from configuration alone, attaching Redis when enabled
    pub fn from_config(config: Config) -> AppResult<Self> {
        let mut builder = Self::builder(config.clone());
        if config.redis.enabled {
            let redis_config = deadpool_redis::Config::from_url(&config.redis.url);
            let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
            tracing::info!("Redis cache tier enabled at {}", config.redis.url);
            builder = builder.external_cache(Arc::new(RedisCache::new(
                pool,
                config.cache.namespace.clone(),
            )));
        }
        builder.build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Start workers and every background loop
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let Some(removals) = self.removals.lock().await.take() else {
            tracing::debug!("Realtime service already started");
            return Ok(());
        };

        self.processor.start().await?;

        let mut background = self.background.lock().await;
        background.push(self.pool.start_reaper(self.shutdown.child_token()));
        background.push(self.spawn_removal_listener(removals));
        background.push(self.cache.start_cleanup_task(self.shutdown.child_token()));
        background.push(self.balancer.start_health_checks(self.shutdown.child_token()));

        tracing::info!(
            "Realtime service started ({} servers, strategy {})",
            self.config.balancer.servers.len(),
            self.balancer.strategy()
        );
        Ok(())
    }

    /// Stop background loops, then the processor with the configured grace
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down realtime service");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        if tokio::time::timeout(Duration::from_secs(5), join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Background loops did not stop in time");
        }

        self.processor
            .stop(self.config.processor.shutdown_grace())
            .await;
    }

    /// Releases server slots and cached metadata for connections the pool
    /// dropped on its own; also sweeps rate limiter buckets.
    fn spawn_removal_listener(
        self: &Arc<Self>,
        mut removals: broadcast::Receiver<ReapedConnection>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        let sweep_period = self.config.pool.reap_interval();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_period);
            sweep.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => service.rate_limiter.cleanup(),
                    removal = removals.recv() => match removal {
                        Ok(reaped) => service.on_removed(reaped).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Removal listener lagged, missed {} removals", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Removal listener stopped");
        })
    }

    async fn on_removed(&self, reaped: ReapedConnection) {
        let connection = &reaped.connection;
        if let Some(server_id) = &connection.server_id {
            self.balancer.record_disconnection(server_id).await;
            if reaped.reason == RemovalReason::Failed {
                self.balancer.record_error(server_id).await;
            }
        }
        self.forget_metadata(&connection.session_id).await;
    }

    async fn forget_metadata(&self, session_id: &str) {
        if let Err(e) = self.cache.delete(session_id, CacheType::Connection).await {
            tracing::warn!("Failed to drop cached metadata for {}: {}", session_id, e);
        }
    }

    async fn remember_metadata(&self, connection: &Connection) {
        let metadata = ConnectionMetadata::from(connection);
        let mut tags = Vec::with_capacity(2);
        if let Some(user_id) = &metadata.user_id {
            tags.push(format!("user:{}", user_id));
        }
        if let Some(server_id) = &metadata.server_id {
            tags.push(format!("server:{}", server_id));
        }

        if let Err(e) = self
            .cache
            .set(
                &metadata.session_id,
                &metadata,
                CacheType::Connection,
                SetOptions::default().with_tags(tags),
            )
            .await
        {
            tracing::warn!(
                "Failed to cache metadata for {}: {}",
                metadata.session_id,
                e
            );
        }
    }

    /// Record an API-boundary failure before handing it back
    async fn report<T>(&self, result: AppResult<T>, context: ErrorContext) -> AppResult<T> {
        if let Err(e) = &result {
            self.errors.record_error(e, context).await;
        }
        result
    }

    pub async fn connect(&self, session_id: &str, user_id: Option<&str>) -> AppResult<Connection> {
        self.connect_with(session_id, user_id, &[]).await
    }

    /// Route a session to a server and open (or reuse) its connection.
    /// `tags` replace the connection's tags and steer tag-aware routing.
    pub async fn connect_with(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        tags: &[String],
    ) -> AppResult<Connection> {
        let result = self.try_connect(session_id, user_id, tags).await;
        self.report(
            result,
            ErrorContext::new("connect")
                .with_session(session_id)
                .with_user(user_id),
        )
        .await
    }

    async fn try_connect(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        tags: &[String],
    ) -> AppResult<Connection> {
        let reusable = self
            .pool
            .get(session_id)
            .await
            .filter(Connection::is_live)
            .is_some();

        let server = if reusable || self.balancer.is_empty().await {
            None
        } else {
            Some(
                self.balancer
                    .select_server(Some(session_id), user_id, tags)
                    .await?,
            )
        };
        let server_id = server.as_ref().map(|s| s.server_id.as_str());

        let acquired = match self.pool.acquire_on(session_id, user_id, server_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                // the server was never contacted; its breaker learns nothing
                if let Some(server_id) = server_id {
                    self.balancer.release_selection(server_id).await;
                }
                return Err(e);
            }
        };
        if let Some(server_id) = server_id {
            if !acquired.reused {
                self.balancer.record_connection(server_id).await;
            }
            self.balancer.record_success(server_id).await;
        }

        if !tags.is_empty() {
            self.pool.set_tags(session_id, tags.iter().cloned()).await;
        }
        let connection = self
            .pool
            .get(session_id)
            .await
            .unwrap_or(acquired.connection);

        self.remember_metadata(&connection).await;
        tracing::info!(
            "Connected session {} (user {:?}, server {:?}, reused {})",
            session_id,
            connection.user_id,
            connection.server_id,
            acquired.reused
        );
        Ok(connection)
    }

    /// Close a session. Returns false when it was not connected.
    pub async fn disconnect(&self, session_id: &str) -> AppResult<bool> {
        let removed = self.pool.remove(session_id).await;
        self.forget_metadata(session_id).await;

        match removed {
            Some(connection) => {
                if let Some(server_id) = &connection.server_id {
                    self.balancer.record_disconnection(server_id).await;
                }
                tracing::info!("Disconnected session {}", session_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cached metadata first, the pool as the source of truth on a miss
    async fn lookup(&self, session_id: &str) -> AppResult<ConnectionMetadata> {
        match self
            .cache
            .get::<ConnectionMetadata>(session_id, CacheType::Connection)
            .await
        {
            Ok(Some(metadata)) => return Ok(metadata),
            Ok(None) => {}
            Err(e) => tracing::debug!("Metadata lookup for {} fell through: {}", session_id, e),
        }

        match self.pool.get(session_id).await {
            Some(connection) if connection.is_live() => {
                self.remember_metadata(&connection).await;
                Ok(ConnectionMetadata::from(&connection))
            }
            _ => Err(AppError::NotFound(format!("session {}", session_id))),
        }
    }

    /// Queue a message for a connected session
    pub async fn send(
        &self,
        session_id: &str,
        message: Message,
        priority: Priority,
    ) -> AppResult<Uuid> {
        let result = self.try_send(session_id, message, priority, true).await;
        self.report(result, ErrorContext::new("send").with_session(session_id))
            .await
    }

    async fn try_send(
        &self,
        session_id: &str,
        message: Message,
        priority: Priority,
        rate_limited: bool,
    ) -> AppResult<Uuid> {
        let metadata = self.lookup(session_id).await?;
        if rate_limited {
            self.rate_limiter
                .check(metadata.user_id.as_deref().unwrap_or(session_id))?;
        }

        let task_id = self
            .processor
            .submit(session_id, metadata.user_id.as_deref(), message, priority)
            .await?;
        self.pool.touch(session_id).await;
        Ok(task_id)
    }

    /// Queue a message without resolving the session first
    pub async fn enqueue(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        message: Message,
        priority: Priority,
    ) -> AppResult<Uuid> {
        let result = match self
            .rate_limiter
            .check(user_id.unwrap_or(session_id))
        {
            Ok(()) => {
                self.processor
                    .submit(session_id, user_id, message, priority)
                    .await
            }
            Err(e) => Err(e),
        };
        self.report(
            result,
            ErrorContext::new("enqueue")
                .with_session(session_id)
                .with_user(user_id),
        )
        .await
    }

    /// Send to every live session of a user. Per-session failures are
    /// recorded and skipped.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        message: Message,
        priority: Priority,
    ) -> AppResult<Vec<Uuid>> {
        let sessions = self.pool.sessions_for_user(user_id).await;
        if sessions.is_empty() {
            return Ok(Vec::new());
        }

        let mut task_ids = Vec::with_capacity(sessions.len());
        let mut last_error = None;
        for session_id in &sessions {
            match self.send(session_id, message.clone(), priority).await {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => last_error = Some(e),
            }
        }

        match (task_ids.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(task_ids),
        }
    }

    /// Fan a message out to every matching live connection concurrently.
    /// Broadcasts bypass the per-user send rate limit.
    pub async fn broadcast(
        &self,
        message: Message,
        filter: &BroadcastFilter,
        priority: Priority,
    ) -> BroadcastReport {
        let targets: Vec<Connection> = self
            .pool
            .connections()
            .await
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect();

        let sends = targets.iter().map(|c| {
            let message = message.clone();
            async move {
                let result = self
                    .try_send(&c.session_id, message, priority, false)
                    .await;
                self.report(
                    result,
                    ErrorContext::new("broadcast").with_session(c.session_id.clone()),
                )
                .await
            }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport {
            targeted: targets.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(task_id) => {
                    report.enqueued += 1;
                    report.task_ids.push(task_id);
                }
                Err(_) => report.failed += 1,
            }
        }

        tracing::debug!(
            "Broadcast {} reached {}/{} connections",
            message.message_type,
            report.enqueued,
            report.targeted
        );
        report
    }

    pub async fn register_handler(
        &self,
        message_type: impl Into<MessageType>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.processor
            .register_handler(message_type.into(), handler)
            .await;
    }

    pub async fn set_fallback_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.processor.set_fallback_handler(handler).await;
    }

    pub async fn health_check(&self) -> SystemHealth {
        let (pool, processor, cache, balancer, errors) = tokio::join!(
            self.pool.health(),
            self.processor.health(),
            self.cache.health(),
            self.balancer.health(),
            self.errors.health(),
        );

        let components: HashMap<String, ComponentHealth> = [
            ("connection_pool", pool),
            ("message_processor", processor),
            ("cache", cache),
            ("load_balancer", balancer),
            ("error_handler", errors),
        ]
        .into_iter()
        .map(|(name, health)| (name.to_string(), health))
        .collect();

        SystemHealth::aggregate(components)
    }

    pub async fn get_metrics(&self) -> ServiceMetrics {
        let (pool, processor, cache, balancer, errors) = tokio::join!(
            self.pool.stats(),
            self.processor.stats(),
            self.cache.stats(),
            self.balancer.stats(),
            self.errors.metrics(),
        );

        let finished = processor.processed + processor.failed;
        let error_rate = if finished == 0 {
            0.0
        } else {
            processor.failed as f64 / finished as f64
        };

        ServiceMetrics {
            throughput: processor.throughput_per_second,
            error_rate,
            queue_depth: processor.total_queued,
            cache_hit_rate: cache.hit_rate,
            worker_utilization: processor.worker_utilization,
            healthy_servers: balancer.healthy,
            active_connections: pool.connected + pool.idle,
            pool,
            processor,
            cache,
            balancer,
            errors,
            timestamp: Utc::now().timestamp(),
        }
    }
}
