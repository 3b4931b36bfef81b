/// Connection Pool
///
/// This manages:
/// - Live logical connections (session_id -> Connection)
/// - User index (user_id -> {session_ids})
/// - Idle/stale reclamation through a background reaper
///
/// Both maps live behind one lock so the index never disagrees with the pool.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{AppError, AppResult};
use crate::health::ComponentHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Idle,
    Failed,
    Disconnected,
}

/// A logical client connection
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub session_id: String,
    pub user_id: Option<String>,
    pub state: ConnectionState,
    /// Backend server chosen by the load balancer
    pub server_id: Option<String>,
    pub tags: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub last_activity_at: Instant,
}

impl Connection {
    fn new(session_id: &str, user_id: Option<&str>, server_id: Option<&str>, now: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            state: ConnectionState::Connected,
            server_id: server_id.map(str::to_string),
            tags: BTreeSet::new(),
            connected_at: Utc::now(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Connected | ConnectionState::Idle)
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_activity_at)
    }
}

/// Why a connection left the pool without an explicit `remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    IdleTimeout,
    Failed,
    Disconnected,
    /// Idle connection dropped to admit a new one at capacity
    Evicted,
    /// Dead entry replaced by a fresh acquire of the same session
    Replaced,
}

#[derive(Debug, Clone)]
pub struct ReapedConnection {
    pub connection: Connection,
    pub reason: RemovalReason,
}

/// Result of an acquire
#[derive(Debug, Clone)]
pub struct Acquired {
    pub connection: Connection,
    /// An existing live connection was handed back
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub connected: usize,
    pub idle: usize,
    pub failed: usize,
    pub users: usize,
    pub max_connections: usize,
    pub utilization: f64,
    pub total_created: u64,
    pub total_reaped: u64,
    pub total_evicted: u64,
    pub capacity_rejections: u64,
}

#[derive(Default)]
struct PoolInner {
    connections: HashMap<String, Connection>,
    /// user_id -> {session_ids}
    user_index: HashMap<String, HashSet<String>>,
    total_created: u64,
    total_reaped: u64,
    total_evicted: u64,
    capacity_rejections: u64,
}

impl PoolInner {
    fn attach(&mut self, connection: Connection) {
        if let Some(user_id) = &connection.user_id {
            self.user_index
                .entry(user_id.clone())
                .or_default()
                .insert(connection.session_id.clone());
        }
        self.connections
            .insert(connection.session_id.clone(), connection);
    }

    fn detach(&mut self, session_id: &str) -> Option<Connection> {
        let connection = self.connections.remove(session_id)?;
        if let Some(user_id) = &connection.user_id {
            if let Some(sessions) = self.user_index.get_mut(user_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    self.user_index.remove(user_id);
                }
            }
        }
        Some(connection)
    }

    /// Dead entries first, then the least recently active idle connection
    fn eviction_candidate(&self) -> Option<String> {
        self.connections
            .values()
            .filter(|c| !c.is_live())
            .map(|c| c.session_id.clone())
            .next()
            .or_else(|| {
                self.connections
                    .values()
                    .filter(|c| c.state == ConnectionState::Idle)
                    .min_by_key(|c| c.last_activity_at)
                    .map(|c| c.session_id.clone())
            })
    }

    fn count_state(&self, state: ConnectionState) -> usize {
        self.connections.values().filter(|c| c.state == state).count()
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    inner: RwLock<PoolInner>,
    removals: broadcast::Sender<ReapedConnection>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let (removals, _) = broadcast::channel(1024);
        Self {
            config,
            inner: RwLock::new(PoolInner::default()),
            removals,
        }
    }

    /// Connections removed by the reaper, by capacity eviction or by
    /// replacement
    pub fn subscribe(&self) -> broadcast::Receiver<ReapedConnection> {
        self.removals.subscribe()
    }

    fn announce(&self, removed: Vec<ReapedConnection>) {
        for reaped in removed {
            // no subscriber is fine
            let _ = self.removals.send(reaped);
        }
    }

    pub async fn acquire(&self, session_id: &str, user_id: Option<&str>) -> AppResult<Connection> {
        self.acquire_on(session_id, user_id, None)
            .await
            .map(|acquired| acquired.connection)
    }

    /// Return the live connection for `session_id` or create one bound to
    /// `server_id`.
    pub async fn acquire_on(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        server_id: Option<&str>,
    ) -> AppResult<Acquired> {
        let mut removed = Vec::new();
        let result = {
            let mut inner = self.inner.write().await;
            self.acquire_locked(&mut inner, session_id, user_id, server_id, &mut removed)
        };
        self.announce(removed);
        result
    }

    fn acquire_locked(
        &self,
        inner: &mut PoolInner,
        session_id: &str,
        user_id: Option<&str>,
        server_id: Option<&str>,
        removed: &mut Vec<ReapedConnection>,
    ) -> AppResult<Acquired> {
        let now = Instant::now();

        match inner.connections.get(session_id).map(|c| c.is_live()) {
            Some(true) => {
                // Reattach so a changed user id moves in the index
                if let Some(mut connection) = inner.detach(session_id) {
                    if user_id.is_some() {
                        connection.user_id = user_id.map(str::to_string);
                    }
                    if connection.server_id.is_none() {
                        connection.server_id = server_id.map(str::to_string);
                    }
                    connection.state = ConnectionState::Connected;
                    connection.last_activity_at = now;
                    inner.attach(connection.clone());
                    return Ok(Acquired {
                        connection,
                        reused: true,
                    });
                }
            }
            Some(false) => {
                if let Some(old) = inner.detach(session_id) {
                    removed.push(ReapedConnection {
                        connection: old,
                        reason: RemovalReason::Replaced,
                    });
                }
            }
            None => {}
        }

        if inner.connections.len() >= self.config.max_connections {
            match inner.eviction_candidate().and_then(|sid| inner.detach(&sid)) {
                Some(old) => {
                    tracing::debug!(
                        "Evicting connection {} to admit {}",
                        old.session_id,
                        session_id
                    );
                    inner.total_evicted += 1;
                    let reason = match old.state {
                        ConnectionState::Failed => RemovalReason::Failed,
                        ConnectionState::Disconnected => RemovalReason::Disconnected,
                        _ => RemovalReason::Evicted,
                    };
                    removed.push(ReapedConnection {
                        connection: old,
                        reason,
                    });
                }
                None => {
                    inner.capacity_rejections += 1;
                    return Err(AppError::PoolExhausted {
                        max_connections: self.config.max_connections,
                    });
                }
            }
        }

        let connection = Connection::new(session_id, user_id, server_id, now);
        inner.attach(connection.clone());
        inner.total_created += 1;

        Ok(Acquired {
            connection,
            reused: false,
        })
    }

    /// Mark a connection idle; it stays in the pool for reuse.
    pub async fn release(&self, session_id: &str) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(session_id) {
            Some(connection) => {
                connection.state = ConnectionState::Idle;
                connection.last_activity_at = Instant::now();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("connection {}", session_id))),
        }
    }

    /// Destroy a connection and drop it from the user index
    pub async fn remove(&self, session_id: &str) -> Option<Connection> {
        let removed = self.inner.write().await.detach(session_id);
        if removed.is_some() {
            tracing::debug!("Removed connection {}", session_id);
        }
        removed
    }

    pub async fn touch(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(session_id) {
            Some(connection) => {
                connection.last_activity_at = Instant::now();
                if connection.state == ConnectionState::Idle {
                    connection.state = ConnectionState::Connected;
                }
                true
            }
            None => false,
        }
    }

    pub async fn mark_failed(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(session_id) {
            Some(connection) => {
                connection.state = ConnectionState::Failed;
                true
            }
            None => false,
        }
    }

    pub async fn set_tags<I, S>(&self, session_id: &str, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(session_id) {
            Some(connection) => {
                connection.tags = tags.into_iter().map(Into::into).collect();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Connection> {
        self.inner.read().await.connections.get(session_id).cloned()
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .user_index
            .get(user_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Remove connections idle past the timeout and dead connections
    pub async fn reap(&self) -> Vec<ReapedConnection> {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();

        let reaped: Vec<ReapedConnection> = {
            let mut inner = self.inner.write().await;
            let doomed: Vec<(String, RemovalReason)> = inner
                .connections
                .values()
                .filter_map(|c| match c.state {
                    ConnectionState::Failed => Some(RemovalReason::Failed),
                    ConnectionState::Disconnected => Some(RemovalReason::Disconnected),
                    _ if c.idle_for(now) > idle_timeout => Some(RemovalReason::IdleTimeout),
                    _ => None,
                }.map(|reason| (c.session_id.clone(), reason)))
                .collect();

            let reaped: Vec<ReapedConnection> = doomed
                .into_iter()
                .filter_map(|(sid, reason)| {
                    inner.detach(&sid).map(|connection| ReapedConnection { connection, reason })
                })
                .collect();
            inner.total_reaped += reaped.len() as u64;
            reaped
        };

        for r in &reaped {
            tracing::info!(
                "Reaped connection {} ({:?})",
                r.connection.session_id,
                r.reason
            );
        }
        self.announce(reaped.clone());
        reaped
    }

    /// Start the background reaper
    pub fn start_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = pool.config.reap_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = pool.reap().await;
                        if !reaped.is_empty() {
                            tracing::debug!("Reaper removed {} connections", reaped.len());
                        }
                    }
                }
            }
            tracing::debug!("Connection reaper stopped");
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        let size = inner.connections.len();
        PoolStats {
            size,
            connected: inner.count_state(ConnectionState::Connected),
            idle: inner.count_state(ConnectionState::Idle),
            failed: inner.count_state(ConnectionState::Failed),
            users: inner.user_index.len(),
            max_connections: self.config.max_connections,
            utilization: size as f64 / self.config.max_connections as f64,
            total_created: inner.total_created,
            total_reaped: inner.total_reaped,
            total_evicted: inner.total_evicted,
            capacity_rejections: inner.capacity_rejections,
        }
    }

    pub async fn health(&self) -> ComponentHealth {
        let stats = self.stats().await;
        let health = if stats.size >= stats.max_connections && stats.idle == 0 {
            ComponentHealth::critical("connection pool exhausted, rejecting new connections")
        } else if stats.utilization >= 0.9 {
            ComponentHealth::degraded(format!(
                "connection pool at {:.0}% capacity",
                stats.utilization * 100.0
            ))
        } else {
            ComponentHealth::healthy()
        };

        health
            .with_metric("size", stats.size)
            .with_metric("idle", stats.idle)
            .with_metric("users", stats.users)
            .with_metric("utilization", stats.utilization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(max_connections: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_connections,
            idle_timeout_seconds: 60.0,
            reap_interval_seconds: 10.0,
        })
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_connection() {
        let pool = pool(10);
        let first = pool.acquire_on("s1", Some("u1"), Some("srv-a")).await.unwrap();
        assert!(!first.reused);

        let second = pool.acquire_on("s1", Some("u1"), Some("srv-b")).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.connection.server_id.as_deref(), Some("srv-a"));
        assert_eq!(second.connection.created_at, first.connection.created_at);

        assert_eq!(pool.sessions_for_user("u1").await, vec!["s1".to_string()]);
        assert_eq!(pool.stats().await.total_created, 1);
    }

    #[tokio::test]
    async fn test_release_then_acquire() {
        let pool = pool(10);
        pool.acquire("s1", None).await.unwrap();
        pool.release("s1").await.unwrap();
        assert_eq!(pool.stats().await.idle, 1);

        let conn = pool.acquire("s1", None).await.unwrap();
        assert_eq!(conn.state, ConnectionState::Connected);
        assert!(matches!(
            pool.release("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_exceeded_without_idle() {
        let pool = pool(2);
        let mut removals = pool.subscribe();
        pool.acquire("s1", Some("u1")).await.unwrap();
        pool.acquire("s2", Some("u2")).await.unwrap();

        let err = pool.acquire("s3", Some("u3")).await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted { max_connections: 2 }));
        assert_eq!(pool.stats().await.capacity_rejections, 1);

        // an idle connection can be evicted to make room
        pool.release("s1").await.unwrap();
        pool.acquire("s3", Some("u3")).await.unwrap();
        assert!(pool.get("s1").await.is_none());
        assert!(pool.sessions_for_user("u1").await.is_empty());

        let evicted = removals.recv().await.unwrap();
        assert_eq!(evicted.connection.session_id, "s1");
        assert_eq!(evicted.reason, RemovalReason::Evicted);
    }

    #[tokio::test]
    async fn test_remove_updates_user_index() {
        let pool = pool(10);
        pool.acquire("s1", Some("u1")).await.unwrap();
        pool.acquire("s2", Some("u1")).await.unwrap();
        assert_eq!(pool.sessions_for_user("u1").await.len(), 2);

        assert!(pool.remove("s1").await.is_some());
        assert_eq!(pool.sessions_for_user("u1").await, vec!["s2".to_string()]);
        assert!(pool.remove("s1").await.is_none());

        pool.remove("s2").await;
        assert_eq!(pool.stats().await.users, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reap_then_fresh_acquire() {
        let pool = pool(10);
        let original = pool.acquire("s1", Some("u1")).await.unwrap();
        pool.acquire("s2", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        pool.touch("s2").await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let reaped = pool.reap().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].connection.session_id, "s1");
        assert_eq!(reaped[0].reason, RemovalReason::IdleTimeout);

        let fresh = pool.acquire_on("s1", Some("u1"), None).await.unwrap();
        assert!(!fresh.reused);
        assert!(fresh.connection.created_at > original.created_at);
        assert_eq!(pool.stats().await.total_created, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper_removes_failed() {
        let pool = Arc::new(pool(10));
        let mut removals = pool.subscribe();
        let cancel = CancellationToken::new();
        let handle = pool.start_reaper(cancel.clone());

        pool.acquire("s1", None).await.unwrap();
        pool.mark_failed("s1").await;

        let reaped = removals.recv().await.unwrap();
        assert_eq!(reaped.reason, RemovalReason::Failed);
        assert_eq!(pool.stats().await.size, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_replaced_on_acquire() {
        let pool = pool(10);
        pool.acquire("s1", None).await.unwrap();
        pool.mark_failed("s1").await;

        let acquired = pool.acquire_on("s1", None, None).await.unwrap();
        assert!(!acquired.reused);
        assert_eq!(acquired.connection.state, ConnectionState::Connected);
        assert_eq!(pool.stats().await.size, 1);
    }
}
