//! Priority-queued async message processor with an auto-scaling worker pool.

mod handler;
mod metrics;
mod queue;
mod task;
mod worker;

pub use handler::{handler_fn, MessageHandler};
pub use task::{Message, MessageType, Priority, Task};
pub use worker::{WorkerInfo, WorkerState};

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::{AppError, AppResult};
use crate::error_handler::ErrorHandler;
use crate::health::ComponentHealth;
use handler::HandlerRegistry;
use metrics::ProcessorMetrics;
use queue::PriorityQueues;
use worker::WorkerHandle;

/// What one scaler evaluation decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "workers")]
pub enum ScalingDecision {
    ScaleUp(usize),
    ScaleDown(usize),
    Hold,
    /// A change was due but the last one is too recent
    CoolingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub running: bool,
    pub queue_depths: BTreeMap<Priority, usize>,
    pub total_queued: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
    pub workers: usize,
    pub busy_workers: usize,
    pub worker_utilization: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub average_processing_time_ms: f64,
    pub throughput_per_second: f64,
    pub handlers: Vec<String>,
}

pub(crate) struct Inner {
    pub(crate) config: ProcessorConfig,
    pub(crate) queues: PriorityQueues,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) error_handler: Arc<ErrorHandler>,
    pub(crate) metrics: ProcessorMetrics,
    pub(crate) shutdown: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    last_scaled_at: Mutex<Option<Instant>>,
    scaler: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct MessageProcessor {
    inner: Arc<Inner>,
}

impl MessageProcessor {
    pub fn new(config: ProcessorConfig, error_handler: Arc<ErrorHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: PriorityQueues::new(config.priority_queue_capacity),
                handlers: HandlerRegistry::default(),
                error_handler,
                metrics: ProcessorMetrics::new(),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                next_worker_id: AtomicUsize::new(1),
                last_scaled_at: Mutex::new(None),
                scaler: Mutex::new(None),
                running: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub async fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.register(message_type, handler).await;
    }

    /// Handler for every type without a registered one
    pub async fn set_fallback_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.set_fallback(handler).await;
    }

    /// Queue a task on its priority queue
    pub async fn enqueue(&self, task: Task) -> AppResult<Uuid> {
        let task_id = task.task_id;
        let priority = task.priority;
        self.inner.queues.push(task).await?;
        ProcessorMetrics::incr(&self.inner.metrics.enqueued);
        tracing::debug!("Enqueued task {} at {} priority", task_id, priority);
        Ok(task_id)
    }

    /// Build a task with the default retry budget and queue it
    pub async fn submit(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        message: Message,
        priority: Priority,
    ) -> AppResult<Uuid> {
        let task = Task::new(
            session_id,
            user_id.map(str::to_string),
            message,
            priority,
            self.inner.config.default_max_retries,
        );
        self.enqueue(task).await
    }

    /// Spawn `min_workers` workers and the scaler loop
    pub async fn start(&self) -> AppResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Internal("processor was already stopped".to_string()));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let initial = self.inner.config.min_workers;
        self.spawn_workers(initial).await;
        *self.inner.scaler.lock().await = Some(self.spawn_scaler());

        tracing::info!(
            "Message processor started with {} workers (max {})",
            initial,
            self.inner.config.max_workers
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn spawn_workers(&self, count: usize) -> usize {
        let mut workers = self.inner.workers.lock().await;
        let room = self.inner.config.max_workers.saturating_sub(workers.len());
        let count = count.min(room);
        for _ in 0..count {
            let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
            workers.push(WorkerHandle::spawn(self.inner.clone(), id));
        }
        count
    }

    /// Add up to `count` workers, bounded by `max_workers`
    pub async fn add_workers(&self, count: usize) -> AppResult<usize> {
        if self.inner.workers.lock().await.len() >= self.inner.config.max_workers {
            return Err(AppError::MaxWorkersReached(self.inner.config.max_workers));
        }
        let added = self.spawn_workers(count).await;
        tracing::info!("Added {} workers", added);
        Ok(added)
    }

    /// Ask up to `count` idle workers to stop, never going below
    /// `min_workers`. Busy workers are left alone.
    async fn retire_idle_workers(&self, count: usize) -> usize {
        let mut workers = self.inner.workers.lock().await;
        let removable = workers.len().saturating_sub(self.inner.config.min_workers);
        let mut remaining = count.min(removable);
        let mut retired = 0;

        workers.retain(|worker| {
            if remaining > 0 && worker.shared.state() == WorkerState::Idle {
                worker.stop.cancel();
                remaining -= 1;
                retired += 1;
                false
            } else {
                true
            }
        });

        if retired > 0 {
            tracing::info!("Retired {} idle workers", retired);
        }
        retired
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.inner
            .workers
            .lock()
            .await
            .iter()
            .map(WorkerHandle::info)
            .collect()
    }

    /// One scaler step: compare queue utilization to the thresholds and
    /// resize the worker pool.
    pub async fn evaluate_scaling(&self) -> ScalingDecision {
        let config = &self.inner.config;
        let utilization = self.inner.queues.utilization().await;
        let (workers, idle) = {
            let workers = self.inner.workers.lock().await;
            let idle = workers
                .iter()
                .filter(|w| w.shared.state() == WorkerState::Idle)
                .count();
            (workers.len(), idle)
        };

        let wanted = if utilization > config.worker_scale_up_threshold && workers < config.max_workers {
            ScalingDecision::ScaleUp(config.scale_batch_size.min(config.max_workers - workers))
        } else if utilization < config.worker_scale_down_threshold && workers > config.min_workers {
            let n = config
                .scale_batch_size
                .min(workers - config.min_workers)
                .min(idle);
            if n == 0 {
                ScalingDecision::Hold
            } else {
                ScalingDecision::ScaleDown(n)
            }
        } else {
            ScalingDecision::Hold
        };

        if wanted == ScalingDecision::Hold {
            return wanted;
        }

        let mut last_scaled_at = self.inner.last_scaled_at.lock().await;
        let now = Instant::now();
        if matches!(*last_scaled_at, Some(at) if now.duration_since(at) < config.scale_cooldown()) {
            return ScalingDecision::CoolingDown;
        }

        let applied = match wanted {
            ScalingDecision::ScaleUp(n) => ScalingDecision::ScaleUp(self.spawn_workers(n).await),
            ScalingDecision::ScaleDown(n) => {
                ScalingDecision::ScaleDown(self.retire_idle_workers(n).await)
            }
            other => other,
        };
        *last_scaled_at = Some(now);

        tracing::info!(
            "Scaling {:?} at queue utilization {:.2} ({} workers before)",
            applied,
            utilization,
            workers
        );
        applied
    }

    fn spawn_scaler(&self) -> JoinHandle<()> {
        let processor = self.clone();
        let cancel = self.inner.shutdown.clone();
        let period = self.inner.config.scale_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        processor.evaluate_scaling().await;
                    }
                }
            }
            tracing::debug!("Worker scaler stopped");
        })
    }

    /// Stop the scaler and all workers. In-flight tasks get `grace` to
    /// finish before their workers are aborted; queued tasks stay queued.
    pub async fn stop(&self, grace: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        if let Some(scaler) = self.inner.scaler.lock().await.take() {
            let _ = scaler.await;
        }

        let workers: Vec<WorkerHandle> = self.inner.workers.lock().await.drain(..).collect();
        let count = workers.len();
        let aborts: Vec<_> = workers.iter().map(|w| w.join.abort_handle()).collect();
        let joins = workers.into_iter().map(|w| w.join);

        if tokio::time::timeout(grace, join_all(joins)).await.is_err() {
            tracing::warn!("Grace period elapsed, aborting in-flight tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("Message processor stopped ({} workers)", count);
    }

    pub async fn stats(&self) -> ProcessorStats {
        let depths = self.inner.queues.depths().await;
        let total_queued: usize = depths.iter().sum();
        let capacity = self.inner.queues.capacity();
        let (workers, busy) = {
            let workers = self.inner.workers.lock().await;
            let busy = workers
                .iter()
                .filter(|w| w.shared.state() != WorkerState::Idle)
                .count();
            (workers.len(), busy)
        };
        let metrics = &self.inner.metrics;

        ProcessorStats {
            running: self.is_running(),
            queue_depths: Priority::ALL
                .iter()
                .map(|p| (*p, depths[p.index()]))
                .collect(),
            total_queued,
            queue_capacity: capacity,
            queue_utilization: total_queued as f64 / (capacity * Priority::ALL.len()) as f64,
            workers,
            busy_workers: busy,
            worker_utilization: if workers == 0 {
                0.0
            } else {
                busy as f64 / workers as f64
            },
            min_workers: self.inner.config.min_workers,
            max_workers: self.inner.config.max_workers,
            enqueued: ProcessorMetrics::get(&metrics.enqueued),
            processed: ProcessorMetrics::get(&metrics.processed),
            failed: ProcessorMetrics::get(&metrics.failed),
            retried: ProcessorMetrics::get(&metrics.retried),
            dropped: ProcessorMetrics::get(&metrics.dropped),
            timeouts: ProcessorMetrics::get(&metrics.timeouts),
            average_processing_time_ms: metrics.average_processing_ms(),
            throughput_per_second: metrics.throughput(),
            handlers: self.inner.handlers.registered_types().await,
        }
    }

    pub async fn health(&self) -> ComponentHealth {
        let stats = self.stats().await;
        let health = if stats.running && stats.workers == 0 {
            ComponentHealth::critical("no workers running")
        } else if stats.queue_depths.values().any(|d| *d >= stats.queue_capacity) {
            ComponentHealth::degraded("a priority queue is full")
        } else if stats.queue_utilization >= 0.9 {
            ComponentHealth::degraded(format!(
                "queues at {:.0}% capacity",
                stats.queue_utilization * 100.0
            ))
        } else {
            ComponentHealth::healthy()
        };

        health
            .with_metric("queued", stats.total_queued)
            .with_metric("workers", stats.workers)
            .with_metric("worker_utilization", stats.worker_utilization)
            .with_metric("throughput", stats.throughput_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorHandlerConfig;
    use std::sync::atomic::AtomicUsize;

    fn processor(config: ProcessorConfig) -> MessageProcessor {
        MessageProcessor::new(config, Arc::new(ErrorHandler::new(ErrorHandlerConfig::default())))
    }

    fn config(min_workers: usize, max_workers: usize) -> ProcessorConfig {
        ProcessorConfig {
            min_workers,
            max_workers,
            priority_queue_capacity: 100,
            processing_timeout_seconds: 1.0,
            retry_delays: vec![0.5, 1.0],
            default_max_retries: 1,
            ..Default::default()
        }
    }

    fn chat(text: &str) -> Message {
        Message::new(MessageType::Chat, serde_json::json!({ "text": text }))
    }

    async fn wait_until_settled(processor: &MessageProcessor, expected: u64) -> ProcessorStats {
        loop {
            let stats = processor.stats().await;
            if stats.processed + stats.failed + stats.dropped >= expected {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_runs_before_low() {
        let processor = processor(config(1, 1));
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            processor
                .register_handler(
                    MessageType::Chat,
                    handler_fn(move |task: Task| {
                        let order = order.clone();
                        async move {
                            order.lock().await.push(task.priority);
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        processor.submit("s1", None, chat("later"), Priority::Low).await.unwrap();
        processor.submit("s1", None, chat("urgent"), Priority::Critical).await.unwrap();
        processor.start().await.unwrap();

        wait_until_settled(&processor, 2).await;
        assert_eq!(*order.lock().await, vec![Priority::Critical, Priority::Low]);
        processor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries() {
        let processor = processor(config(2, 2));
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            processor
                .register_handler(
                    MessageType::Chat,
                    handler_fn(move |_task: Task| {
                        let attempts = attempts.clone();
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        processor.start().await.unwrap();
        for i in 0..10 {
            processor
                .submit(&format!("s{}", i), None, chat("slow"), Priority::Normal)
                .await
                .unwrap();
        }

        let stats = wait_until_settled(&processor, 10).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 20);
        assert_eq!(stats.failed, 10);
        assert_eq!(stats.retried, 10);
        assert_eq!(stats.timeouts, 20);
        assert_eq!(stats.total_queued, 0);
        assert_eq!(stats.processed, 0);

        let errors = processor.inner.error_handler.metrics().await;
        assert_eq!(errors.recovery_attempts, 10);
        assert_eq!(errors.recovery_successes, 0);

        processor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_not_retried() {
        let processor = processor(config(1, 1));
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            processor
                .register_handler(
                    MessageType::Chat,
                    handler_fn(move |_task: Task| {
                        let attempts = attempts.clone();
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err(AppError::Validation("bad payload".into()))
                        }
                    }),
                )
                .await;
        }
        processor.start().await.unwrap();
        processor.submit("s1", None, chat("x"), Priority::High).await.unwrap();

        let stats = wait_until_settled(&processor, 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 0);
        processor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhandled_type_dropped_and_fallback() {
        let processor = processor(config(1, 1));
        processor.start().await.unwrap();
        processor
            .submit(
                "s1",
                None,
                Message::new("typing", serde_json::Value::Null),
                Priority::Normal,
            )
            .await
            .unwrap();

        let stats = wait_until_settled(&processor, 1).await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.failed, 0);

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            processor
                .set_fallback_handler(handler_fn(move |_task: Task| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await;
        }
        processor
            .submit(
                "s1",
                None,
                Message::new("typing", serde_json::Value::Null),
                Priority::Normal,
            )
            .await
            .unwrap();
        wait_until_settled(&processor, 2).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        processor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_queue_full_surfaces() {
        let mut cfg = config(1, 1);
        cfg.priority_queue_capacity = 1;
        let processor = processor(cfg);

        processor.submit("s1", None, chat("a"), Priority::Low).await.unwrap();
        let err = processor
            .submit("s1", None, chat("b"), Priority::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QueueFull { .. }));
        assert_eq!(processor.stats().await.enqueued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_workers_reached() {
        let processor = processor(config(1, 2));
        processor.start().await.unwrap();
        assert_eq!(processor.add_workers(5).await.unwrap(), 1);
        assert!(matches!(
            processor.add_workers(1).await,
            Err(AppError::MaxWorkersReached(2))
        ));
        processor.stop(Duration::from_secs(1)).await;
        assert_eq!(processor.worker_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scaling_with_cooldown() {
        let mut cfg = config(1, 4);
        cfg.priority_queue_capacity = 2;
        cfg.worker_scale_up_threshold = 0.5;
        cfg.worker_scale_down_threshold = 0.1;
        cfg.scale_batch_size = 2;
        cfg.scale_cooldown_seconds = 30.0;
        cfg.processing_timeout_seconds = 10_000.0;
        let processor = processor(cfg);
        processor
            .register_handler(
                MessageType::Chat,
                handler_fn(|_task: Task| async {
                    tokio::time::sleep(Duration::from_secs(5000)).await;
                    Ok(())
                }),
            )
            .await;

        for priority in Priority::ALL {
            processor.submit("s", None, chat("a"), priority).await.unwrap();
            processor.submit("s", None, chat("b"), priority).await.unwrap();
        }

        // 8 of 8 slots used, no workers yet
        assert_eq!(processor.evaluate_scaling().await, ScalingDecision::ScaleUp(2));
        tokio::task::yield_now().await;
        assert_eq!(processor.evaluate_scaling().await, ScalingDecision::CoolingDown);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(processor.evaluate_scaling().await, ScalingDecision::ScaleUp(2));
        assert_eq!(processor.worker_count().await, 4);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(processor.evaluate_scaling().await, ScalingDecision::Hold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_only_idle() {
        let mut cfg = config(1, 4);
        cfg.scale_batch_size = 10;
        let processor = processor(cfg);
        processor.start().await.unwrap();
        processor.add_workers(3).await.unwrap();
        assert_eq!(processor.worker_count().await, 4);

        assert_eq!(processor.evaluate_scaling().await, ScalingDecision::ScaleDown(3));
        assert_eq!(processor.worker_count().await, 1);
        processor.stop(Duration::from_secs(1)).await;
    }

    /// Handler that announces each start, then sleeps `work`
    async fn register_sleeper(
        processor: &MessageProcessor,
        work: Duration,
    ) -> (tokio::sync::mpsc::UnboundedReceiver<()>, Arc<AtomicUsize>) {
        let (started_tx, started_rx) = tokio::sync::mpsc::unbounded_channel();
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let finished = finished.clone();
            processor
                .register_handler(
                    MessageType::Chat,
                    handler_fn(move |_task: Task| {
                        let started_tx = started_tx.clone();
                        let finished = finished.clone();
                        async move {
                            let _ = started_tx.send(());
                            tokio::time::sleep(work).await;
                            finished.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await;
        }
        (started_rx, finished)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_handler_past_grace() {
        let mut cfg = config(1, 1);
        cfg.processing_timeout_seconds = 600.0;
        let processor = processor(cfg);
        let (mut started, finished) = register_sleeper(&processor, Duration::from_secs(30)).await;

        processor.start().await.unwrap();
        processor.submit("s1", None, chat("slow"), Priority::Normal).await.unwrap();
        started.recv().await.unwrap();

        let stopping = Instant::now();
        processor.stop(Duration::from_secs(2)).await;
        let waited = stopping.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(processor.stats().await.processed, 0);
        assert!(!processor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_handler_within_grace_finish() {
        let processor = processor(config(1, 1));
        let (mut started, finished) =
            register_sleeper(&processor, Duration::from_millis(500)).await;

        processor.start().await.unwrap();
        processor.submit("s1", None, chat("quick"), Priority::Normal).await.unwrap();
        started.recv().await.unwrap();

        let stopping = Instant::now();
        processor.stop(Duration::from_secs(2)).await;
        assert!(stopping.elapsed() < Duration::from_secs(2));

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(processor.stats().await.processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_queued_tasks_unexecuted() {
        let processor = processor(config(1, 1));
        let (mut started, finished) =
            register_sleeper(&processor, Duration::from_millis(500)).await;

        processor.start().await.unwrap();
        for i in 0..3 {
            processor
                .submit(&format!("s{}", i), None, chat("queued"), Priority::Normal)
                .await
                .unwrap();
        }
        started.recv().await.unwrap();
        processor.stop(Duration::from_secs(5)).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        let stats = processor.stats().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.total_queued, 2);
        assert!(started.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_task_success_reported_as_recovery() {
        let processor = processor(config(1, 1));
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            processor
                .register_handler(
                    MessageType::Chat,
                    handler_fn(move |_task: Task| {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(AppError::Network("reset".into()))
                            } else {
                                Ok(())
                            }
                        }
                    }),
                )
                .await;
        }

        processor.start().await.unwrap();
        processor.submit("s1", None, chat("flaky"), Priority::Normal).await.unwrap();
        let stats = wait_until_settled(&processor, 1).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.retried, 1);

        let errors = processor.inner.error_handler.metrics().await;
        assert_eq!(errors.recovery_attempts, 1);
        assert_eq!(errors.recovery_successes, 1);
        assert_eq!(errors.recovery_success_rate, 1.0);

        processor.stop(Duration::from_secs(1)).await;
    }
}
