use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::handler::Resolved;
use super::metrics::ProcessorMetrics;
use super::{Inner, Task};
use crate::error::AppError;
use crate::error_handler::ErrorContext;
use crate::logging::task_span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Error,
    Stopping,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Busy,
            2 => WorkerState::Error,
            _ => WorkerState::Stopping,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Busy => 1,
            WorkerState::Error => 2,
            WorkerState::Stopping => 3,
        }
    }
}

/// Per-worker counters shared between the worker task and the processor
pub(crate) struct WorkerShared {
    state: AtomicU8,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    processing_us: AtomicU64,
    started_at: Instant,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            processing_us: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn record(&self, elapsed: Duration, success: bool) {
        self.processing_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if success {
            self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: usize,
    pub state: WorkerState,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub total_processing_time_ms: f64,
    pub uptime_seconds: f64,
}

pub(crate) struct WorkerHandle {
    pub(crate) id: usize,
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) stop: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(inner: Arc<Inner>, id: usize) -> Self {
        let shared = Arc::new(WorkerShared::new());
        // cancelled by processor shutdown as well as by scale-down
        let stop = inner.shutdown.child_token();
        let join = tokio::spawn(run(inner, id, shared.clone(), stop.clone()));

        Self {
            id,
            shared,
            stop,
            join,
        }
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.id,
            state: self.shared.state(),
            tasks_processed: self.shared.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.shared.tasks_failed.load(Ordering::Relaxed),
            total_processing_time_ms: self.shared.processing_us.load(Ordering::Relaxed) as f64
                / 1000.0,
            uptime_seconds: self.shared.started_at.elapsed().as_secs_f64(),
        }
    }
}

async fn run(inner: Arc<Inner>, id: usize, shared: Arc<WorkerShared>, stop: CancellationToken) {
    tracing::debug!("Worker {} started", id);

    loop {
        shared.set_state(WorkerState::Idle);
        let task = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            task = inner.queues.pop_wait() => task,
        };

        shared.set_state(WorkerState::Busy);
        let span = task_span(&task, id);
        process(&inner, &shared, task).instrument(span).await;
    }

    shared.set_state(WorkerState::Stopping);
    tracing::debug!("Worker {} stopped", id);
}

async fn process(inner: &Inner, shared: &WorkerShared, mut task: Task) {
    let handler = match inner.handlers.resolve(&task.message.message_type).await {
        Resolved::Registered(handler) => handler,
        Resolved::Fallback(handler) => {
            tracing::debug!("Using fallback handler for {}", task.message.message_type);
            handler
        }
        Resolved::Unhandled => {
            // configuration error on the caller's side: drop, never retry
            tracing::warn!(
                "No handler for message type '{}', dropping task {}",
                task.message.message_type,
                task.task_id
            );
            ProcessorMetrics::incr(&inner.metrics.dropped);
            let error = AppError::NoHandler(task.message.message_type.to_string());
            inner
                .error_handler
                .record_error(&error, task_context(&task))
                .await;
            return;
        }
    };

    task.started_at = Some(Utc::now());
    let timeout = inner.config.processing_timeout();
    let started = Instant::now();

    let result = match tokio::time::timeout(timeout, handler.handle(&task)).await {
        Ok(result) => result,
        Err(_) => {
            ProcessorMetrics::incr(&inner.metrics.timeouts);
            Err(AppError::Timeout(format!(
                "task {} exceeded {:?}",
                task.task_id, timeout
            )))
        }
    };
    let elapsed = started.elapsed();
    shared.record(elapsed, result.is_ok());

    match result {
        Ok(()) => {
            task.completed_at = Some(Utc::now());
            if let Some(error_id) = task.recovery_id {
                inner
                    .error_handler
                    .record_recovery_result(error_id, true)
                    .await;
            }
            inner.metrics.record_processed(elapsed);
            tracing::debug!("Task {} completed in {:?}", task.task_id, elapsed);
        }
        Err(error) => {
            shared.set_state(WorkerState::Error);
            handle_failure(inner, task, error).await;
        }
    }
}

fn task_context(task: &Task) -> ErrorContext {
    ErrorContext::new("processor.task")
        .with_session(task.session_id.clone())
        .with_user(task.user_id.as_deref())
        .with_task(task.task_id.to_string())
}

/// Retry on the same queue after backoff, or mark terminal
async fn handle_failure(inner: &Inner, mut task: Task, error: AppError) {
    let context = task_context(&task)
        .with_retry_delay(inner.config.retry_delay(task.retry_count))
        .allow_recovery(task.can_retry());
    let outcome = inner.error_handler.handle_error(&error, context).await;

    if outcome.retry && task.can_retry() {
        task.retry_count += 1;
        task.recovery_id = Some(outcome.error_id);
        task.started_at = None;
        let task_id = task.task_id;
        let attempt = task.retry_count + 1;

        match inner.queues.push(task).await {
            Ok(()) => {
                ProcessorMetrics::incr(&inner.metrics.retried);
                tracing::info!("Task {} re-queued for attempt {}", task_id, attempt);
            }
            Err(push_error) => {
                ProcessorMetrics::incr(&inner.metrics.failed);
                tracing::warn!("Task {} could not be re-queued: {}", task_id, push_error);
                inner
                    .error_handler
                    .record_error(&push_error, ErrorContext::new("processor.retry"))
                    .await;
            }
        }
    } else {
        ProcessorMetrics::incr(&inner.metrics.failed);
        tracing::warn!(
            "Task {} failed permanently after {} attempts: {}",
            task.task_id,
            task.retry_count + 1,
            error
        );
    }
}
