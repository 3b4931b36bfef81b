use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

use super::{Priority, Task};
use crate::error::{AppError, AppResult};

/// Four bounded FIFO queues served in strict priority order.
///
/// A full queue rejects; tasks never spill into another priority.
pub(crate) struct PriorityQueues {
    queues: Mutex<[VecDeque<Task>; 4]>,
    capacity: usize,
    notify: Notify,
}

impl PriorityQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(Default::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) async fn push(&self, task: Task) -> AppResult<()> {
        {
            let mut queues = self.queues.lock().await;
            let queue = &mut queues[task.priority.index()];
            if queue.len() >= self.capacity {
                return Err(AppError::QueueFull {
                    priority: task.priority,
                    capacity: self.capacity,
                });
            }
            queue.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Front of the highest non-empty priority
    pub(crate) async fn pop(&self) -> Option<Task> {
        let mut queues = self.queues.lock().await;
        queues.iter_mut().find_map(|q| q.pop_front())
    }

    /// Wait for the next task. Cancel safe: a task is only taken in the
    /// same poll that returns it.
    pub(crate) async fn pop_wait(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop().await {
                return task;
            }
            notified.await;
        }
    }

    pub(crate) async fn depths(&self) -> [usize; 4] {
        let queues = self.queues.lock().await;
        [
            queues[0].len(),
            queues[1].len(),
            queues[2].len(),
            queues[3].len(),
        ]
    }

    /// Share of total capacity in use across all four queues
    pub(crate) async fn utilization(&self) -> f64 {
        let total: usize = self.depths().await.iter().sum();
        total as f64 / (self.capacity * Priority::ALL.len()) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Message;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(session: &str, priority: Priority) -> Task {
        Task::new(
            session,
            None,
            Message::new("chat", serde_json::Value::Null),
            priority,
            0,
        )
    }

    #[tokio::test]
    async fn test_strict_precedence_and_fifo() {
        let queues = PriorityQueues::new(10);
        queues.push(task("low-1", Priority::Low)).await.unwrap();
        queues.push(task("normal-1", Priority::Normal)).await.unwrap();
        queues.push(task("low-2", Priority::Low)).await.unwrap();
        queues.push(task("critical-1", Priority::Critical)).await.unwrap();
        queues.push(task("high-1", Priority::High)).await.unwrap();
        queues.push(task("critical-2", Priority::Critical)).await.unwrap();

        let mut order = Vec::new();
        while let Some(t) = queues.pop().await {
            order.push(t.session_id);
        }
        assert_eq!(
            order,
            vec!["critical-1", "critical-2", "high-1", "normal-1", "low-1", "low-2"]
        );
    }

    #[tokio::test]
    async fn test_full_queue_does_not_spill() {
        let queues = PriorityQueues::new(1);
        queues.push(task("a", Priority::Low)).await.unwrap();
        let err = queues.push(task("b", Priority::Low)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::QueueFull {
                priority: Priority::Low,
                capacity: 1
            }
        ));
        // other priorities are unaffected
        queues.push(task("c", Priority::High)).await.unwrap();
        assert_eq!(queues.depths().await, [0, 1, 0, 1]);
        assert_eq!(queues.utilization().await, 0.5);
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let queues = Arc::new(PriorityQueues::new(4));
        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.pop_wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queues.push(task("late", Priority::Normal)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.session_id, "late");
    }
}
