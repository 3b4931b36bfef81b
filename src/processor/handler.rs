use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{MessageType, Task};
use crate::error::AppResult;

/// Executes tasks of one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> AppResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = AppResult<()>> + Send,
{
    async fn handle(&self, task: &Task) -> AppResult<()> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a handler. The closure receives its own copy of
/// the task.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub(crate) enum Resolved {
    Registered(Arc<dyn MessageHandler>),
    Fallback(Arc<dyn MessageHandler>),
    Unhandled,
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    fallback: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub(crate) async fn register(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        tracing::debug!("Registered handler for {}", message_type);
        self.handlers.write().await.insert(message_type, handler);
    }

    pub(crate) async fn set_fallback(&self, handler: Arc<dyn MessageHandler>) {
        *self.fallback.write().await = Some(handler);
    }

    pub(crate) async fn resolve(&self, message_type: &MessageType) -> Resolved {
        if let Some(handler) = self.handlers.read().await.get(message_type) {
            return Resolved::Registered(handler.clone());
        }
        match self.fallback.read().await.as_ref() {
            Some(handler) => Resolved::Fallback(handler.clone()),
            None => Resolved::Unhandled,
        }
    }

    pub(crate) async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .await
            .keys()
            .map(|t| t.to_string())
            .collect();
        types.sort();
        types
    }
}
