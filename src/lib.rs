//! Connection and message lifecycle layer for realtime messaging.
//!
//! The [`RealtimeService`] composes a connection pool, a priority message
//! processor, a two-tier cache, a health-aware load balancer and an error
//! handler with recovery strategies and circuit breakers.

pub mod balancer;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod health;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod prometheus;
pub mod rate_limit;
pub mod routes;
pub mod service;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use processor::{handler_fn, Message, MessageHandler, MessageType, Priority, Task};
pub use service::{BroadcastFilter, BroadcastReport, RealtimeService, ServiceMetrics};
