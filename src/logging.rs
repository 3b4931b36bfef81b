//! Tracing setup for the binary.
//!
//! The library only emits through `tracing` macros; installing a subscriber is
//! left to the host process.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::processor::Task;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    Ok(())
}

/// Span wrapping one execution attempt of a task.
pub fn task_span(task: &Task, worker_id: usize) -> tracing::Span {
    tracing::info_span!(
        "task",
        task_id = %task.task_id,
        session_id = %task.session_id,
        message_type = %task.message.message_type,
        priority = %task.priority,
        attempt = task.retry_count + 1,
        worker_id,
    )
}
