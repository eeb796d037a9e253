//! Logging initialization using tracing.

use std::time::Instant;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```
/// vmforge_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Logs the duration of a named operation on a VM.
///
/// Emits one event when finished explicitly, or a warning if dropped
/// without being finished (the operation bailed out early).
pub struct TimedOperation {
    operation: &'static str,
    vm_name: String,
    started: Instant,
    finished: bool,
}

impl TimedOperation {
    /// Start timing `operation` for `vm_name`.
    pub fn start(operation: &'static str, vm_name: impl Into<String>) -> Self {
        Self {
            operation,
            vm_name: vm_name.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Mark the operation as completed and log its duration.
    pub fn finish(mut self) {
        self.finished = true;
        info!(
            operation = self.operation,
            vm_name = %self.vm_name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                operation = self.operation,
                vm_name = %self.vm_name,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Operation did not complete"
            );
        }
    }
}
