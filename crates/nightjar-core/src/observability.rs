//! Observability infrastructure for Nightjar.
//!
//! Structured logging with consistent fields. Every log line emitted by
//! the worker carries `worker_id` and `instance_id` via spans so that a
//! fleet's interleaved output can be split per replica.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `nightjar_worker=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one replica's run loop.
#[must_use]
pub fn worker_span(worker_id: &str, instance_id: &str) -> Span {
    tracing::info_span!("worker", worker_id = worker_id, instance_id = instance_id)
}

/// Creates a span for one output file's fan-out branch.
#[must_use]
pub fn file_span(worker_id: &str, file_id: &str, page: u64) -> Span {
    tracing::info_span!("file", worker_id = worker_id, file_id = file_id, page = page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn spans_carry_fields() {
        let span = worker_span("LoanWorker", "01H");
        let _guard = span.enter();
        tracing::info!("inside worker span");

        let span = file_span("LoanWorker", "loans-csv", 3);
        let _guard = span.enter();
        tracing::info!("inside file span");
    }
}
