//! Observability infrastructure for fanout.
//!
//! Structured logging with consistent spans. Every reconciliation pass runs
//! inside an `array_task` span so log lines from the job cache, the backend
//! client and the phase handlers can be correlated per task instance.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Environment variable selecting the [`LogFormat`].
pub const LOG_FORMAT_ENV: &str = "FANOUT_LOG_FORMAT";

/// Filter used when `RUST_LOG` is unset: reconciliation detail from the
/// fanout crates, warnings from everything else.
const DEFAULT_FILTER: &str = "warn,fanout_core=info,fanout_batch=info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for hosts that ship logs.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads [`LOG_FORMAT_ENV`], falling back to the default when unset or
    /// unrecognized.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!("unknown log format {other:?}"))),
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// Only the first call has any effect, so both a host and its embedded
/// executor may call it. `RUST_LOG` overrides the default filter.
///
/// # Example
///
/// ```rust
/// use fanout_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::from_env());
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let registry = tracing_subscriber::registry().with(env_filter);
        match format {
            LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Creates a span for one reconciliation pass of an array task.
///
/// # Example
///
/// ```rust
/// use fanout_core::observability::array_task_span;
///
/// let span = array_task_span("handle", "task-abc-0", "Launch");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn array_task_span(operation: &str, task_name: &str, phase: &str) -> Span {
    tracing::info_span!(
        "array_task",
        op = operation,
        task = task_name,
        phase = phase,
    )
}

/// Creates a span for a call against the remote batch backend.
#[must_use]
pub fn backend_span(operation: &str) -> Span {
    tracing::debug_span!("batch_backend", op = operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_names() {
        assert_eq!("json".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!(" JSON ".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>().ok(), Some(LogFormat::Pretty));
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn array_task_span_can_be_entered() {
        let span = array_task_span("handle", "task-1", "Start");
        let _guard = span.enter();
        tracing::info!("inside array task span");
    }

    #[test]
    fn backend_span_can_be_entered() {
        let span = backend_span("describe_jobs");
        let _guard = span.enter();
        tracing::debug!("inside backend span");
    }
}
