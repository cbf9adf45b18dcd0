//! Logging initialization and span helpers.
//!
//! Everything logs through `tracing`. Binaries and test harnesses call
//! [`init_logging`] once; library code only opens spans.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::{HolderId, ReportId};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for CI log collectors).
    Json,
    /// Pretty-printed logs (for local runs).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses `json` or `pretty` (case-insensitive). Anything else is `Pretty`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at startup. Subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tacho_core::lock=debug`)
///
/// # Example
///
/// ```rust
/// use tacho_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber may already be installed by the embedding process.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates the span wrapping one lock negotiation.
#[must_use]
pub fn negotiation_span(holder: &HolderId) -> Span {
    tracing::info_span!("negotiation", holder_id = %holder)
}

/// Creates the span wrapping one publish of a job's report.
///
/// # Example
///
/// ```rust
/// use tacho_core::id::ReportId;
/// use tacho_core::observability::publish_span;
///
/// let report = ReportId::new("abc123").unwrap();
/// let span = publish_span(&report, 42, 0);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn publish_span(report_id: &ReportId, run_number: u64, job_index: u32) -> Span {
    tracing::info_span!(
        "publish",
        report_id = report_id.as_str(),
        run_number = run_number,
        job_index = job_index,
    )
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
    fn log_format_parses_loosely() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Pretty);
    }

    #[test]
    fn spans_can_be_entered() {
        let span = negotiation_span(&HolderId::generate());
        let _guard = span.enter();
        tracing::info!("inside negotiation");

        let report = ReportId::new("r1").expect("id");
        let span = publish_span(&report, 7, 2);
        let _guard = span.enter();
        tracing::info!("inside publish");
    }
}
