//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create reports and protocol settings with
//! sensible defaults.

use std::time::Duration;

use tacho_core::config::{BackoffWindow, Initialize, ProtocolTimings};
use tacho_core::id::{BenchmarkKey, BenchmarkSet, Measurement, MeasurementId, MeasurementMode, ReportId};
use tacho_core::lock::NegotiationContext;
use tacho_report::config::PublishOptions;
use tacho_report::document::{Document, IDENTITY_MARKER};
use tacho_report::report::Report;

/// Short protocol timings so virtual-time tests stay readable.
///
/// Poll 100ms, hold 500ms, 10s budgets, creation backoff 200-600ms,
/// acquisition backoff 100-300ms.
#[must_use]
pub fn fast_timings() -> ProtocolTimings {
    ProtocolTimings {
        poll_interval: Duration::from_millis(100),
        min_hold: Duration::from_millis(500),
        creation_timeout: Duration::from_secs(10),
        acquisition_timeout: Duration::from_secs(10),
        creation_backoff: BackoffWindow::new(Duration::from_millis(200), Duration::from_millis(600)),
        acquisition_backoff: BackoffWindow::new(
            Duration::from_millis(100),
            Duration::from_millis(300),
        ),
        elect_after_searches: 2,
    }
}

/// Negotiation context over the report skeleton with [`fast_timings`].
#[must_use]
pub fn negotiation_context(initialize: Initialize) -> NegotiationContext {
    NegotiationContext::new(IDENTITY_MARKER, Document::skeleton().render())
        .with_initialize(initialize)
        .with_timings(fast_timings())
}

/// Publish options with [`fast_timings`].
#[must_use]
pub fn publish_options(initialize: Initialize) -> PublishOptions {
    PublishOptions {
        initialize,
        timings: fast_timings(),
        ..PublishOptions::default()
    }
}

/// Factory for creating test reports.
pub struct ReportFactory;

impl ReportFactory {
    /// Creates a complete report with a recognizable body.
    #[must_use]
    pub fn complete(id: &str, title: &str, run: u64) -> Report {
        Report::new(ReportId::new(id).expect("valid report id"), title, run)
            .with_body(format!("<p>{title} run {run}</p>"))
    }

    /// Creates a running report with a placeholder summary.
    #[must_use]
    pub fn running(id: &str, title: &str, run: u64) -> Report {
        Report::new(ReportId::new(id).expect("valid report id"), title, run)
            .running(true)
            .with_body("<p>running…</p>")
            .with_summary(MeasurementId::unknown(), "unknown", "<p>pending</p>")
    }

    /// Creates a complete report with a first-contentful-paint summary, keyed
    /// by ids derived from its benchmark set.
    #[must_use]
    pub fn measured(benchmark: &str, title: &str, run: u64) -> Report {
        let measurement = Measurement::new(MeasurementMode::Fcp);
        let set = BenchmarkSet::new(vec![BenchmarkKey::new(benchmark, measurement.clone())]);
        let measurement_id = MeasurementId::derive(&measurement).expect("derivable measurement");
        let name = measurement.display_name().expect("named measurement");
        Report::new(ReportId::derive(&set).expect("derivable report id"), title, run)
            .with_body(format!("<table><tr><td>{benchmark}</td></tr></table>"))
            .with_summary(measurement_id, name, format!("<p>{benchmark}: 1.00ms</p>"))
    }

    /// Creates `count` complete reports with distinct ids and titles.
    #[must_use]
    pub fn batch(count: usize, run: u64) -> Vec<Report> {
        (0..count)
            .map(|i| {
                Self::complete(&format!("job-{i}"), &format!("Benchmark {i:02}"), run)
                    .with_job_index(u32::try_from(i).expect("small batch"))
            })
            .collect()
    }
}
