//! Publisher metrics.
//!
//! Complements the structured logs with counters a CI dashboard can
//! aggregate across jobs. Recording is a no-op until the host installs a
//! `metrics` recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::merge::MergeOutcome;

// ============================================================================
// Publish Metrics
// ============================================================================

/// Publishes by outcome (`created`, `updated`, `stale`, `timeout`, `error`).
pub const PUBLISHES: &str = "tacho_publishes_total";

/// Sections skipped because the record already held a newer run.
pub const STALE_SECTIONS: &str = "tacho_stale_sections_total";

// ============================================================================
// Negotiation Metrics
// ============================================================================

/// Times a written lock marker was observed replaced by another holder.
pub const LOCK_LOSSES: &str = "tacho_lock_losses_total";

/// Time from negotiation start to acquisition or timeout.
pub const NEGOTIATION_WAIT: &str = "tacho_negotiation_wait_seconds";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all publisher metric descriptions.
///
/// Call this once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(PUBLISHES, "Total publishes by outcome");
    describe_counter!(STALE_SECTIONS, "Total sections skipped as stale");
    describe_counter!(LOCK_LOSSES, "Total lock losses during negotiation");
    describe_histogram!(NEGOTIATION_WAIT, "Lock negotiation wait in seconds");
}

/// Outcome label of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This job created the record.
    Created,
    /// This job updated an existing record.
    Updated,
    /// Every section already held a newer run.
    Stale,
    /// Negotiation ran out of budget.
    Timeout,
    /// Any other failure.
    Error,
}

impl PublishOutcome {
    /// Returns the metric label value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Stale => "stale",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Records the end of a publish.
pub fn record_publish(outcome: PublishOutcome) {
    counter!(PUBLISHES, "outcome" => outcome.as_str()).increment(1);
}

/// Records what a merge skipped.
pub fn record_merge(outcome: &MergeOutcome) {
    if outcome.stale > 0 {
        counter!(STALE_SECTIONS).increment(u64::try_from(outcome.stale).unwrap_or(u64::MAX));
    }
}

/// Records negotiation cost.
pub fn record_negotiation(phase: &str, lock_losses: u32, waited: Duration) {
    if lock_losses > 0 {
        counter!(LOCK_LOSSES).increment(u64::from(lock_losses));
    }
    histogram!(NEGOTIATION_WAIT, "phase" => phase.to_string()).record(waited.as_secs_f64());
}
