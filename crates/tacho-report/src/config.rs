//! Publisher configuration.
//!
//! Options come from the CI step's inputs, exposed to the process as
//! environment variables. Every variable is optional; unset or blank values
//! keep the defaults.

use std::time::Duration;

use tacho_core::config::{BackoffWindow, Initialize, ProtocolTimings};
use tacho_core::error::{Error, Result};
use tacho_core::id::ReportId;

use crate::merge::MergeOptions;

/// Explicit report id override.
pub const ENV_REPORT_ID: &str = "TACHO_REPORT_ID";
/// `true` (create), `false` (wait) or unset (infer).
pub const ENV_INITIALIZE: &str = "TACHO_INITIALIZE";
/// Archive replaced result sections.
pub const ENV_KEEP_OLD_RESULTS: &str = "TACHO_KEEP_OLD_RESULTS";
/// Expand newly inserted result sections.
pub const ENV_DEFAULT_OPEN: &str = "TACHO_DEFAULT_OPEN";
/// Hold confirmation interval.
pub const ENV_POLL_INTERVAL_MS: &str = "TACHO_POLL_INTERVAL_MS";
/// Confirmed hold required before writing.
pub const ENV_MIN_HOLD_MS: &str = "TACHO_MIN_HOLD_MS";
/// Budget for the record to appear.
pub const ENV_CREATION_TIMEOUT_MS: &str = "TACHO_CREATION_TIMEOUT_MS";
/// Budget for acquiring the lock.
pub const ENV_ACQUISITION_TIMEOUT_MS: &str = "TACHO_ACQUISITION_TIMEOUT_MS";
/// Lower bound of the acquisition backoff window.
pub const ENV_BACKOFF_MIN_MS: &str = "TACHO_BACKOFF_MIN_MS";
/// Upper bound of the acquisition backoff window.
pub const ENV_BACKOFF_MAX_MS: &str = "TACHO_BACKOFF_MAX_MS";
/// Lower bound of the creation backoff window.
pub const ENV_CREATION_BACKOFF_MIN_MS: &str = "TACHO_CREATION_BACKOFF_MIN_MS";
/// Upper bound of the creation backoff window.
pub const ENV_CREATION_BACKOFF_MAX_MS: &str = "TACHO_CREATION_BACKOFF_MAX_MS";
/// Failed searches before an inferred initializer creates the record.
pub const ENV_ELECT_AFTER_SEARCHES: &str = "TACHO_ELECT_AFTER_SEARCHES";

/// Options for [`crate::publish::Publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Overrides the report id of every published report.
    pub report_id: Option<ReportId>,
    /// Creation eagerness of this job.
    pub initialize: Initialize,
    /// Archive replaced result sections instead of discarding them.
    pub keep_old_results: bool,
    /// Initial `open` state of newly inserted result sections.
    pub default_open: bool,
    /// Lock negotiation timings.
    pub timings: ProtocolTimings,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            report_id: None,
            initialize: Initialize::Infer,
            keep_old_results: false,
            default_open: false,
            timings: ProtocolTimings::default(),
        }
    }
}

impl PublishOptions {
    /// Loads options from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed, or the
    /// resulting timings are inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads options through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed, or the
    /// resulting timings are inconsistent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Lookup(&lookup);
        let mut options = Self::default();

        if let Some(id) = env.string(ENV_REPORT_ID) {
            options.report_id = Some(ReportId::new(id)?);
        }
        options.initialize = Initialize::from_flag(env.bool(ENV_INITIALIZE)?);
        if let Some(keep) = env.bool(ENV_KEEP_OLD_RESULTS)? {
            options.keep_old_results = keep;
        }
        if let Some(open) = env.bool(ENV_DEFAULT_OPEN)? {
            options.default_open = open;
        }

        let timings = &mut options.timings;
        if let Some(d) = env.millis(ENV_POLL_INTERVAL_MS)? {
            timings.poll_interval = d;
        }
        if let Some(d) = env.millis(ENV_MIN_HOLD_MS)? {
            timings.min_hold = d;
        }
        if let Some(d) = env.millis(ENV_CREATION_TIMEOUT_MS)? {
            timings.creation_timeout = d;
        }
        if let Some(d) = env.millis(ENV_ACQUISITION_TIMEOUT_MS)? {
            timings.acquisition_timeout = d;
        }
        timings.acquisition_backoff =
            env.window(ENV_BACKOFF_MIN_MS, ENV_BACKOFF_MAX_MS, timings.acquisition_backoff)?;
        timings.creation_backoff = env.window(
            ENV_CREATION_BACKOFF_MIN_MS,
            ENV_CREATION_BACKOFF_MAX_MS,
            timings.creation_backoff,
        )?;
        if let Some(n) = env.u32(ENV_ELECT_AFTER_SEARCHES)? {
            timings.elect_after_searches = n;
        }

        options.validate()?;
        Ok(options)
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the timings are inconsistent.
    pub fn validate(&self) -> Result<()> {
        self.timings.validate()
    }

    /// Returns the merge toggles.
    #[must_use]
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            keep_old_results: self.keep_old_results,
            default_open: self.default_open,
        }
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| Error::InvalidInput(format!("{name} must be milliseconds: {e}")))
    }

    fn window(&self, min: &str, max: &str, current: BackoffWindow) -> Result<BackoffWindow> {
        Ok(BackoffWindow::new(
            self.millis(min)?.unwrap_or(current.min),
            self.millis(max)?.unwrap_or(current.max),
        ))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
