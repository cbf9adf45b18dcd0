//! One job's contribution to the shared record.

use serde::{Deserialize, Serialize};

use tacho_core::error::{Error, Result};
use tacho_core::id::{MeasurementId, ReportId};
use tacho_core::markup;

/// Rendered summary for one measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryFragment {
    /// Measurement this summary belongs to.
    pub measurement_id: MeasurementId,
    /// Display name of the measurement; names the summary group.
    pub measurement_name: String,
    /// Pre-rendered markup.
    pub markup: String,
}

/// A job's report, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Report id; sections are keyed by it.
    pub id: ReportId,
    /// Monotonic workflow run number.
    pub run_number: u64,
    /// Tie-break ordering key among sections with equal titles.
    #[serde(default)]
    pub job_index: u32,
    /// Section title; primary ordering key.
    pub title: String,
    /// Whether the benchmarks are still running.
    #[serde(default)]
    pub running: bool,
    /// Pre-rendered results markup.
    #[serde(default)]
    pub body: String,
    /// Per-measurement summaries.
    #[serde(default)]
    pub summaries: Vec<SummaryFragment>,
}

impl Report {
    /// Creates a complete report with an empty body.
    #[must_use]
    pub fn new(id: ReportId, title: impl Into<String>, run_number: u64) -> Self {
        Self {
            id,
            run_number,
            job_index: 0,
            title: title.into(),
            running: false,
            body: String::new(),
            summaries: Vec::new(),
        }
    }

    /// Sets the job index.
    #[must_use]
    pub fn with_job_index(mut self, job_index: u32) -> Self {
        self.job_index = job_index;
        self
    }

    /// Marks the report as still running.
    #[must_use]
    pub fn running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    /// Sets the results markup.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a summary fragment.
    #[must_use]
    pub fn with_summary(
        mut self,
        measurement_id: MeasurementId,
        measurement_name: impl Into<String>,
        markup: impl Into<String>,
    ) -> Self {
        self.summaries.push(SummaryFragment {
            measurement_id,
            measurement_name: measurement_name.into(),
            markup: markup.into(),
        });
        self
    }

    /// Returns true if any summary is keyed by a real measurement.
    #[must_use]
    pub fn has_known_measurements(&self) -> bool {
        self.summaries
            .iter()
            .any(|s| !s.measurement_id.is_unknown())
    }

    /// Checks that the report can be merged without corrupting the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the title or a measurement name is
    /// empty, or any text field contains a fence prefix.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidInput("report title cannot be empty".into()));
        }
        reject_fences("title", &self.title)?;
        reject_fences("body", &self.body)?;
        for summary in &self.summaries {
            if summary.measurement_name.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "summary for measurement {} has no name",
                    summary.measurement_id
                )));
            }
            reject_fences("measurement name", &summary.measurement_name)?;
            reject_fences("summary", &summary.markup)?;
        }
        Ok(())
    }
}

fn reject_fences(field: &str, text: &str) -> Result<()> {
    if markup::contains_fence(text) {
        return Err(Error::InvalidInput(format!(
            "report {field} must not contain `{}` or `{}`",
            markup::OPEN_PREFIX,
            markup::CLOSE_PREFIX
        )));
    }
    if has_unterminated_comment(text) {
        return Err(Error::InvalidInput(format!(
            "report {field} contains an unterminated HTML comment"
        )));
    }
    Ok(())
}

// An open comment would swallow the fence that follows the fragment.
fn has_unterminated_comment(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        let after = &rest[start + 4..];
        match after.find("-->") {
            Some(end) => rest = &after[end + 3..],
            None => return true,
        }
    }
    false
}
