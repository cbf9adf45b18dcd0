//! Identity and keying for reports, measurements and lock holders.
//!
//! Report and measurement identifiers are content hashes:
//! - **Deterministic**: equal inputs always produce equal ids, so re-running the
//!   same comparison updates its sections in place
//! - **Order-independent**: benchmarks are canonicalized and sorted before hashing
//! - **URL-safe**: base64url without padding, truncated to [`ID_LEN`] characters
//!
//! Holder ids are ULIDs generated once per negotiation.
//!
//! # Example
//!
//! ```rust
//! use tacho_core::id::{BenchmarkKey, BenchmarkSet, Measurement, MeasurementMode, ReportId};
//!
//! let set = BenchmarkSet::new(vec![
//!     BenchmarkKey::new("render", Measurement::new(MeasurementMode::Callback)),
//! ]);
//! let a = ReportId::derive(&set).unwrap();
//! let b = ReportId::derive(&set).unwrap();
//! assert_eq!(a, b);
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Length of derived report and measurement ids.
pub const ID_LEN: usize = 16;

const UNKNOWN_MEASUREMENT: &str = "unknown";

/// Per-invocation token identifying one lock claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(Ulid);

impl HolderId {
    /// Generates a new unique holder ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a holder ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HolderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid holder ID '{s}': {e}"),
            })
    }
}

/// Stable identifier for one logical report.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportId(String);

impl ReportId {
    /// Creates a report ID from an explicit value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or contains characters
    /// outside `[A-Za-z0-9_-]`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_token("report", &value)?;
        Ok(Self(value))
    }

    /// Derives the report ID from the identifying fields of a benchmark set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the set is empty or any measurement
    /// has no derivable name.
    pub fn derive(set: &BenchmarkSet) -> Result<Self> {
        if set.benchmarks.is_empty() {
            return Err(Error::InvalidInput(
                "cannot derive a report id from an empty benchmark set".into(),
            ));
        }

        let mut lines = set
            .benchmarks
            .iter()
            .map(BenchmarkKey::canonical_line)
            .collect::<Result<Vec<_>>>()?;
        lines.sort();
        lines.dedup();

        Ok(Self(short_hash(&lines.join("\n"))))
    }

    /// Returns the ID string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReportId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ReportId> for String {
    fn from(id: ReportId) -> Self {
        id.0
    }
}

/// Stable identifier for one measurement group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeasurementId(String);

impl MeasurementId {
    /// Derives the measurement ID from its canonical mode and name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the measurement has no derivable name.
    pub fn derive(measurement: &Measurement) -> Result<Self> {
        Ok(Self(short_hash(&measurement.canonical()?)))
    }

    /// Placeholder for reports whose measurement set is not known yet.
    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN_MEASUREMENT.to_string())
    }

    /// Returns true for the placeholder measurement.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_MEASUREMENT
    }

    /// Returns the ID string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MeasurementId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        validate_token("measurement", &value)?;
        Ok(Self(value))
    }
}

impl From<MeasurementId> for String {
    fn from(id: MeasurementId) -> Self {
        id.0
    }
}

/// How a benchmark measurement is taken.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum MeasurementMode {
    /// Time reported by the benchmark itself.
    Callback,
    /// First contentful paint.
    Fcp,
    /// A named performance entry.
    #[serde(rename_all = "camelCase")]
    Performance {
        /// Name of the performance entry.
        entry_name: String,
    },
    /// A page expression that evaluates to a number.
    Expression {
        /// The expression source.
        expression: String,
    },
    /// A mode this crate does not understand.
    Other {
        /// The raw mode string.
        kind: String,
    },
}

/// One measurement of a benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measurement {
    /// Explicit display name, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// How the measurement is taken.
    #[serde(flatten)]
    pub mode: MeasurementMode,
}

impl Measurement {
    /// Creates an unnamed measurement.
    #[must_use]
    pub fn new(mode: MeasurementMode) -> Self {
        Self { name: None, mode }
    }

    /// Sets an explicit display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the display name of this measurement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no name is configured and the mode
    /// has no default name.
    pub fn display_name(&self) -> Result<String> {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return Ok(name.to_string());
        }
        match &self.mode {
            MeasurementMode::Callback => Ok("callback".to_string()),
            MeasurementMode::Fcp => Ok("first-contentful-paint".to_string()),
            MeasurementMode::Performance { entry_name } if !entry_name.is_empty() => {
                Ok(entry_name.clone())
            }
            MeasurementMode::Expression { expression } if !expression.is_empty() => {
                Ok(expression.clone())
            }
            other => Err(Error::InvalidInput(format!(
                "cannot derive a name for measurement {other:?}"
            ))),
        }
    }

    fn canonical(&self) -> Result<String> {
        let mode = match &self.mode {
            MeasurementMode::Callback => "callback".to_string(),
            MeasurementMode::Fcp => "fcp".to_string(),
            MeasurementMode::Performance { entry_name } => format!("performance:{entry_name}"),
            MeasurementMode::Expression { expression } => format!("expression:{expression}"),
            MeasurementMode::Other { kind } => format!("other:{kind}"),
        };
        Ok(format!("mode={mode};name={}", self.display_name()?))
    }
}

/// Identifying fields of one benchmark in a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BenchmarkKey {
    /// Benchmark name.
    pub name: String,
    /// Version label (e.g. `this-change`, `tip-of-tree`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// What is measured.
    pub measurement: Measurement,
    /// Browser or environment key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl BenchmarkKey {
    /// Creates a benchmark key with no version or browser.
    #[must_use]
    pub fn new(name: impl Into<String>, measurement: Measurement) -> Self {
        Self {
            name: name.into(),
            version: None,
            measurement,
            browser: None,
        }
    }

    /// Sets the version label.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the browser key.
    #[must_use]
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    fn canonical_line(&self) -> Result<String> {
        Ok(format!(
            "name={};version={};measure={};browser={}",
            self.name,
            self.version.as_deref().unwrap_or(""),
            self.measurement.display_name()?,
            self.browser.as_deref().unwrap_or(""),
        ))
    }
}

/// The benchmarks compared by one report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BenchmarkSet {
    benchmarks: Vec<BenchmarkKey>,
}

impl BenchmarkSet {
    /// Creates a benchmark set.
    #[must_use]
    pub fn new(benchmarks: Vec<BenchmarkKey>) -> Self {
        Self { benchmarks }
    }

    /// Returns the benchmarks in input order.
    #[must_use]
    pub fn benchmarks(&self) -> &[BenchmarkKey] {
        &self.benchmarks
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(ID_LEN);
    encoded
}

fn validate_token(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} id must not be empty"),
        });
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidId {
            message: format!("{kind} id '{value}' contains invalid character '{bad}'"),
        });
    }
    Ok(())
}
