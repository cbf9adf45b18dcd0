//! # tacho-report
//!
//! Report layout, idempotent merge and publishing for the shared benchmark
//! record.
//!
//! - **Report**: one job's immutable contribution
//! - **Document**: the fence-structured view of a record body
//! - **Merge**: computes the next body from the previous body and one report
//! - **Publisher**: negotiates the lock, merges and writes
//!
//! ## Example
//!
//! ```rust,ignore
//! use tacho_report::prelude::*;
//!
//! let publisher = Publisher::new(store, PublishOptions::from_env()?)?;
//! let report = Report::new(ReportId::derive(&benchmarks)?, "Startup time", run_number)
//!     .with_body(results_table);
//! publisher.publish(&report).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod document;
pub mod merge;
pub mod metrics;
pub mod publish;
pub mod report;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::PublishOptions;
    pub use crate::document::{Document, IDENTITY_MARKER, Section, Status, SummaryGroup};
    pub use crate::merge::{MergeOptions, MergeOutcome, merge, merge_document};
    pub use crate::publish::Publisher;
    pub use crate::report::{Report, SummaryFragment};
    pub use tacho_core::prelude::*;
}
