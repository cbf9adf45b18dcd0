//! Shared test utilities for tacho integration tests.
//!
//! This crate provides:
//! - [`SimulatedStore`]: Record store with latency, read lag, fault injection
//!   and operation recording
//! - [`ScriptedJitter`]: Replays fixed backoff delays
//! - Factory functions for reports and protocol settings
//!
//! # Example
//!
//! ```rust,ignore
//! use tacho_test_utils::{ReportFactory, SimulatedStore, publish_options};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let store = Arc::new(SimulatedStore::new());
//!     let publisher = Publisher::new(store.clone(), publish_options(Initialize::Create))?;
//!     publisher.publish(&ReportFactory::complete("a", "A", 1)).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod simulation;

pub use fixtures::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tacho_core=debug".parse().expect("valid directive"))
                .add_directive("tacho_report=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
