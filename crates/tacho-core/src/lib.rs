//! # tacho-core
//!
//! Core abstractions for publishing benchmark results from many concurrent CI
//! jobs into one shared record on a hosting service that offers no atomic
//! update primitive.
//!
//! This crate provides the foundational types and the coordination protocol:
//!
//! - **Record Store**: The four-call contract of the hosting service's comment API
//! - **Identifiers**: Content-derived report and measurement ids, per-invocation holder ids
//! - **Markup**: The fence format embedded in record bodies, including the lock marker
//! - **Lock Negotiation**: Mutual exclusion on top of a store without compare-and-swap
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `tacho-core` knows nothing about report layout. Document structure and the
//! merge engine live in `tacho-report`, which drives the negotiator defined
//! here.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tacho_core::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let ctx = NegotiationContext::new("<!-- tacho:identity /-->", "initial body")
//!     .with_initialize(Initialize::Create);
//! let lock = Negotiator::new(store, ctx).run().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod lock;
pub mod markup;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tacho_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, Jitter, RandomJitter, TokioClock};
    pub use crate::config::{BackoffWindow, Initialize, ProtocolTimings};
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        BenchmarkKey, BenchmarkSet, HolderId, Measurement, MeasurementId, MeasurementMode,
        ReportId,
    };
    pub use crate::lock::{
        AcquiredLock, NegotiationContext, NegotiationState, NegotiationStats, Negotiator, Phase,
    };
    pub use crate::store::{MemoryStore, Record, RecordId, RecordStore, find_ours};
}

pub use error::{Error, Result};
