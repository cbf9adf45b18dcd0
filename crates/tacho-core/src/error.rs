//! Error types and result aliases for tacho.
//!
//! Errors fall into three groups that callers treat differently:
//! - **Input errors** (`InvalidId`, `InvalidInput`) are fatal and never retried.
//! - **Store errors** (`Store`) are transient and retried within a phase budget.
//! - **Protocol timeouts** (`CreationTimeout`, `AcquisitionTimeout`) end a
//!   publish attempt without writing anything.

use std::fmt;
use std::time::Duration;

/// The result type used throughout tacho.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tacho operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A record store call failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No record carrying the identity marker appeared within the creation budget.
    #[error("Timed out waiting for record to be created (waited {elapsed:?})")]
    CreationTimeout {
        /// How long the negotiator waited in the creation phase.
        elapsed: Duration,
    },

    /// The record stayed held by another holder for the whole acquisition budget.
    #[error("Timed out waiting to acquire lock (waited {elapsed:?})")]
    AcquisitionTimeout {
        /// How long the negotiator waited in the acquisition phase.
        elapsed: Duration,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new store error with the given message.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store error with a source cause.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not found error for a record id.
    #[must_use]
    pub fn record_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound(format!("record {id}"))
    }

    /// Returns true for failures the negotiator retries within its budget.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::NotFound(_))
    }

    /// Returns true for protocol timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CreationTimeout { .. } | Self::AcquisitionTimeout { .. }
        )
    }
}
