//! Negotiation protocol configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default interval between hold confirmations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default confirmed-hold duration before the lock counts as acquired.
pub const DEFAULT_MIN_HOLD: Duration = Duration::from_millis(2500);

/// Default budget for the record to appear.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for acquiring the lock on an existing record.
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);

/// Failed searches after which an inferred initializer creates the record.
pub const DEFAULT_ELECT_AFTER_SEARCHES: u32 = 2;

/// Inclusive range that randomized backoff delays are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffWindow {
    /// Shortest delay.
    pub min: Duration,
    /// Longest delay.
    pub max: Duration,
}

impl BackoffWindow {
    /// Creates a backoff window.
    #[must_use]
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

/// Whether this invocation should create the record when none exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initialize {
    /// Designated initializer: create as soon as no record is found.
    Create,
    /// Never create; wait for another job to do it.
    Wait,
    /// Not designated: create only after repeated failed searches.
    #[default]
    Infer,
}

impl Initialize {
    /// Maps the tri-state `initialize` option (`true`/`false`/unset).
    #[must_use]
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Create,
            Some(false) => Self::Wait,
            None => Self::Infer,
        }
    }
}

/// Timing parameters of the lock negotiation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    /// Wait between hold confirmations; also the transient-error retry delay.
    pub poll_interval: Duration,
    /// Confirmed-hold time required before the lock counts as acquired.
    pub min_hold: Duration,
    /// Budget for the record to exist, measured from negotiation start.
    pub creation_timeout: Duration,
    /// Budget for acquiring the lock, measured from first entry into acquisition.
    pub acquisition_timeout: Duration,
    /// Backoff between searches for a record that does not exist yet.
    pub creation_backoff: BackoffWindow,
    /// Backoff while the record is held by another holder.
    pub acquisition_backoff: BackoffWindow,
    /// Failed searches after which an inferred initializer elects itself.
    pub elect_after_searches: u32,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_hold: DEFAULT_MIN_HOLD,
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            creation_backoff: BackoffWindow::new(Duration::from_secs(1), Duration::from_secs(3)),
            acquisition_backoff: BackoffWindow::new(
                Duration::from_millis(500),
                Duration::from_millis(1500),
            ),
            elect_after_searches: DEFAULT_ELECT_AFTER_SEARCHES,
        }
    }
}

impl ProtocolTimings {
    /// Validates the timing relationships the protocol depends on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the poll interval is zero, does not
    /// evenly divide a strictly larger minimum hold, a backoff window is
    /// inverted, or a timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll interval must be positive".into()));
        }
        if self.poll_interval >= self.min_hold {
            return Err(Error::InvalidInput(format!(
                "poll interval {:?} must be shorter than minimum hold {:?}",
                self.poll_interval, self.min_hold
            )));
        }
        if self.min_hold.as_nanos() % self.poll_interval.as_nanos() != 0 {
            return Err(Error::InvalidInput(format!(
                "poll interval {:?} must evenly divide minimum hold {:?}",
                self.poll_interval, self.min_hold
            )));
        }
        if self.creation_timeout.is_zero() || self.acquisition_timeout.is_zero() {
            return Err(Error::InvalidInput("timeouts must be positive".into()));
        }
        for (name, window) in [
            ("creation", self.creation_backoff),
            ("acquisition", self.acquisition_backoff),
        ] {
            if window.min > window.max {
                return Err(Error::InvalidInput(format!(
                    "{name} backoff minimum {:?} exceeds maximum {:?}",
                    window.min, window.max
                )));
            }
        }
        Ok(())
    }

    /// Number of consecutive confirmations needed to reach the minimum hold.
    #[must_use]
    pub fn confirmations_required(&self) -> u32 {
        let polls = self.min_hold.as_nanos() / self.poll_interval.as_nanos().max(1);
        u32::try_from(polls).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let timings = ProtocolTimings::default();
        timings.validate().expect("valid");
        assert_eq!(timings.confirmations_required(), 5);
    }

    #[test]
    fn poll_must_divide_min_hold() {
        let timings = ProtocolTimings {
            poll_interval: Duration::from_millis(400),
            ..ProtocolTimings::default()
        };
        assert!(matches!(timings.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn poll_must_be_shorter_than_min_hold() {
        let timings = ProtocolTimings {
            poll_interval: Duration::from_millis(2500),
            ..ProtocolTimings::default()
        };
        assert!(timings.validate().is_err());
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let timings = ProtocolTimings {
            acquisition_backoff: BackoffWindow::new(Duration::from_secs(2), Duration::from_secs(1)),
            ..ProtocolTimings::default()
        };
        assert!(timings.validate().is_err());
    }

    #[test]
    fn initialize_flag_is_tri_state() {
        assert_eq!(Initialize::from_flag(Some(true)), Initialize::Create);
        assert_eq!(Initialize::from_flag(Some(false)), Initialize::Wait);
        assert_eq!(Initialize::from_flag(None), Initialize::Infer);
    }
}
