//! Lock negotiation over a record store without compare-and-swap.
//!
//! The shared record doubles as its own lock. A holder claims it by writing a
//! lock marker carrying its holder id into the body, then keeps re-reading the
//! record until the marker has survived [`ProtocolTimings::min_hold`]:
//! - **No CAS**: writing the marker does not mean holding it; a racing writer
//!   may overwrite it invisibly to a lagging read
//! - **Confirmed hold**: a losing racer sees a foreign holder id within one
//!   poll interval and backs off; a winner only declares victory after enough
//!   consecutive confirmations
//! - **Jittered backoff**: CI jobs tend to start together, so every retry
//!   point draws a randomized delay
//!
//! # How It Works
//!
//! ```text
//! initial_read ──found──────────────────────────────┐
//!      │ not found                                   ▼
//!      ▼                                     acquiring.acquiring ◄──┐
//! creating.waiting ◄─┐                         │ free/ours  │ held   │
//!      ▼             │ not elected             ▼            ▼        │
//! creating.searching ┘──found──► ...   acquiring.writing  acquiring.waiting
//!      │ elected                               ▼                     ▲
//!      ▼                                holding.holding ◄─┐          │ lost
//! creating.creating                            ▼          │ ours     │
//!      ▼                                holding.checking ─┴──────────┘
//! creating.settling                            │ ours ≥ min_hold
//!      ▼                                       ▼
//! creating.confirming ──newest is ours──► acquired
//!      │ newer duplicate
//!      └──────────► acquiring.acquiring
//! ```
//!
//! Concurrent creators can both succeed. After one poll interval each
//! creator lists again; a creator that sees a newer marked record abandons
//! its own and negotiates for the newer one, so every report lands in the
//! record that [`find_ours`] picks.
//!
//! Store errors never advance the state; the negotiator sleeps one poll
//! interval and retries until the current phase budget runs out, at which
//! point it lands in `timed_out`. A failed marker write goes back to
//! `acquiring.acquiring` so the retry starts from a fresh read.
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = NegotiationContext::new(IDENTITY_MARKER, skeleton_body);
//! let lock = Negotiator::new(store.clone(), ctx).run().await?;
//!
//! // Critical section: re-read, merge, then write a body without the marker.
//! store.update(lock.record.id, &next_body).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use crate::clock::{Clock, Jitter, RandomJitter, TokioClock};
use crate::config::{BackoffWindow, Initialize, ProtocolTimings};
use crate::error::{Error, Result};
use crate::id::HolderId;
use crate::markup;
use crate::observability;
use crate::store::{Record, RecordId, RecordStore, find_ours};

/// Per-invocation negotiation inputs.
#[derive(Debug, Clone)]
pub struct NegotiationContext {
    /// Our holder id, fresh for this invocation.
    pub holder_id: HolderId,
    /// Text that identifies records owned by this system.
    pub identity_marker: String,
    /// Body written if this invocation creates the record.
    pub initial_body: String,
    /// Creation eagerness.
    pub initialize: Initialize,
    /// Protocol timing parameters.
    pub timings: ProtocolTimings,
}

impl NegotiationContext {
    /// Creates a context with a fresh holder id and default timings.
    #[must_use]
    pub fn new(identity_marker: impl Into<String>, initial_body: impl Into<String>) -> Self {
        Self {
            holder_id: HolderId::generate(),
            identity_marker: identity_marker.into(),
            initial_body: initial_body.into(),
            initialize: Initialize::default(),
            timings: ProtocolTimings::default(),
        }
    }

    /// Sets the creation eagerness.
    #[must_use]
    pub fn with_initialize(mut self, initialize: Initialize) -> Self {
        self.initialize = initialize;
        self
    }

    /// Sets the protocol timings.
    #[must_use]
    pub fn with_timings(mut self, timings: ProtocolTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Overrides the holder id.
    #[must_use]
    pub fn with_holder_id(mut self, holder_id: HolderId) -> Self {
        self.holder_id = holder_id;
        self
    }

    fn creation_body(&self) -> String {
        let mut body = self.initial_body.clone();
        if !body.contains(&self.identity_marker) {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&self.identity_marker);
        }
        markup::with_lock(&body, &self.holder_id)
    }
}

/// Phase whose budget bounds a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the record to exist.
    Creation,
    /// Waiting for exclusive access to an existing record.
    Acquisition,
}

/// Current state of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    /// List records and look for ours.
    InitialRead,
    /// Jittered backoff before searching again.
    CreatingWaiting,
    /// Re-list records.
    CreatingSearching,
    /// Create the record with our lock marker.
    CreatingCreating,
    /// Wait one poll interval so concurrent creations become visible.
    CreatingSettling {
        /// The record we created.
        record: Record,
    },
    /// Re-list and check that no newer marked record exists.
    CreatingConfirming {
        /// The record we created.
        record: Record,
    },
    /// Jittered backoff while another holder has the record.
    AcquiringWaiting {
        /// Record being negotiated.
        record_id: RecordId,
    },
    /// Re-read the record and inspect its lock marker.
    AcquiringAcquiring {
        /// Record being negotiated.
        record_id: RecordId,
    },
    /// Write our lock marker into the body we just read.
    AcquiringWriting {
        /// The record as last read.
        record: Record,
    },
    /// Wait one poll interval.
    HoldingHolding {
        /// Record being negotiated.
        record_id: RecordId,
    },
    /// Re-read and confirm the marker is still ours.
    HoldingChecking {
        /// Record being negotiated.
        record_id: RecordId,
    },
    /// Terminal success.
    Acquired {
        /// The record as last confirmed.
        record: Record,
    },
    /// Terminal failure.
    TimedOut {
        /// Phase whose budget ran out.
        phase: Phase,
        /// Time spent in that phase.
        elapsed: Duration,
    },
}

impl NegotiationState {
    /// Returns the dotted state name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialRead => "initial_read",
            Self::CreatingWaiting => "creating.waiting",
            Self::CreatingSearching => "creating.searching",
            Self::CreatingCreating => "creating.creating",
            Self::CreatingSettling { .. } => "creating.settling",
            Self::CreatingConfirming { .. } => "creating.confirming",
            Self::AcquiringWaiting { .. } => "acquiring.waiting",
            Self::AcquiringAcquiring { .. } => "acquiring.acquiring",
            Self::AcquiringWriting { .. } => "acquiring.writing",
            Self::HoldingHolding { .. } => "holding.holding",
            Self::HoldingChecking { .. } => "holding.checking",
            Self::Acquired { .. } => "acquired",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    /// Returns true for `acquired` and `timed_out`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acquired { .. } | Self::TimedOut { .. })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters collected during one negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationStats {
    /// Failed searches for a record that does not exist yet.
    pub searches: u32,
    /// Times a written marker was observed replaced or missing.
    pub lock_losses: u32,
    /// Store calls that failed and were retried.
    pub transient_errors: u32,
    /// Successful hold confirmations across all attempts.
    pub confirmations: u32,
    /// Records we created and then abandoned for a newer duplicate.
    pub abandoned_records: u32,
    /// Total time spent negotiating.
    pub elapsed: Duration,
}

/// Exclusive write access obtained by a negotiation.
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    /// The record as last read while holding it.
    pub record: Record,
    /// Holder id recorded in the lock marker.
    pub holder_id: HolderId,
    /// Whether this negotiation created the record.
    pub created: bool,
    /// Negotiation counters.
    pub stats: NegotiationStats,
}

/// Lock negotiation state machine.
///
/// Drive it to completion with [`Negotiator::run`], or single-step it with
/// [`Negotiator::step`] and inspect [`Negotiator::state`] in between.
pub struct Negotiator<S: RecordStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    jitter: Box<dyn Jitter>,
    ctx: NegotiationContext,
    state: NegotiationState,
    started: Option<Instant>,
    acquiring_since: Option<Instant>,
    searches: u32,
    confirmed: Duration,
    created: bool,
    stats: NegotiationStats,
}

impl<S: RecordStore + ?Sized> Negotiator<S> {
    /// Creates a negotiator using the tokio clock and entropy-seeded jitter.
    #[must_use]
    pub fn new(store: Arc<S>, ctx: NegotiationContext) -> Self {
        Self {
            store,
            clock: Arc::new(TokioClock),
            jitter: Box::new(RandomJitter::from_entropy()),
            ctx,
            state: NegotiationState::InitialRead,
            started: None,
            acquiring_since: None,
            searches: 0,
            confirmed: Duration::ZERO,
            created: false,
            stats: NegotiationStats::default(),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl Jitter + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Returns our holder id.
    #[must_use]
    pub fn holder_id(&self) -> HolderId {
        self.ctx.holder_id
    }

    /// Returns the counters collected so far.
    #[must_use]
    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// Drives the negotiation until it acquires the lock or times out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CreationTimeout`] if no record appeared within the
    /// creation budget, or [`Error::AcquisitionTimeout`] if the record stayed
    /// held by someone else for the whole acquisition budget.
    pub async fn run(self) -> Result<AcquiredLock> {
        let span = observability::negotiation_span(&self.ctx.holder_id);
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> Result<AcquiredLock> {
        tracing::debug!(initialize = ?self.ctx.initialize, "starting negotiation");
        loop {
            self.step().await;
            match &self.state {
                NegotiationState::Acquired { record } => {
                    tracing::info!(
                        record_id = %record.id,
                        created = self.created,
                        lock_losses = self.stats.lock_losses,
                        elapsed_ms = u64::try_from(self.stats.elapsed.as_millis()).unwrap_or(u64::MAX),
                        "lock acquired"
                    );
                    return Ok(AcquiredLock {
                        record: record.clone(),
                        holder_id: self.ctx.holder_id,
                        created: self.created,
                        stats: self.stats,
                    });
                }
                NegotiationState::TimedOut { phase, elapsed } => {
                    tracing::warn!(?phase, ?elapsed, "negotiation timed out");
                    return Err(match phase {
                        Phase::Creation => Error::CreationTimeout { elapsed: *elapsed },
                        Phase::Acquisition => Error::AcquisitionTimeout { elapsed: *elapsed },
                    });
                }
                _ => {}
            }
        }
    }

    /// Executes the current state's action and moves to the next state.
    ///
    /// Each call suspends on at most one store call or one timer wait.
    /// Terminal states are left unchanged.
    pub async fn step(&mut self) -> &NegotiationState {
        let started = *self.started.get_or_insert_with(|| self.clock.now());
        let current = self.state.clone();

        let next = match current {
            NegotiationState::InitialRead => self.initial_read().await,
            NegotiationState::CreatingWaiting => {
                let window = self.ctx.timings.creation_backoff;
                self.backoff(window, Phase::Creation).await;
                NegotiationState::CreatingSearching
            }
            NegotiationState::CreatingSearching => self.search().await,
            NegotiationState::CreatingCreating => self.create().await,
            NegotiationState::CreatingSettling { record } => {
                let poll = self.ctx.timings.poll_interval;
                self.clock.sleep(poll.min(self.remaining(Phase::Creation))).await;
                NegotiationState::CreatingConfirming { record }
            }
            NegotiationState::CreatingConfirming { record } => self.confirm_creation(record).await,
            NegotiationState::AcquiringWaiting { record_id } => {
                let window = self.ctx.timings.acquisition_backoff;
                self.backoff(window, Phase::Acquisition).await;
                NegotiationState::AcquiringAcquiring { record_id }
            }
            NegotiationState::AcquiringAcquiring { record_id } => self.acquire(record_id).await,
            NegotiationState::AcquiringWriting { record } => self.write_marker(record).await,
            NegotiationState::HoldingHolding { record_id } => {
                self.clock.sleep(self.ctx.timings.poll_interval).await;
                NegotiationState::HoldingChecking { record_id }
            }
            NegotiationState::HoldingChecking { record_id } => self.check_hold(record_id).await,
            terminal @ (NegotiationState::Acquired { .. } | NegotiationState::TimedOut { .. }) => {
                terminal
            }
        };

        self.stats.elapsed = self.clock.now().saturating_duration_since(started);
        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, "negotiation transition");
        }
        self.state = next;
        &self.state
    }

    async fn initial_read(&mut self) -> NegotiationState {
        match self.store.list().await {
            Ok(records) => match find_ours(&records, &self.ctx.identity_marker) {
                Some(record) => self.enter_acquisition(record.id),
                None if self.ctx.initialize == Initialize::Create => {
                    NegotiationState::CreatingCreating
                }
                None => NegotiationState::CreatingWaiting,
            },
            Err(e) => {
                self.retry(e, Phase::Creation, NegotiationState::InitialRead)
                    .await
            }
        }
    }

    async fn search(&mut self) -> NegotiationState {
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                return self
                    .retry(e, Phase::Creation, NegotiationState::CreatingSearching)
                    .await;
            }
        };

        if let Some(record) = find_ours(&records, &self.ctx.identity_marker) {
            return self.enter_acquisition(record.id);
        }

        self.searches += 1;
        self.stats.searches += 1;
        if self.remaining(Phase::Creation).is_zero() {
            return self.timed_out(Phase::Creation);
        }
        if self.elected() {
            tracing::info!(searches = self.searches, "no record found, electing self as creator");
            NegotiationState::CreatingCreating
        } else {
            NegotiationState::CreatingWaiting
        }
    }

    fn elected(&self) -> bool {
        match self.ctx.initialize {
            Initialize::Create => true,
            Initialize::Wait => false,
            Initialize::Infer => self.searches >= self.ctx.timings.elect_after_searches,
        }
    }

    async fn create(&mut self) -> NegotiationState {
        let body = self.ctx.creation_body();
        match self.store.create(&body).await {
            Ok(record) => {
                tracing::info!(record_id = %record.id, "created record");
                self.created = true;
                NegotiationState::CreatingSettling { record }
            }
            Err(e) => {
                self.retry(e, Phase::Creation, NegotiationState::CreatingCreating)
                    .await
            }
        }
    }

    async fn confirm_creation(&mut self, record: Record) -> NegotiationState {
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                return self
                    .retry(e, Phase::Creation, NegotiationState::CreatingConfirming { record })
                    .await;
            }
        };

        // Our own record may still be invisible to a lagging list.
        match find_ours(&records, &self.ctx.identity_marker) {
            Some(newest) if newest.id > record.id => {
                tracing::info!(
                    abandoned = %record.id,
                    record_id = %newest.id,
                    "newer duplicate record found, negotiating for it instead"
                );
                self.created = false;
                self.stats.abandoned_records += 1;
                self.enter_acquisition(newest.id)
            }
            _ => NegotiationState::Acquired { record },
        }
    }

    async fn acquire(&mut self, record_id: RecordId) -> NegotiationState {
        let record = match self.store.get(record_id).await {
            Ok(record) => record,
            Err(e) => {
                return self
                    .retry(
                        e,
                        Phase::Acquisition,
                        NegotiationState::AcquiringAcquiring { record_id },
                    )
                    .await;
            }
        };

        match markup::lock_holder(&record.body) {
            Some(holder) if holder != self.ctx.holder_id.to_string() => {
                if self.remaining(Phase::Acquisition).is_zero() {
                    return self.timed_out(Phase::Acquisition);
                }
                tracing::debug!(%holder, "record held by another job");
                NegotiationState::AcquiringWaiting { record_id }
            }
            _ => NegotiationState::AcquiringWriting { record },
        }
    }

    async fn write_marker(&mut self, record: Record) -> NegotiationState {
        let body = markup::with_lock(&record.body, &self.ctx.holder_id);
        match self.store.update(record.id, &body).await {
            Ok(_) => {
                self.confirmed = Duration::ZERO;
                NegotiationState::HoldingHolding {
                    record_id: record.id,
                }
            }
            // The body may be stale by the time we retry, so read it again.
            Err(e) => {
                let record_id = record.id;
                self.retry(
                    e,
                    Phase::Acquisition,
                    NegotiationState::AcquiringAcquiring { record_id },
                )
                .await
            }
        }
    }

    async fn check_hold(&mut self, record_id: RecordId) -> NegotiationState {
        let record = match self.store.get(record_id).await {
            Ok(record) => record,
            Err(e) => {
                return self
                    .retry(
                        e,
                        Phase::Acquisition,
                        NegotiationState::HoldingChecking { record_id },
                    )
                    .await;
            }
        };

        if markup::is_held_by(&record.body, &self.ctx.holder_id) {
            self.confirmed += self.ctx.timings.poll_interval;
            self.stats.confirmations += 1;
            if self.confirmed >= self.ctx.timings.min_hold {
                NegotiationState::Acquired { record }
            } else {
                NegotiationState::HoldingHolding { record_id }
            }
        } else {
            self.stats.lock_losses += 1;
            self.confirmed = Duration::ZERO;
            tracing::info!(
                holder = ?markup::lock_holder(&record.body),
                "lock lost to another writer, restarting acquisition"
            );
            NegotiationState::AcquiringWaiting { record_id }
        }
    }

    fn enter_acquisition(&mut self, record_id: RecordId) -> NegotiationState {
        if self.acquiring_since.is_none() {
            self.acquiring_since = Some(self.clock.now());
        }
        NegotiationState::AcquiringAcquiring { record_id }
    }

    async fn backoff(&mut self, window: BackoffWindow, phase: Phase) {
        let delay = self.jitter.delay(window).min(self.remaining(phase));
        self.clock.sleep(delay).await;
    }

    async fn retry(&mut self, error: Error, phase: Phase, same: NegotiationState) -> NegotiationState {
        self.stats.transient_errors += 1;
        let remaining = self.remaining(phase);
        if remaining.is_zero() {
            tracing::warn!(state = %same, error = %error, "store call failed with no budget left");
            return self.timed_out(phase);
        }
        tracing::warn!(state = %same, error = %error, "store call failed, retrying");
        self.clock
            .sleep(self.ctx.timings.poll_interval.min(remaining))
            .await;
        same
    }

    fn timed_out(&self, phase: Phase) -> NegotiationState {
        NegotiationState::TimedOut {
            phase,
            elapsed: self.elapsed(phase),
        }
    }

    fn phase_start(&self, phase: Phase) -> Instant {
        let started = self.started.unwrap_or_else(|| self.clock.now());
        match phase {
            Phase::Creation => started,
            Phase::Acquisition => self.acquiring_since.unwrap_or(started),
        }
    }

    fn elapsed(&self, phase: Phase) -> Duration {
        self.clock
            .now()
            .saturating_duration_since(self.phase_start(phase))
    }

    fn remaining(&self, phase: Phase) -> Duration {
        let budget = match phase {
            Phase::Creation => self.ctx.timings.creation_timeout,
            Phase::Acquisition => self.ctx.timings.acquisition_timeout,
        };
        budget.saturating_sub(self.elapsed(phase))
    }
}
