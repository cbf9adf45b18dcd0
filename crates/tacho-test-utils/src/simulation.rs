//! Deterministic simulation of the hosting service's record store.
//!
//! [`SimulatedStore`] reproduces the weak contract the lock negotiation has to
//! survive, on tokio's clock so tests can run on paused (virtual) time:
//!
//! # Key Features
//!
//! - **Latency**: Every call sleeps before touching state
//! - **Read Lag**: For `read_lag` after a write, reads return the previous body,
//!   and freshly created records stay invisible
//! - **Fault Injection**: Seeded failure rates plus one-shot `fail_next`
//! - **Foreign Writes**: `external_write` overwrites a body behind everyone's back
//! - **Operation Recording**: Every call is logged with its virtual timestamp
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use tacho_test_utils::simulation::{OperationKind, SimulatedStore, StoreConfig};
//!
//! let store = SimulatedStore::with_seed(7).with_config(StoreConfig {
//!     latency: Some((20, 80)),
//!     read_lag: Duration::from_millis(200),
//!     ..StoreConfig::default()
//! });
//! store.fail_next(OperationKind::Update);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use tacho_core::clock::Jitter;
use tacho_core::config::BackoffWindow;
use tacho_core::error::{Error, Result};
use tacho_core::markup;
use tacho_core::store::{Record, RecordId, RecordStore};

/// Store behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Per-call latency range (min, max) in milliseconds.
    pub latency: Option<(u64, u64)>,
    /// How long writes stay invisible to reads.
    pub read_lag: Duration,
    /// Probability of `list`/`get` failures (0.0 - 1.0).
    pub read_failure_rate: f64,
    /// Probability of `create`/`update` failures (0.0 - 1.0).
    pub write_failure_rate: f64,
}

impl StoreConfig {
    /// A consistent store with fixed latency.
    #[must_use]
    pub fn with_latency(ms: u64) -> Self {
        Self {
            latency: Some((ms, ms)),
            ..Self::default()
        }
    }

    /// A flaky, lagging store.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            latency: Some((10, 120)),
            read_lag: Duration::from_millis(150),
            read_failure_rate: 0.1,
            write_failure_rate: 0.1,
        }
    }
}

/// Store call kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `list`
    List,
    /// `get`
    Get,
    /// `create`
    Create,
    /// `update`
    Update,
    /// [`SimulatedStore::external_write`]
    External,
}

/// A recorded store call.
#[derive(Debug, Clone)]
pub struct RecordedOperation {
    /// Virtual time at which the call touched state.
    pub at: Instant,
    /// Call kind.
    pub kind: OperationKind,
    /// Record involved, if any.
    pub record_id: Option<RecordId>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Lock holder in the written body (writes only).
    pub holder: Option<String>,
}

#[derive(Debug)]
struct SimRecord {
    record: Record,
    previous_body: Option<String>,
    created_at: Instant,
    written_at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    records: BTreeMap<RecordId, SimRecord>,
}

/// Record store with latency, read lag and fault injection.
#[derive(Debug)]
pub struct SimulatedStore {
    state: Mutex<SimState>,
    config: Mutex<StoreConfig>,
    rng: Mutex<StdRng>,
    scripted_failures: Mutex<VecDeque<OperationKind>>,
    operations: Mutex<Vec<RecordedOperation>>,
}

impl SimulatedStore {
    /// Creates a consistent, instant, fault-free store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Creates a store whose random faults and latencies follow a seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            config: Mutex::new(StoreConfig::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            scripted_failures: Mutex::new(VecDeque::new()),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Sets the store behavior.
    #[must_use]
    pub fn with_config(self, config: StoreConfig) -> Self {
        self.configure(config);
        self
    }

    /// Replaces the store behavior.
    pub fn configure(&self, config: StoreConfig) {
        *self.config.lock().expect("lock poisoned") = config;
    }

    /// Makes the next call of the given kind fail with a store error.
    pub fn fail_next(&self, kind: OperationKind) {
        self.scripted_failures
            .lock()
            .expect("lock poisoned")
            .push_back(kind);
    }

    /// Adds a comment authored by a human user, visible immediately.
    pub fn add_user_record(&self, body: &str) -> Record {
        self.seed(body, false)
    }

    /// Adds a bot-authored record as if created long ago, visible immediately.
    pub fn seed_bot_record(&self, body: &str) -> Record {
        self.seed(body, true)
    }

    fn seed(&self, body: &str, is_bot: bool) -> Record {
        let now = Instant::now();
        let visible_since = now.checked_sub(self.read_lag()).unwrap_or(now);
        let mut state = self.state.lock().expect("lock poisoned");
        insert(&mut state, body, is_bot, visible_since)
    }

    /// Overwrites a record body as another party would, bypassing latency and
    /// faults. The write is subject to read lag like any other.
    pub fn external_write(&self, id: RecordId, body: &str) -> Record {
        let record = {
            let mut state = self.state.lock().expect("lock poisoned");
            let sim = state.records.get_mut(&id).expect("record exists");
            sim.previous_body = Some(std::mem::replace(&mut sim.record.body, body.to_string()));
            sim.written_at = Instant::now();
            sim.record.clone()
        };
        self.record_op(OperationKind::External, Some(id), true, Some(body));
        record
    }

    /// Returns the true current state, ignoring read lag.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.state
            .lock()
            .expect("lock poisoned")
            .records
            .values()
            .map(|sim| sim.record.clone())
            .collect()
    }

    /// Returns bot-authored records only.
    #[must_use]
    pub fn bot_records(&self) -> Vec<Record> {
        self.records().into_iter().filter(|r| r.is_bot).collect()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<RecordedOperation> {
        self.operations.lock().expect("lock poisoned").clone()
    }

    /// Returns operations matching a filter.
    #[must_use]
    pub fn operations_where<F>(&self, filter: F) -> Vec<RecordedOperation>
    where
        F: Fn(&RecordedOperation) -> bool,
    {
        self.operations
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|op| filter(op))
            .cloned()
            .collect()
    }

    /// Returns the number of calls of a kind, successful or not.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations_where(|op| op.kind == kind).len()
    }

    /// Returns count of failed operations.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.operations_where(|op| !op.success).len()
    }

    fn read_lag(&self) -> Duration {
        self.config.lock().expect("lock poisoned").read_lag
    }

    async fn enter(&self, kind: OperationKind, record_id: Option<RecordId>) -> Result<()> {
        let (latency, rate) = {
            let config = self.config.lock().expect("lock poisoned");
            let rate = match kind {
                OperationKind::List | OperationKind::Get => config.read_failure_rate,
                OperationKind::Create | OperationKind::Update => config.write_failure_rate,
                OperationKind::External => 0.0,
            };
            let latency = match config.latency {
                Some((min, max)) => {
                    let ms = self
                        .rng
                        .lock()
                        .expect("lock poisoned")
                        .gen_range(min..=max.max(min));
                    Duration::from_millis(ms)
                }
                None => Duration::ZERO,
            };
            (latency, rate)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = {
            let mut queue = self.scripted_failures.lock().expect("lock poisoned");
            match queue.iter().position(|k| *k == kind) {
                Some(index) => {
                    queue.remove(index);
                    true
                }
                None => false,
            }
        };
        let random = rate > 0.0 && self.rng.lock().expect("lock poisoned").r#gen::<f64>() < rate;

        if scripted || random {
            self.record_op(kind, record_id, false, None);
            tracing::debug!(?kind, "injected store failure");
            return Err(Error::store(format!("simulated {kind:?} failure")));
        }
        Ok(())
    }

    fn record_op(
        &self,
        kind: OperationKind,
        record_id: Option<RecordId>,
        success: bool,
        written: Option<&str>,
    ) {
        self.operations
            .lock()
            .expect("lock poisoned")
            .push(RecordedOperation {
                at: Instant::now(),
                kind,
                record_id,
                success,
                holder: written.and_then(markup::lock_holder),
            });
    }

    fn visible(&self, sim: &SimRecord, now: Instant) -> Option<Record> {
        let lag = self.read_lag();
        if now.saturating_duration_since(sim.created_at) < lag {
            return None;
        }
        let mut record = sim.record.clone();
        if now.saturating_duration_since(sim.written_at) < lag {
            if let Some(previous) = &sim.previous_body {
                record.body.clone_from(previous);
            }
        }
        Some(record)
    }
}

impl Default for SimulatedStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert(state: &mut SimState, body: &str, is_bot: bool, at: Instant) -> Record {
    state.next_id += 1;
    let record = Record {
        id: RecordId::new(state.next_id),
        body: body.to_string(),
        is_bot,
    };
    state.records.insert(
        record.id,
        SimRecord {
            record: record.clone(),
            previous_body: None,
            created_at: at,
            written_at: at,
        },
    );
    record
}

#[async_trait]
impl RecordStore for SimulatedStore {
    async fn list(&self) -> Result<Vec<Record>> {
        self.enter(OperationKind::List, None).await?;
        let now = Instant::now();
        let records = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .records
                .values()
                .filter_map(|sim| self.visible(sim, now))
                .collect()
        };
        self.record_op(OperationKind::List, None, true, None);
        Ok(records)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        self.enter(OperationKind::Get, Some(id)).await?;
        let now = Instant::now();
        let found = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .records
                .get(&id)
                .and_then(|sim| self.visible(sim, now))
        };
        self.record_op(OperationKind::Get, Some(id), found.is_some(), None);
        found.ok_or_else(|| Error::record_not_found(id))
    }

    async fn create(&self, body: &str) -> Result<Record> {
        self.enter(OperationKind::Create, None).await?;
        let record = {
            let mut state = self.state.lock().expect("lock poisoned");
            insert(&mut state, body, true, Instant::now())
        };
        self.record_op(OperationKind::Create, Some(record.id), true, Some(body));
        Ok(record)
    }

    async fn update(&self, id: RecordId, body: &str) -> Result<Record> {
        self.enter(OperationKind::Update, Some(id)).await?;
        let updated = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.records.get_mut(&id).map(|sim| {
                sim.previous_body = Some(std::mem::replace(&mut sim.record.body, body.to_string()));
                sim.written_at = Instant::now();
                sim.record.clone()
            })
        };
        self.record_op(OperationKind::Update, Some(id), updated.is_some(), Some(body));
        updated.ok_or_else(|| Error::record_not_found(id))
    }
}

/// Jitter that replays a fixed script of delays, then repeats the last one.
#[derive(Debug, Clone)]
pub struct ScriptedJitter {
    delays: VecDeque<Duration>,
    last: Duration,
}

impl ScriptedJitter {
    /// Creates a script from millisecond delays.
    #[must_use]
    pub fn from_millis(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().copied().map(Duration::from_millis).collect(),
            last: Duration::ZERO,
        }
    }
}

impl Jitter for ScriptedJitter {
    fn delay(&mut self, _window: BackoffWindow) -> Duration {
        if let Some(next) = self.delays.pop_front() {
            self.last = next;
        }
        self.last
    }
}
