//! Record store abstraction for the shared report record.
//!
//! The store is the hosting service's comment API seen through four calls.
//! Callers must tolerate its weak contract:
//! - A `get` right after an `update` may return the pre-write body
//! - `list`/`get` latency and availability are unbounded
//! - Two concurrent `create` calls may both succeed
//!
//! There is no compare-and-swap. Mutual exclusion is built on top of this
//! contract by [`crate::lock::Negotiator`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Store-assigned record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Creates a record ID from the store's numeric id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record (comment) in the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Store-assigned id.
    pub id: RecordId,
    /// Full text body.
    pub body: String,
    /// Whether the record was authored by the automation account.
    pub is_bot: bool,
}

impl Record {
    /// Returns true if this record carries the identity marker and was written
    /// by the automation account.
    #[must_use]
    pub fn is_ours(&self, identity_marker: &str) -> bool {
        self.is_bot && self.body.contains(identity_marker)
    }
}

/// Picks the record owned by this system among a thread's records.
///
/// Concurrent creators can leave more than one marked record behind; the most
/// recently created one (last in list order) wins.
#[must_use]
pub fn find_ours<'a>(records: &'a [Record], identity_marker: &str) -> Option<&'a Record> {
    records.iter().rev().find(|r| r.is_ours(identity_marker))
}

/// Record store trait.
///
/// Every call may fail independently with [`Error::Store`]; callers treat
/// such failures as transient.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Lists all records in the thread, oldest first.
    async fn list(&self) -> Result<Vec<Record>>;

    /// Reads one record.
    ///
    /// Returns `Error::NotFound` if the record doesn't exist (or isn't visible yet).
    async fn get(&self, id: RecordId) -> Result<Record>;

    /// Creates a new bot-authored record.
    ///
    /// Ids of created records grow with creation order.
    async fn create(&self, body: &str) -> Result<Record>;

    /// Replaces a record's body unconditionally.
    async fn update(&self, id: RecordId, body: &str) -> Result<Record>;
}

/// In-memory record store for testing.
///
/// Thread-safe via `RwLock` and read-after-write consistent. Not suitable for
/// production.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    records: BTreeMap<RecordId, Record>,
}

impl MemoryState {
    fn insert(&mut self, body: &str, is_bot: bool) -> Record {
        self.next_id += 1;
        let record = Record {
            id: RecordId::new(self.next_id),
            body: body.to_string(),
            is_bot,
        };
        self.records.insert(record.id, record.clone());
        record
    }
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a comment authored by a human user.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn add_user_record(&self, body: &str) -> Result<Record> {
        Ok(self.write()?.insert(body, false))
    }

    /// Returns a snapshot of every record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<Record>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self) -> Result<Vec<Record>> {
        self.snapshot()
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        self.read()?
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::record_not_found(id))
    }

    async fn create(&self, body: &str) -> Result<Record> {
        Ok(self.write()?.insert(body, true))
    }

    async fn update(&self, id: RecordId, body: &str) -> Result<Record> {
        let mut state = self.write()?;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::record_not_found(id))?;
        body.clone_into(&mut record.body);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "<!-- tacho:identity /-->";

    #[tokio::test]
    async fn create_then_update_roundtrip() {
        let store = MemoryStore::new();
        let created = store.create("first").await.expect("create");
        assert!(created.is_bot);

        let updated = store.update(created.id, "second").await.expect("update");
        assert_eq!(updated.body, "second");
        assert_eq!(store.get(created.id).await.expect("get").body, "second");
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update(RecordId::new(9), "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn find_ours_ignores_user_records_and_prefers_latest() {
        let store = MemoryStore::new();
        store
            .add_user_record(&format!("quoting {MARKER}"))
            .expect("user");
        let first = store.create(&format!("a {MARKER}")).await.expect("a");
        store.create("unrelated bot comment").await.expect("b");
        let second = store.create(&format!("c {MARKER}")).await.expect("c");

        let records = store.list().await.expect("list");
        let ours = find_ours(&records, MARKER).expect("ours");
        assert_eq!(ours.id, second.id);
        assert_ne!(ours.id, first.id);
    }

    #[tokio::test]
    async fn find_ours_returns_none_without_marker() {
        let store = MemoryStore::new();
        store.create("no marker here").await.expect("create");
        let records = store.list().await.expect("list");
        assert!(find_ours(&records, MARKER).is_none());
    }
}
