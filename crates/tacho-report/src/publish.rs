//! Publishing a job's report into the shared record.
//!
//! ```text
//! publish(report)
//!   ├─ validate (input errors abort before any store call)
//!   ├─ negotiate the lock (creates the record if elected)
//!   ├─ re-read the record (falls back to the body confirmed while holding)
//!   ├─ merge into the body with the lock marker stripped
//!   └─ update (the written body has no lock marker: this releases the hold)
//! ```
//!
//! A timeout writes nothing. Lock loss between acquisition and the final
//! write is not detected; the merge is idempotent so a rare double write
//! heals on the next publish.

use std::future::Future;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::Instrument;

use tacho_core::clock::{Clock, RandomJitter, TokioClock};
use tacho_core::error::{Error, Result};
use tacho_core::lock::{AcquiredLock, NegotiationContext, Negotiator};
use tacho_core::markup;
use tacho_core::observability::publish_span;
use tacho_core::store::{Record, RecordStore};

use crate::config::PublishOptions;
use crate::document::{Document, IDENTITY_MARKER};
use crate::merge::merge;
use crate::metrics::{self, PublishOutcome};
use crate::report::Report;

/// Retries for the re-read and the final write after the lock is held.
pub const STORE_RETRIES: u32 = 3;

/// Publishes reports into the shared record.
pub struct Publisher<S: RecordStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    options: PublishOptions,
}

impl<S: RecordStore + ?Sized> Publisher<S> {
    /// Creates a publisher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the options are inconsistent.
    pub fn new(store: Arc<S>, options: PublishOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(TokioClock),
            rng: Mutex::new(StdRng::from_entropy()),
            options,
        })
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seeds the backoff jitter for reproducible runs.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Returns the options in effect.
    #[must_use]
    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    /// Merges the report into the shared record, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an input error if the report is invalid, a timeout error if the
    /// lock could not be obtained, or the last store error if the re-read or
    /// final write kept failing.
    pub async fn publish(&self, report: &Report) -> Result<Record> {
        let report = self.prepare(report)?;
        let span = publish_span(&report.id, report.run_number, report.job_index);
        let result = self.publish_inner(&report).instrument(span).await;
        match &result {
            Ok(_) => {}
            Err(e) if e.is_timeout() => metrics::record_publish(PublishOutcome::Timeout),
            Err(_) => metrics::record_publish(PublishOutcome::Error),
        }
        result
    }

    fn prepare(&self, report: &Report) -> Result<Report> {
        let mut report = report.clone();
        if let Some(id) = &self.options.report_id {
            report.id = id.clone();
        }
        report.validate()?;
        Ok(report)
    }

    async fn publish_inner(&self, report: &Report) -> Result<Record> {
        let ctx = NegotiationContext::new(IDENTITY_MARKER, Document::skeleton().render())
            .with_initialize(self.options.initialize)
            .with_timings(self.options.timings);
        let lock = Negotiator::new(Arc::clone(&self.store), ctx)
            .with_clock(Arc::clone(&self.clock))
            .with_jitter(self.jitter()?)
            .run()
            .await
            .inspect_err(|e| {
                if let Error::CreationTimeout { elapsed } | Error::AcquisitionTimeout { elapsed } = e
                {
                    metrics::record_negotiation("timed_out", 0, *elapsed);
                }
            })?;
        metrics::record_negotiation("acquired", lock.stats.lock_losses, lock.stats.elapsed);

        let record_id = lock.record.id;
        let current = self.reread(&lock).await?;
        let previous = markup::without_lock(&current.body);
        let (body, outcome) = merge(Some(&previous), report, &self.options.merge_options())?;
        metrics::record_merge(&outcome);

        let record = self
            .with_retries("write", || self.store.update(record_id, &body))
            .await?;

        let published = if outcome.is_stale() {
            PublishOutcome::Stale
        } else if lock.created {
            PublishOutcome::Created
        } else {
            PublishOutcome::Updated
        };
        metrics::record_publish(published);
        tracing::info!(
            record_id = %record.id,
            outcome = published.as_str(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            stale = outcome.stale,
            "published report"
        );
        Ok(record)
    }

    /// Reads the held record back, retrying while a lagging read does not yet
    /// show our lock marker.
    async fn reread(&self, lock: &AcquiredLock) -> Result<Record> {
        let record_id = lock.record.id;
        for attempt in 0..=STORE_RETRIES {
            let current = self
                .with_retries("re-read", || self.store.get(record_id))
                .await?;
            if markup::is_held_by(&current.body, &lock.holder_id) {
                return Ok(current);
            }
            if attempt < STORE_RETRIES {
                tracing::debug!(%record_id, attempt, "re-read is missing our lock marker");
                self.clock.sleep(self.options.timings.poll_interval).await;
            }
        }
        tracing::warn!(
            %record_id,
            "re-read never showed our lock marker, merging into the body confirmed while holding"
        );
        Ok(lock.record.clone())
    }

    fn jitter(&self) -> Result<RandomJitter> {
        let mut rng = self.rng.lock().map_err(|_| Error::Internal {
            message: "jitter rng lock poisoned".into(),
        })?;
        Ok(RandomJitter::seeded(rng.next_u64()))
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < STORE_RETRIES => {
                    retries += 1;
                    tracing::warn!(operation, retries, error = %e, "store call failed, retrying");
                    self.clock.sleep(self.options.timings.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(operation, error = %e, "store call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tacho_core::config::Initialize;
    use tacho_core::id::ReportId;
    use tacho_core::store::{MemoryStore, RecordId};

    use super::*;

    /// Serves an outdated body for the first `stale_gets` reads.
    struct LaggingReads {
        inner: MemoryStore,
        stale_gets: AtomicU32,
        gets: AtomicU32,
    }

    impl LaggingReads {
        fn new(stale_gets: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                stale_gets: AtomicU32::new(stale_gets),
                gets: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordStore for LaggingReads {
        async fn list(&self) -> Result<Vec<Record>> {
            self.inner.list().await
        }

        async fn get(&self, id: RecordId) -> Result<Record> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let mut record = self.inner.get(id).await?;
            let stale = self
                .stale_gets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                record.body = "outdated".into();
            }
            Ok(record)
        }

        async fn create(&self, body: &str) -> Result<Record> {
            self.inner.create(body).await
        }

        async fn update(&self, id: RecordId, body: &str) -> Result<Record> {
            self.inner.update(id, body).await
        }
    }

    fn options(initialize: Initialize) -> PublishOptions {
        PublishOptions {
            initialize,
            ..PublishOptions::default()
        }
    }

    fn report(id: &str, run: u64) -> Report {
        Report::new(ReportId::new(id).expect("id"), format!("Bench {id}"), run)
            .with_body(format!("<p>{id} run {run}</p>"))
    }

    #[tokio::test(start_paused = true)]
    async fn first_publish_creates_record_without_lock() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone(), options(Initialize::Create))
            .expect("publisher")
            .with_seed(1);

        let record = publisher.publish(&report("a", 1)).await.expect("publish");

        assert!(record.is_bot);
        assert!(markup::lock_holder(&record.body).is_none());
        assert!(record.body.ends_with(IDENTITY_MARKER));
        assert_eq!(store.snapshot().expect("snapshot").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn report_id_override_applies() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(
            store.clone(),
            PublishOptions {
                report_id: Some(ReportId::new("pinned").expect("id")),
                ..options(Initialize::Create)
            },
        )
        .expect("publisher");

        let record = publisher.publish(&report("a", 1)).await.expect("publish");
        let doc = Document::parse(&record.body);
        assert!(doc.result("results::pinned").is_some());
        assert!(doc.result("results::a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_report_makes_no_store_calls() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone(), options(Initialize::Create)).expect("publisher");

        let bad = report("a", 1).with_body("<!-- tacho:results -->");
        let err = publisher.publish(&bad).await.unwrap_err();

        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.snapshot().expect("snapshot").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_publisher_times_out_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone(), options(Initialize::Wait)).expect("publisher");

        let err = publisher.publish(&report("a", 1)).await.unwrap_err();
        assert!(matches!(err, Error::CreationTimeout { .. }));
        assert!(store.snapshot().expect("snapshot").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_reread_is_retried_until_our_marker_shows() {
        let store = Arc::new(LaggingReads::new(1));
        let publisher = Publisher::new(store.clone(), options(Initialize::Create))
            .expect("publisher")
            .with_seed(2);

        let record = publisher.publish(&report("a", 1)).await.expect("publish");

        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
        assert!(!record.body.contains("outdated"));
        assert!(record.body.ends_with(IDENTITY_MARKER));
        assert!(Document::parse(&record.body).result("results::a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn persistently_stale_reread_falls_back_to_confirmed_body() {
        let store = Arc::new(LaggingReads::new(u32::MAX));
        let publisher = Publisher::new(store.clone(), options(Initialize::Create))
            .expect("publisher")
            .with_seed(3);

        let record = publisher.publish(&report("a", 1)).await.expect("publish");

        assert_eq!(store.gets.load(Ordering::SeqCst), STORE_RETRIES + 1);
        assert!(!record.body.contains("outdated"));
        assert!(markup::lock_holder(&record.body).is_none());
        assert!(record.body.ends_with(IDENTITY_MARKER));
        assert!(Document::parse(&record.body).result("results::a").is_some());
    }

    #[test]
    fn inconsistent_options_are_rejected() {
        let mut opts = PublishOptions::default();
        opts.timings.poll_interval = opts.timings.min_hold;
        assert!(Publisher::new(Arc::new(MemoryStore::new()), opts).is_err());
    }
}
