//! End-to-end publishing against a simulated store on virtual time.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tacho_core::config::{Initialize, ProtocolTimings};
use tacho_core::error::Error;
use tacho_core::markup;
use tacho_core::store::{RecordStore, find_ours};
use tacho_report::document::{Document, IDENTITY_MARKER, Status, has_single_identity};
use tacho_report::config::PublishOptions;
use tacho_report::publish::{Publisher, STORE_RETRIES};
use tacho_test_utils::{
    OperationKind, ReportFactory, SimulatedStore, StoreConfig, fast_timings, init_test_logging,
    publish_options,
};

fn publisher(store: &Arc<SimulatedStore>, initialize: Initialize, seed: u64) -> Publisher<SimulatedStore> {
    Publisher::new(store.clone(), publish_options(initialize))
        .expect("publisher")
        .with_seed(seed)
}

#[tokio::test(start_paused = true)]
async fn create_then_update_orders_sections_by_title() {
    init_test_logging();
    let store = Arc::new(SimulatedStore::new());

    publisher(&store, Initialize::Create, 1)
        .publish(&ReportFactory::complete("beta", "Beta", 7))
        .await
        .expect("first publish");
    let record = publisher(&store, Initialize::Infer, 2)
        .publish(&ReportFactory::complete("alpha", "Alpha", 7))
        .await
        .expect("second publish");

    assert_eq!(store.bot_records().len(), 1);
    assert!(markup::lock_holder(&record.body).is_none());
    assert!(has_single_identity(&record.body));
    assert!(record.body.ends_with(IDENTITY_MARKER));

    let doc = Document::parse(&record.body);
    let ids: Vec<_> = doc.results.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["results::alpha", "results::beta"]);
    assert!(!doc.pending);
}

#[tokio::test(start_paused = true)]
async fn stale_update_is_rejected() {
    let store = Arc::new(SimulatedStore::new());

    let fresh = publisher(&store, Initialize::Create, 1)
        .publish(&ReportFactory::complete("r", "Startup", 5))
        .await
        .expect("run 5");
    let after = publisher(&store, Initialize::Infer, 2)
        .publish(&ReportFactory::complete("r", "Startup", 4))
        .await
        .expect("run 4");

    assert_eq!(after.body, fresh.body);
    let section = Document::parse(&after.body)
        .result("results::r")
        .cloned()
        .expect("section");
    assert_eq!(section.run_number, 5);
    assert_eq!(section.content, "<p>Startup run 5</p>");
}

#[tokio::test(start_paused = true)]
async fn running_report_is_replaced_by_final_results() {
    let store = Arc::new(SimulatedStore::new());

    let running = publisher(&store, Initialize::Create, 1)
        .publish(&ReportFactory::running("startup", "Startup", 3))
        .await
        .expect("running");
    let doc = Document::parse(&running.body);
    assert!(doc.pending);
    assert!(doc.group("unknown").is_some());

    let mut done = ReportFactory::measured("startup", "Startup", 3);
    done.id = ReportFactory::running("startup", "Startup", 3).id;
    let record = publisher(&store, Initialize::Wait, 2)
        .publish(&done)
        .await
        .expect("complete");

    let doc = Document::parse(&record.body);
    assert!(!doc.pending);
    assert!(doc.group("unknown").is_none());
    assert_eq!(doc.summaries.len(), 1);
    assert_eq!(doc.summaries[0].name, "first-contentful-paint");
    assert_eq!(doc.results[0].status, Status::Complete);
}

#[tokio::test(start_paused = true)]
async fn concurrent_jobs_all_land_in_one_record() {
    init_test_logging();
    let store = Arc::new(SimulatedStore::with_seed(11).with_config(StoreConfig::with_latency(30)));
    let reports = ReportFactory::batch(4, 9);

    let mut tasks = Vec::new();
    for (i, report) in reports.into_iter().enumerate() {
        let initialize = if i == 0 {
            Initialize::Create
        } else {
            Initialize::Wait
        };
        let publisher = publisher(&store, initialize, u64::try_from(i).expect("small"));
        tasks.push(tokio::spawn(async move { publisher.publish(&report).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("publish");
    }

    let records = store.bot_records();
    assert_eq!(records.len(), 1);
    let body = &records[0].body;
    assert!(markup::lock_holder(body).is_none());
    assert!(has_single_identity(body));

    let doc = Document::parse(body);
    let ids: Vec<_> = doc.results.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        ["results::job-0", "results::job-1", "results::job-2", "results::job-3"]
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_records_resolve_to_most_recent() {
    // Latency lets both designated creators list before either creates.
    let store = Arc::new(SimulatedStore::new().with_config(StoreConfig::with_latency(10)));

    let (first, second) = (
        publisher(&store, Initialize::Create, 1),
        publisher(&store, Initialize::Create, 2),
    );
    let (report_a, report_b) = (
        ReportFactory::complete("a", "A", 1),
        ReportFactory::complete("b", "B", 1),
    );
    let (a, b) = tokio::join!(first.publish(&report_a), second.publish(&report_b));
    a.expect("a");
    b.expect("b");
    assert_eq!(store.bot_records().len(), 2);

    let records = store.list().await.expect("list");
    let latest = find_ours(&records, IDENTITY_MARKER).expect("ours").clone();
    let doc = Document::parse(&latest.body);
    assert!(doc.result("results::a").is_some());
    assert!(doc.result("results::b").is_some());
    assert!(markup::lock_holder(&latest.body).is_none());

    let record = publisher(&store, Initialize::Infer, 3)
        .publish(&ReportFactory::complete("c", "C", 1))
        .await
        .expect("c");

    assert_eq!(record.id, latest.id);
    let doc = Document::parse(&record.body);
    for id in ["results::a", "results::b", "results::c"] {
        assert!(doc.result(id).is_some(), "{id} missing");
    }
}

#[tokio::test(start_paused = true)]
async fn lockstep_elections_keep_every_report() {
    init_test_logging();
    // Equal seeds draw equal backoffs, so both jobs elect themselves together.
    let store = Arc::new(SimulatedStore::new().with_config(StoreConfig::with_latency(10)));

    let (first, second) = (
        publisher(&store, Initialize::Infer, 5),
        publisher(&store, Initialize::Infer, 5),
    );
    let (report_a, report_b) = (
        ReportFactory::complete("a", "A", 1),
        ReportFactory::complete("b", "B", 1),
    );
    let (a, b) = tokio::join!(first.publish(&report_a), second.publish(&report_b));
    let (a, b) = (a.expect("a"), b.expect("b"));

    assert_eq!(store.count(OperationKind::Create), 2);
    assert_eq!(a.id, b.id);

    let records = store.list().await.expect("list");
    let latest = find_ours(&records, IDENTITY_MARKER).expect("ours");
    assert_eq!(latest.id, a.id);
    assert!(markup::lock_holder(&latest.body).is_none());
    let doc = Document::parse(&latest.body);
    assert!(doc.result("results::a").is_some());
    assert!(doc.result("results::b").is_some());
}

#[tokio::test(start_paused = true)]
async fn flaky_lagging_store_keeps_every_report() {
    init_test_logging();
    let store = Arc::new(SimulatedStore::with_seed(17).with_config(StoreConfig::flaky()));
    let timings = ProtocolTimings {
        creation_timeout: Duration::from_secs(30),
        acquisition_timeout: Duration::from_secs(60),
        ..fast_timings()
    };
    let reports = ReportFactory::batch(4, 2);

    let mut tasks = Vec::new();
    for (i, report) in reports.into_iter().enumerate() {
        let initialize = if i == 0 {
            Initialize::Create
        } else {
            Initialize::Wait
        };
        let options = PublishOptions {
            timings,
            ..publish_options(initialize)
        };
        let publisher = Publisher::new(store.clone(), options)
            .expect("publisher")
            .with_seed(u64::try_from(i).expect("small"));
        tasks.push(tokio::spawn(async move { publisher.publish(&report).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("publish");
    }

    let records = store.bot_records();
    assert_eq!(records.len(), 1);
    let body = &records[0].body;
    assert!(markup::lock_holder(body).is_none());
    assert!(has_single_identity(body));

    let doc = Document::parse(body);
    let ids: Vec<_> = doc.results.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        ["results::job-0", "results::job-1", "results::job-2", "results::job-3"]
    );
    assert!(store.failure_count() > 0);
}

#[tokio::test(start_paused = true)]
async fn final_write_retries_transient_failures() {
    let store = Arc::new(SimulatedStore::new());
    store.fail_next(OperationKind::Update);
    store.fail_next(OperationKind::Update);

    let record = publisher(&store, Initialize::Create, 1)
        .publish(&ReportFactory::complete("a", "A", 1))
        .await
        .expect("publish");

    assert!(markup::lock_holder(&record.body).is_none());
    assert_eq!(store.count(OperationKind::Update), 3);
}

#[tokio::test(start_paused = true)]
async fn final_write_gives_up_after_retries() {
    let store = Arc::new(SimulatedStore::new());
    for _ in 0..=STORE_RETRIES {
        store.fail_next(OperationKind::Update);
    }

    let err = publisher(&store, Initialize::Create, 1)
        .publish(&ReportFactory::complete("a", "A", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Store { .. }));
    assert_eq!(
        store.count(OperationKind::Update),
        usize::try_from(STORE_RETRIES + 1).expect("small")
    );
}

#[tokio::test(start_paused = true)]
async fn waiting_job_without_record_writes_nothing() {
    let store = Arc::new(SimulatedStore::new());
    let err = publisher(&store, Initialize::Wait, 1)
        .publish(&ReportFactory::complete("a", "A", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CreationTimeout { .. }));
    assert!(store.records().is_empty());
}
