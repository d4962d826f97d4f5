//! End-to-end pipeline scenarios against in-memory source/sink fakes.

mod common;

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dorisync::{
    Pipeline,
    config::WorkerOptions,
    source::KeyRange,
    value::Value,
};

use common::*;

fn options(
    workers: usize,
    worker_batch: usize,
    id_batch: usize,
    record_batch: usize,
    timeout_ms: u64,
) -> WorkerOptions {
    WorkerOptions {
        no_of_workers: workers,
        worker_batch_size: worker_batch,
        id_batch_size: id_batch,
        concurrent_tables: 4,
        batch_processing_timeout: Duration::from_millis(timeout_ms),
        record_batch_size: record_batch,
    }
}

#[tokio::test(start_paused = true)]
async fn empty_table_completes_without_uploads() {
    let table = int_table("public", "empty");
    let source = Arc::new(FakeSource::new().with_table(&table, vec![]));
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 5, 10, 5, 100));
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let t = report.table("public", "empty").unwrap();
    assert_eq!(t.total_keys, 0);
    assert_eq!(t.total_records, 0);
    assert_eq!(t.uploaded_records, 0);
    assert_eq!(t.failed_records, 0);
    assert!(sink.uploads.lock().unwrap().is_empty());
    assert!(source.range_calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn twelve_rows_slice_into_three_ranges_and_three_batches() {
    let table = int_table("public", "users");
    let source = Arc::new(FakeSource::new().with_table(&table, int_rows(1..=12)));
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 5, 100, 5, 1000));
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let ranges = source.range_calls.lock().unwrap().clone();
    assert_eq!(
        ranges,
        vec![
            KeyRange::Single {
                lo: Value::Int(1),
                hi: Value::Int(5)
            },
            KeyRange::Single {
                lo: Value::Int(6),
                hi: Value::Int(10)
            },
            KeyRange::Single {
                lo: Value::Int(11),
                hi: Value::Int(12)
            },
        ]
    );

    assert_eq!(sink.successful_batches(), vec![5, 5, 2]);

    let t = report.table("public", "users").unwrap();
    assert_eq!(t.total_keys, 12);
    assert_eq!(t.total_records, 12);
    assert_eq!(t.uploaded_records, 12);
    assert_eq!(t.failed_records, 0);
}

#[tokio::test(start_paused = true)]
async fn composite_pagination_advances_the_cursor_exclusively() {
    let table = composite_table("public", "events");
    let u: Vec<Uuid> = (1..=4).map(Uuid::from_u128).collect();
    let rows = vec![
        composite_row(1, u[0], "a"),
        composite_row(1, u[1], "b"),
        composite_row(2, u[2], "c"),
        composite_row(2, u[3], "d"),
    ];
    let source = Arc::new(FakeSource::new().with_table(&table, rows));
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 3, 3, 10, 100));
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let calls = source.key_page_calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            // First page includes the table's minimum key tuple.
            KeyPageCall {
                cursor: vec![Value::Int(1), Value::Uuid(u[0])],
                inclusive: true,
                returned: 3,
            },
            // Second page resumes with tuple > (2, u3) and finds (2, u4).
            KeyPageCall {
                cursor: vec![Value::Int(2), Value::Uuid(u[2])],
                inclusive: false,
                returned: 1,
            },
            KeyPageCall {
                cursor: vec![Value::Int(2), Value::Uuid(u[3])],
                inclusive: false,
                returned: 0,
            },
        ]
    );

    let t = report.table("public", "events").unwrap();
    assert_eq!(t.total_keys, 4);
    assert_eq!(t.total_records, 4);
    assert_eq!(t.uploaded_records, 4);
}

#[tokio::test(start_paused = true)]
async fn failed_upload_lands_in_the_failed_records_file() {
    let dir = tempfile::tempdir().unwrap();
    let table = int_table("public", "users");
    let source = Arc::new(FakeSource::new().with_table(&table, int_rows(1..=10)));
    // First PUT returns 500, second succeeds.
    let sink = Arc::new(FakeSink::new().failing([true, false]));

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 5, 100, 5, 1000))
        .with_failed_records_dir(dir.path());
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let t = report.table("public", "users").unwrap();
    assert_eq!(t.total_records, 10);
    assert_eq!(t.uploaded_records, 5);
    assert_eq!(t.failed_records, 5);
    // Exact accounting: every record read was either uploaded or failed.
    assert_eq!(t.total_records, t.uploaded_records + t.failed_records);

    let path = dir.path().join("users_failed_records.json");
    let contents = std::fs::read_to_string(&path).unwrap();
    let failed: Vec<serde_json::Value> = serde_json::from_str(&contents).unwrap();
    assert_eq!(failed.len(), 5);
    let ids: Vec<i64> = failed.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_new_work_promptly() {
    let table = int_table("public", "big");
    let source = Arc::new(FakeSource::new().with_table(&table, int_rows(1..=5_000)));
    let cancel = CancellationToken::new();
    let sink = Arc::new(FakeSink::new().cancelling_after_first_success(cancel.clone()));

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(2, 100, 500, 100, 200));
    let report = pipeline.run(vec![table], cancel.clone()).await;

    // Exactly the first upload went through; nothing new starts after the
    // token fires.
    assert_eq!(sink.successful_batches(), vec![100]);
    assert_eq!(
        sink.started_after_cancel
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    let t = report.table("public", "big").unwrap();
    assert_eq!(t.uploaded_records, 100);
    assert!(t.total_records < 5_000);
}

#[tokio::test(start_paused = true)]
async fn table_without_primary_key_is_skipped() {
    let pkless = pkless_table("public", "log_lines");
    let users = int_table("public", "users");
    let source = Arc::new(
        FakeSource::new()
            .with_table(&pkless, vec![])
            .with_table(&users, int_rows(1..=3)),
    );
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 5, 10, 5, 100));
    let report = pipeline
        .run(vec![pkless, users], CancellationToken::new())
        .await;

    assert_eq!(report.tables.len(), 1);
    let t = report.table("public", "users").unwrap();
    assert_eq!(t.total_records, 3);
    assert_eq!(t.uploaded_records, 3);
}

#[tokio::test(start_paused = true)]
async fn dropped_range_shows_up_as_a_keys_records_gap() {
    let table = int_table("public", "users");
    let source = Arc::new(
        FakeSource::new()
            .with_table(&table, int_rows(1..=10))
            // The range starting at key 1 fails in Stage B.
            .failing_range_at(Value::Int(1)),
    );
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(1, 5, 100, 5, 100));
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let t = report.table("public", "users").unwrap();
    assert_eq!(t.total_keys, 10);
    // The failed range is dropped, not retried and not in failed[table].
    assert_eq!(t.total_records, 5);
    assert_eq!(t.uploaded_records, 5);
    assert_eq!(t.failed_records, 0);
}

#[tokio::test(start_paused = true)]
async fn labels_are_fresh_uuids_and_batches_bounded() {
    let table = int_table("public", "users");
    let source = Arc::new(FakeSource::new().with_table(&table, int_rows(1..=50)));
    let sink = Arc::new(FakeSink::new());

    let pipeline = Pipeline::new(source.clone(), sink.clone(), options(2, 7, 100, 10, 100));
    let report = pipeline.run(vec![table], CancellationToken::new()).await;

    let uploads = sink.uploads.lock().unwrap().clone();
    assert!(!uploads.is_empty());
    // No upload carries more than record_batch_size records.
    assert!(uploads.iter().all(|u| u.records <= 10));

    let labels = sink.labels();
    let mut unique = labels.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), labels.len());
    assert!(labels.iter().all(|l| l.parse::<Uuid>().is_ok()));

    let t = report.table("public", "users").unwrap();
    assert_eq!(t.total_records, 50);
    assert_eq!(t.uploaded_records, 50);
}

#[tokio::test(start_paused = true)]
async fn multiple_tables_complete_under_admission_cap() {
    let a = int_table("public", "alpha");
    let b = int_table("public", "beta");
    let c = int_table("public", "gamma");
    let source = Arc::new(
        FakeSource::new()
            .with_table(&a, int_rows(1..=20))
            .with_table(&b, int_rows(1..=7))
            .with_table(&c, vec![]),
    );
    let sink = Arc::new(FakeSink::new());

    let mut opts = options(2, 5, 50, 5, 100);
    opts.concurrent_tables = 1;
    let pipeline = Pipeline::new(source.clone(), sink.clone(), opts);
    let report = pipeline.run(vec![a, b, c], CancellationToken::new()).await;

    assert_eq!(report.tables.len(), 3);
    assert_eq!(report.table("public", "alpha").unwrap().uploaded_records, 20);
    assert_eq!(report.table("public", "beta").unwrap().uploaded_records, 7);
    assert_eq!(report.table("public", "gamma").unwrap().uploaded_records, 0);
    assert_eq!(report.total_failed(), 0);
}
