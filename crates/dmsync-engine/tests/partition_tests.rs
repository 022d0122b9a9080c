//! Partitioned execution tests
//!
//! Covers partitioned loads through the pipeline, failure isolation between
//! buckets, fail-fast and cancellation on a paused clock, and concurrent
//! metrics roll-up from many buckets at once.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{init_tracing, key, put, put_range, source, table, target, ts, TABLE};
use dmsync_common::types::{DateRange, Interval};
use dmsync_engine::metrics::Metrics;
use dmsync_engine::partition::{BucketAction, PartitionOptions, Partitioner};
use dmsync_engine::{Action, Pipeline, ReadStrategy, SyncError};
use tokio_util::sync::CancellationToken;

fn options(threads: usize) -> PartitionOptions {
    PartitionOptions {
        threads,
        interval: Interval::Month,
        progress_interval: Duration::from_secs(1),
        fail_fast: false,
    }
}

fn first_quarter() -> DateRange {
    DateRange::between(ts("2024-01-15 00:00:00"), ts("2024-03-10 00:00:00")).unwrap()
}

#[tokio::test]
async fn test_partitioned_load_covers_every_bucket() -> Result<()> {
    init_tracing();
    let source = source();
    put_range(&source, 1, 4, "2024-01-20 08:00:00")?;
    put_range(&source, 5, 9, "2024-02-10 08:00:00")?;
    put_range(&source, 10, 12, "2024-03-05 08:00:00")?;
    // Outside the requested range
    put(&source, 13, "2024-01-02 00:00:00", "2024-01-02 00:00:00")?;
    put(&source, 14, "2024-03-20 00:00:00", "2024-03-20 00:00:00")?;

    let target = target();
    let snapshot = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_created(first_quarter())
        .with_read_strategy(ReadStrategy::DatePartitioned(options(3)))
        .with_page_size(2)
        .run()
        .await?;

    assert_eq!(snapshot.inserted, 12);
    assert_eq!(snapshot.input, 12);
    assert_eq!(snapshot.expected, 12);
    assert_eq!(target.len(TABLE), 12);
    assert!(target.row(TABLE, &key(13)).is_none());
    assert!(target.row(TABLE, &key(14)).is_none());
    assert_eq!(target.sessions_opened(), 3);
    Ok(())
}

#[tokio::test]
async fn test_sequential_matches_parallel() -> Result<()> {
    let source = source();
    for (n, day) in (1..=30).zip((1..=28).cycle()) {
        let when = format!("2024-{:02}-{day:02} 12:00:00", n % 3 + 1);
        put(&source, n, &when, &when)?;
    }
    let range = DateRange::between(ts("2024-01-01 00:00:00"), ts("2024-04-01 00:00:00"))?;

    let mut results = Vec::new();
    for threads in [1, 4] {
        let target = target();
        let snapshot = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
            .with_created(range)
            .with_read_strategy(ReadStrategy::DatePartitioned(options(threads)))
            .with_page_size(7)
            .run()
            .await?;
        assert_eq!(snapshot.inserted, 30);
        results.push(target.keys(TABLE));
    }

    assert_eq!(results[0], results[1]);
    Ok(())
}

#[tokio::test]
async fn test_failed_bucket_does_not_stop_siblings() -> Result<()> {
    init_tracing();
    let source = source();
    put_range(&source, 1, 2, "2024-01-20 08:00:00")?;
    put_range(&source, 3, 4, "2024-02-10 08:00:00")?;
    put_range(&source, 5, 6, "2024-03-05 08:00:00")?;
    source.fail_pages_covering(ts("2024-02-10 08:00:00"));

    let target = target();
    let failure = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_created(first_quarter())
        .with_read_strategy(ReadStrategy::DatePartitioned(options(3)))
        .run()
        .await
        .unwrap_err();

    match &failure.error {
        SyncError::Partition { bucket, source } => {
            assert_eq!(bucket, "[2024-02-01 00:00:00, 2024-03-01 00:00:00)");
            assert!(matches!(**source, SyncError::Remote(_)));
        },
        other => panic!("unexpected error: {other}"),
    }

    // January and March committed; February wrote nothing
    let mut keys = target.keys(TABLE);
    keys.sort();
    assert_eq!(keys, vec![key(1), key(2), key(5), key(6)]);
    assert_eq!(failure.metrics.inserted, 4);
    Ok(())
}

#[tokio::test]
async fn test_sequential_stops_at_first_failure() -> Result<()> {
    let source = source();
    put_range(&source, 1, 2, "2024-01-20 08:00:00")?;
    put_range(&source, 3, 4, "2024-02-10 08:00:00")?;
    put_range(&source, 5, 6, "2024-03-05 08:00:00")?;
    source.fail_pages_covering(ts("2024-02-10 08:00:00"));

    let target = target();
    let failure = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_created(first_quarter())
        .with_read_strategy(ReadStrategy::DatePartitioned(options(1)))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::Partition { .. }));
    // Newest first: March ran, January never started
    let mut keys = target.keys(TABLE);
    keys.sort();
    assert_eq!(keys, vec![key(5), key(6)]);
    Ok(())
}

/// Fails the February bucket at once; every other bucket sleeps for an hour
struct SlowBuckets {
    completed: AtomicUsize,
}

#[async_trait]
impl BucketAction for SlowBuckets {
    async fn process(&self, bucket: DateRange, _metrics: Arc<Metrics>) -> dmsync_engine::Result<()> {
        if bucket.start() == Some(ts("2024-02-01 00:00:00")) {
            return Err(SyncError::Remote("boom".to_string()));
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn slow_buckets() -> Arc<SlowBuckets> {
    Arc::new(SlowBuckets {
        completed: AtomicUsize::new(0),
    })
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_aborts_siblings() {
    let action = slow_buckets();
    let started = tokio::time::Instant::now();

    let partitioner = Partitioner::new(PartitionOptions {
        fail_fast: true,
        ..options(3)
    });
    let err = partitioner
        .run(action.clone(), first_quarter(), &Metrics::root("job"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Partition { .. }));
    assert_eq!(action.completed.load(Ordering::SeqCst), 0);
    assert!(started.elapsed() < Duration::from_secs(3600));
}

#[tokio::test(start_paused = true)]
async fn test_without_fail_fast_siblings_finish() {
    let action = slow_buckets();

    let err = Partitioner::new(options(3))
        .run(action.clone(), first_quarter(), &Metrics::root("job"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Partition { .. }));
    assert_eq!(action.completed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_outstanding_buckets() {
    init_tracing();
    let action = slow_buckets();
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let range = DateRange::between(ts("2024-03-01 00:00:00"), ts("2024-06-01 00:00:00")).unwrap();
    let err = Partitioner::new(options(2))
        .with_cancellation(token)
        .run(action.clone(), range, &Metrics::root("job"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(action.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pre_cancelled_pipeline_reports_cancelled() -> Result<()> {
    let source = source();
    put_range(&source, 1, 3, "2024-01-20 08:00:00")?;
    let token = CancellationToken::new();
    token.cancel();

    let target = target();
    let failure = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_cancellation(token)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::Cancelled));
    assert!(target.is_empty(TABLE));
    Ok(())
}

/// Counts `per_bucket` reads and inserts into each bucket, yielding between
struct Counting {
    per_bucket: u64,
}

#[async_trait]
impl BucketAction for Counting {
    async fn process(&self, _bucket: DateRange, metrics: Arc<Metrics>) -> dmsync_engine::Result<()> {
        let writer = metrics.child("insert");
        for _ in 0..self.per_bucket {
            metrics.add_input(1);
            writer.add_inserted(1);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_buckets_roll_up_metrics() -> Result<()> {
    let range = DateRange::between(ts("2023-01-01 00:00:00"), ts("2024-01-01 00:00:00"))?;
    let metrics = Metrics::root("job");

    Partitioner::new(options(4))
        .run(Arc::new(Counting { per_bucket: 500 }), range, &metrics)
        .await?;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.input, 12 * 500);
    assert_eq!(snapshot.inserted, 12 * 500);
    assert_eq!(snapshot.processed(), 12 * 500);
    assert!(snapshot.started.is_some());
    assert!(snapshot.started <= snapshot.finished);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_children_from_plain_tasks() -> Result<()> {
    let root = Metrics::root("job");
    let tasks = (0..8).map(|i| {
        let child = root.child(format!("worker-{i}"));
        tokio::spawn(async move {
            for _ in 0..1000 {
                child.add_skipped(1);
            }
        })
    });

    for joined in futures::future::join_all(tasks).await {
        joined?;
    }
    assert_eq!(root.skipped(), 8000);
    Ok(())
}
