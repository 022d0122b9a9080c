//! Pipeline tests
//!
//! One test per action plus the job-level checks: row limits, the metrics
//! file, partitioned sync and key-set replay.

mod common;

use std::path::PathBuf;

use anyhow::Result;
use common::{in_sync, init_tracing, key, put, put_range, source, table, target, ts, TABLE};
use dmsync_common::types::{DateRange, Interval};
use dmsync_engine::config::EngineConfig;
use dmsync_engine::partition::PartitionOptions;
use dmsync_engine::pipeline::AUDIT_DELETE_TABLE;
use dmsync_engine::source::memory::MemorySource;
use dmsync_engine::{Action, Pipeline, ReadStrategy, SyncError};

fn audit(source: &MemorySource, n: u32, table: &str, document: &str, when: &str) -> Result<()> {
    let id = key(10_000 + n);
    source.put(
        AUDIT_DELETE_TABLE,
        &[
            ("sys_id", id.as_str()),
            ("sys_created_on", when),
            ("sys_updated_on", when),
            ("tablename", table),
            ("documentkey", document),
        ],
    )?;
    Ok(())
}

#[tokio::test]
async fn test_load_inserts_and_skips_existing() -> Result<()> {
    init_tracing();
    let source = source();
    put_range(&source, 1, 5, "2024-01-10 00:00:00")?;
    let target = target();
    target.seed(TABLE, key(2), ts("2024-01-10 00:00:00"), ts("2024-01-10 00:00:00"));

    let snapshot = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_page_size(2)
        .run()
        .await?;

    assert_eq!(snapshot.inserted, 4);
    assert_eq!(snapshot.skipped, 1);
    assert_eq!(snapshot.processed(), 5);
    assert_eq!(target.len(TABLE), 5);
    assert!(snapshot.started.is_some() && snapshot.finished.is_some());
    Ok(())
}

#[tokio::test]
async fn test_refresh_upserts_rows_updated_since_target_max() -> Result<()> {
    let source = source();
    put(&source, 1, "2024-01-01 00:00:00", "2024-01-05 00:00:00")?;
    put(&source, 2, "2024-01-01 00:00:00", "2024-01-15 00:00:00")?;
    put(&source, 3, "2024-01-01 00:00:00", "2024-01-10 00:00:00")?;
    put(&source, 4, "2024-01-01 00:00:00", "2024-01-16 00:00:00")?;

    let target = target();
    let created = ts("2024-01-01 00:00:00");
    target.seed(TABLE, key(1), created, ts("2024-01-05 00:00:00"));
    target.seed(TABLE, key(2), created, ts("2024-01-05 00:00:00"));
    target.seed(TABLE, key(3), created, ts("2024-01-10 00:00:00"));

    let snapshot = Pipeline::new(Action::Refresh, source.clone(), target.clone(), table())
        .run()
        .await?;

    // Since is inclusive, so the row at the target's max is read again
    assert_eq!(snapshot.input, 3);
    assert_eq!(snapshot.updated, 2);
    assert_eq!(snapshot.inserted, 1);
    assert!(in_sync(&source, &target));
    Ok(())
}

#[tokio::test]
async fn test_refresh_with_explicit_since() -> Result<()> {
    let source = source();
    put(&source, 1, "2024-01-01 00:00:00", "2024-01-05 00:00:00")?;
    put(&source, 2, "2024-01-01 00:00:00", "2024-01-15 00:00:00")?;

    let target = target();
    let snapshot = Pipeline::new(Action::Refresh, source.clone(), target.clone(), table())
        .with_since(ts("2024-01-10 00:00:00"))
        .run()
        .await?;

    assert_eq!(snapshot.inserted, 1);
    assert_eq!(target.keys(TABLE), vec![key(2)]);
    Ok(())
}

#[tokio::test]
async fn test_prune_deletes_audited_keys_for_this_table_only() -> Result<()> {
    init_tracing();
    let source = source();
    let when = "2024-02-01 00:00:00";
    audit(&source, 1, TABLE, key(2).as_str(), when)?;
    audit(&source, 2, TABLE, key(4).as_str(), when)?;
    // Already gone from the target
    audit(&source, 3, TABLE, key(99).as_str(), when)?;
    // Another table's delete
    audit(&source, 4, "problem", key(1).as_str(), when)?;

    let target = target();
    for n in 1..=5 {
        target.seed(TABLE, key(n), ts("2024-01-01 00:00:00"), ts("2024-01-01 00:00:00"));
    }

    let snapshot = Pipeline::new(Action::Prune, source.clone(), target.clone(), table())
        .run()
        .await?;

    assert_eq!(snapshot.deleted, 2);
    assert_eq!(snapshot.skipped, 1);
    assert_eq!(target.keys(TABLE), vec![key(1), key(3), key(5)]);
    Ok(())
}

#[tokio::test]
async fn test_too_few_rows_fails_with_partial_metrics() -> Result<()> {
    let source = source();
    put_range(&source, 1, 3, "2024-01-10 00:00:00")?;
    let target = target();

    let failure = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_row_limits(Some(10), None)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        SyncError::TooFewRows {
            minimum: 10,
            processed: 3
        }
    ));
    assert_eq!(failure.metrics.inserted, 3);
    // Committed pages stay committed
    assert_eq!(target.len(TABLE), 3);
    Ok(())
}

#[tokio::test]
async fn test_too_many_rows_stops_the_read() -> Result<()> {
    let source = source();
    put_range(&source, 1, 5, "2024-01-10 00:00:00")?;
    let target = target();

    let failure = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_page_size(2)
        .with_row_limits(None, Some(2))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::TooManyRows { limit: 2, .. }));
    assert_eq!(target.len(TABLE), 2);
    Ok(())
}

#[tokio::test]
async fn test_sync_enforces_row_cap() -> Result<()> {
    let source = source();
    put_range(&source, 1, 5, "2024-01-10 00:00:00")?;
    let target = target();

    let failure = Pipeline::new(Action::Sync, source.clone(), target.clone(), table())
        .with_page_size(2)
        .with_row_limits(None, Some(2))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::TooManyRows { limit: 2, .. }));
    // The plan pass fails before any phase writes
    assert!(target.is_empty(TABLE));
    Ok(())
}

#[tokio::test]
async fn test_partitioned_sync_enforces_row_cap() -> Result<()> {
    let source = source();
    put_range(&source, 1, 2, "2024-01-20 00:00:00")?;
    put_range(&source, 3, 4, "2024-02-20 00:00:00")?;
    let target = target();

    let range = DateRange::between(ts("2024-01-01 00:00:00"), ts("2024-03-01 00:00:00"))?;
    let failure = Pipeline::new(Action::Sync, source.clone(), target.clone(), table())
        .with_created(range)
        .with_read_strategy(ReadStrategy::DatePartitioned(PartitionOptions {
            threads: 1,
            interval: Interval::Month,
            ..PartitionOptions::default()
        }))
        .with_row_limits(None, Some(3))
        .run()
        .await
        .unwrap_err();

    // Each bucket stays under the cap but the job total does not
    assert!(matches!(failure.error, SyncError::TooManyRows { limit: 3, seen: 4 }));
    assert_eq!(failure.metrics.input, 4);
    assert_eq!(failure.metrics.expected, 4);
    Ok(())
}

#[tokio::test]
async fn test_metrics_file_is_written() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path: PathBuf = dir.path().join("incident.metrics");

    let source = source();
    put_range(&source, 1, 3, "2024-01-10 00:00:00")?;
    Pipeline::new(Action::Load, source.clone(), target(), table())
        .with_metrics_file(&path)
        .run()
        .await?;

    let content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.iter().any(|l| l.starts_with("start=") && l.len() > "start=".len()));
    assert!(lines.contains(&"inserted=3"));
    assert!(lines.contains(&"deleted=0"));
    assert!(lines.contains(&"processed=3"));
    Ok(())
}

#[tokio::test]
async fn test_metrics_file_is_written_on_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("incident.metrics");

    let source = source();
    put_range(&source, 1, 2, "2024-01-10 00:00:00")?;
    let failure = Pipeline::new(Action::Load, source.clone(), target(), table())
        .with_row_limits(Some(5), None)
        .with_metrics_file(&path)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::TooFewRows { .. }));
    assert!(std::fs::read_to_string(&path)?.contains("inserted=2"));
    Ok(())
}

#[tokio::test]
async fn test_partitioned_sync_reconciles_each_bucket() -> Result<()> {
    init_tracing();
    let source = source();
    put_range(&source, 1, 3, "2024-01-20 00:00:00")?;
    put_range(&source, 4, 6, "2024-02-20 00:00:00")?;
    put_range(&source, 7, 9, "2024-03-20 00:00:00")?;

    let target = target();
    // Stale row, orphan row, and an up-to-date row
    target.seed(TABLE, key(2), ts("2024-01-20 00:00:00"), ts("2024-01-01 00:00:00"));
    target.seed(TABLE, key(50), ts("2024-02-25 00:00:00"), ts("2024-02-25 00:00:00"));
    target.seed(TABLE, key(8), ts("2024-03-20 00:00:00"), ts("2024-03-20 00:00:00"));

    let range = DateRange::between(ts("2024-01-01 00:00:00"), ts("2024-04-01 00:00:00"))?;
    let snapshot = Pipeline::new(Action::Sync, source.clone(), target.clone(), table())
        .with_created(range)
        .with_read_strategy(ReadStrategy::DatePartitioned(PartitionOptions {
            threads: 2,
            interval: Interval::Month,
            ..PartitionOptions::default()
        }))
        .run()
        .await?;

    assert_eq!(snapshot.inserted, 7);
    assert_eq!(snapshot.updated, 1);
    assert_eq!(snapshot.skipped, 1);
    assert_eq!(snapshot.deleted, 1);
    assert!(in_sync(&source, &target));
    // One session per bucket with work to do
    assert_eq!(target.sessions_opened(), 3);
    Ok(())
}

#[tokio::test]
async fn test_partitioned_sync_needs_bounded_range() -> Result<()> {
    let failure = Pipeline::new(Action::Sync, source(), target(), table())
        .with_created(DateRange::since(ts("2024-01-01 00:00:00")))
        .with_read_strategy(ReadStrategy::DatePartitioned(PartitionOptions::default()))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::Config(_)));
    Ok(())
}

#[tokio::test]
async fn test_key_set_replay_load() -> Result<()> {
    let source = source();
    put_range(&source, 1, 10, "2024-01-10 00:00:00")?;
    let target = target();

    let snapshot = Pipeline::new(Action::Load, source.clone(), target.clone(), table())
        .with_read_strategy(ReadStrategy::KeySetReplay(vec![key(7), key(3), key(11)]))
        .with_page_size(2)
        .run()
        .await?;

    assert_eq!(snapshot.expected, 3);
    assert_eq!(snapshot.input, 2);
    assert_eq!(target.keys(TABLE), vec![key(3), key(7)]);
    Ok(())
}

#[tokio::test]
async fn test_sync_rejects_key_set_replay() -> Result<()> {
    let failure = Pipeline::new(Action::Sync, source(), target(), table())
        .with_read_strategy(ReadStrategy::KeySetReplay(vec![key(1)]))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::Config(_)));
    Ok(())
}

#[tokio::test]
async fn test_from_config_applies_job_settings() -> Result<()> {
    let source = source();
    put_range(&source, 1, 4, "2024-01-10 00:00:00")?;
    put_range(&source, 5, 6, "2024-02-10 00:00:00")?;
    let target = target();

    let mut config = EngineConfig::default();
    config.source.page_size = 3;
    config.job.interval = Some(Interval::Month);
    config.job.threads = 2;
    config.job.max_rows = Some(100);

    let snapshot = Pipeline::from_config(&config, Action::Load, source.clone(), target.clone(), table())
        .run()
        .await?;

    assert_eq!(snapshot.inserted, 6);
    // Two monthly buckets resolved from the source's own bounds
    assert_eq!(target.sessions_opened(), 2);
    assert!(source.requests().iter().all(|r| r.limit == 3));
    Ok(())
}

#[tokio::test]
async fn test_invalid_filter_fails_before_io() -> Result<()> {
    let source = source();
    let failure = Pipeline::new(Action::Load, source.clone(), target(), table())
        .with_filter("priority=1^NQpriority=2")
        .run()
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SyncError::Config(_)));
    assert!(source.requests().is_empty());
    Ok(())
}
