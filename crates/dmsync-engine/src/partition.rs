//! Date-range partitioning
//!
//! A creation-date range is cut into calendar buckets (see [`buckets`]) and a
//! [`BucketAction`] runs once per bucket. Creation dates never change, so a
//! row belongs to exactly one bucket and concurrent buckets never touch the
//! same row.
//!
//! With more than one thread, buckets run as tasks on a [`JoinSet`] gated by a
//! [`Semaphore`]. The driver waits with a timeout and logs progress every
//! `progress_interval`; a failed bucket does not stop its siblings unless
//! `fail_fast` is set, and the first failure is returned once all are done.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use dmsync_common::types::{DateRange, Interval};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::source::{RemoteSource, SourceQuery};

/// Default delay between progress reports while waiting on buckets
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Work performed for one bucket
#[async_trait]
pub trait BucketAction: Send + Sync {
    /// Process the rows created within `bucket`, counting into `metrics`
    async fn process(&self, bucket: DateRange, metrics: Arc<Metrics>) -> Result<()>;
}

/// Cut a bounded range into calendar buckets, newest first.
///
/// Each bucket ends where the previous (newer) one starts. Interior edges are
/// aligned to `interval`; the newest and oldest edges are the range's own.
pub fn buckets(range: &DateRange, interval: Interval) -> Result<Vec<DateRange>> {
    let (Some(start), Some(end)) = (range.start(), range.end()) else {
        return Err(SyncError::Config(format!("cannot partition unbounded range {range}")));
    };

    let mut result = Vec::new();
    let mut upper = end;
    while upper > start {
        let lower = interval.bucket_start(upper)?.max(start);
        result.push(DateRange::between(lower, upper)?);
        upper = lower;
    }
    Ok(result)
}

/// Close the open ends of `query.created` using the source's own bounds.
///
/// Returns `None` when no rows match.
pub async fn resolve_range(source: &dyn RemoteSource, query: &SourceQuery) -> Result<Option<DateRange>> {
    let range = query.created;
    if range.is_bounded() {
        return Ok(Some(range));
    }

    let stats = source.stats(query).await?;
    if stats.count == 0 {
        return Ok(None);
    }

    let start = range.start().or(stats.min_created);
    // The range is end-exclusive, so step past the newest row
    let end = range.end().or_else(|| stats.max_created.map(|ts| ts + TimeDelta::seconds(1)));
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some(DateRange::between(start, end)?)),
        _ => Err(SyncError::Remote(format!(
            "stats for {} reported {} rows but no creation bounds",
            query.table, stats.count
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    /// Concurrent buckets; 0 or 1 runs them one after another
    pub threads: usize,
    pub interval: Interval,
    pub progress_interval: Duration,
    /// Cancel the remaining buckets as soon as one fails
    pub fail_fast: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            interval: Interval::Month,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            fail_fast: false,
        }
    }
}

pub struct Partitioner {
    options: PartitionOptions,
    cancel: CancellationToken,
}

impl Partitioner {
    pub fn new(options: PartitionOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop all outstanding buckets when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    /// Run `action` once per bucket of `range`, each with a child of `metrics`
    #[instrument(skip(self, action, metrics), fields(interval = %self.options.interval, threads = self.options.threads))]
    pub async fn run(&self, action: Arc<dyn BucketAction>, range: DateRange, metrics: &Arc<Metrics>) -> Result<()> {
        let buckets = buckets(&range, self.options.interval)?;
        info!(%range, buckets = buckets.len(), "Partitioned range");

        metrics.start();
        let result = if self.options.threads <= 1 {
            self.run_sequential(action, buckets, metrics).await
        } else {
            self.run_parallel(action, buckets, metrics).await
        };
        metrics.finish();
        result
    }

    async fn run_sequential(
        &self,
        action: Arc<dyn BucketAction>,
        buckets: Vec<DateRange>,
        metrics: &Arc<Metrics>,
    ) -> Result<()> {
        for bucket in buckets {
            let child = metrics.child(bucket.to_string());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(%bucket, "Cancelled");
                    return Err(SyncError::Cancelled);
                }
                result = action.process(bucket, child) => {
                    result.map_err(|e| partition_error(bucket, e))?;
                }
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        action: Arc<dyn BucketAction>,
        buckets: Vec<DateRange>,
        metrics: &Arc<Metrics>,
    ) -> Result<()> {
        let total = buckets.len();
        let semaphore = Arc::new(Semaphore::new(self.options.threads));
        let mut tasks = JoinSet::new();

        for bucket in buckets {
            let action = Arc::clone(&action);
            let semaphore = Arc::clone(&semaphore);
            let child = metrics.child(bucket.to_string());
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| SyncError::Cancelled)?;
                debug!(%bucket, "Bucket started");
                action.process(bucket, child).await.map_err(|e| partition_error(bucket, e))
            });
        }

        let mut completed = 0usize;
        let mut first_error: Option<SyncError> = None;

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(completed, total, "Cancelled; aborting outstanding buckets");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(SyncError::Cancelled);
                }
                joined = tokio::time::timeout(self.options.progress_interval, tasks.join_next()) => joined,
            };

            let outcome = match joined {
                Err(_) => {
                    info!(
                        completed,
                        total,
                        rows = metrics.input(),
                        processed = metrics.processed(),
                        "Waiting on buckets"
                    );
                    continue;
                },
                Ok(None) => break,
                Ok(Some(Ok(outcome))) => outcome,
                Ok(Some(Err(join_error))) if join_error.is_cancelled() => continue,
                Ok(Some(Err(join_error))) => Err(SyncError::TaskPanicked(join_error.to_string())),
            };

            completed += 1;
            if let Err(err) = outcome {
                error!(error = %err, completed, total, "Bucket failed");
                if self.options.fail_fast {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }

        info!(completed, total, failed = first_error.is_some(), "All buckets finished");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn partition_error(bucket: DateRange, source: SyncError) -> SyncError {
    match source {
        SyncError::Cancelled => SyncError::Cancelled,
        source => SyncError::Partition {
            bucket: bucket.to_string(),
            source: Box::new(source),
        },
    }
}
