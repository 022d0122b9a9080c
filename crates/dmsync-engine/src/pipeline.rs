//! Job composition
//!
//! A [`Pipeline`] runs one [`Action`] against one table by combining a
//! [`ReadStrategy`] with a [`WriteStrategy`]:
//!
//! - `Load`: read everything in the creation range, write with `Insert`
//! - `Refresh`: read rows updated since the target's newest row, write with `Upsert`
//! - `Sync`: reconcile the creation range (per bucket when partitioned)
//! - `Prune`: delete target rows listed in the source's delete audit table
//!
//! Every run gets a fresh root [`Metrics`] node. The result is either the
//! final snapshot or a [`JobFailure`] carrying the partial one.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dmsync_common::types::{DateRange, Key, Timestamp};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{JobFailure, Result, SyncError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::partition::{resolve_range, BucketAction, PartitionOptions, Partitioner};
use crate::reconcile::Reconciler;
use crate::source::{
    KeySetReader, PaginatedReader, RecordReader, RemoteSource, SourceQuery, DEFAULT_PAGE_SIZE,
};
use crate::target::{TableDef, TargetStore};
use crate::writer::{WriteStrategy, Writer};

/// Source table recording deleted rows
pub const AUDIT_DELETE_TABLE: &str = "sys_audit_delete";
/// Audit field naming the table a deleted row belonged to
pub const AUDIT_TABLE_FIELD: &str = "tablename";
/// Audit field holding the deleted row's key
pub const AUDIT_KEY_FIELD: &str = "documentkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Load,
    Refresh,
    Sync,
    Prune,
}

impl Action {
    /// Write strategy used unless overridden
    pub fn default_write_strategy(&self) -> WriteStrategy {
        match self {
            Action::Load => WriteStrategy::Insert,
            Action::Refresh => WriteStrategy::Upsert,
            Action::Sync => WriteStrategy::Update,
            Action::Prune => WriteStrategy::Delete,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Load => "load",
            Action::Refresh => "refresh",
            Action::Sync => "sync",
            Action::Prune => "prune",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Action {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "load" => Ok(Action::Load),
            "refresh" => Ok(Action::Refresh),
            "sync" => Ok(Action::Sync),
            "prune" => Ok(Action::Prune),
            _ => Err(SyncError::Config(format!("Unknown action: {s}"))),
        }
    }
}

/// How source rows are selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStrategy {
    /// One cursor-paginated read over the whole range
    FullScan,
    /// Fetch exactly these keys
    KeySetReplay(Vec<Key>),
    /// One cursor-paginated read per calendar bucket
    DatePartitioned(PartitionOptions),
}

pub struct Pipeline {
    name: String,
    action: Action,
    source: Arc<dyn RemoteSource>,
    target: Arc<dyn TargetStore>,
    table: Arc<TableDef>,
    read: ReadStrategy,
    write: WriteStrategy,
    filter: Option<String>,
    created: DateRange,
    since: Option<Timestamp>,
    page_size: usize,
    min_rows: Option<u64>,
    max_rows: Option<u64>,
    metrics_file: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        action: Action,
        source: Arc<dyn RemoteSource>,
        target: Arc<dyn TargetStore>,
        table: TableDef,
    ) -> Self {
        Self {
            name: format!("{}.{}", table.name, action),
            action,
            source,
            target,
            table: Arc::new(table),
            read: ReadStrategy::FullScan,
            write: action.default_write_strategy(),
            filter: None,
            created: DateRange::unbounded(),
            since: None,
            page_size: DEFAULT_PAGE_SIZE,
            min_rows: None,
            max_rows: None,
            metrics_file: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Apply source, paging, partitioning and row-limit settings from `config`
    pub fn from_config(
        config: &EngineConfig,
        action: Action,
        source: Arc<dyn RemoteSource>,
        target: Arc<dyn TargetStore>,
        table: TableDef,
    ) -> Self {
        let mut pipeline = Self::new(action, source, target, table)
            .with_page_size(config.source.page_size)
            .with_row_limits(config.job.min_rows, config.job.max_rows);
        pipeline.filter = config.job.filter.clone();
        pipeline.metrics_file = config.job.metrics_file.clone();
        if let Some(options) = config.job.partition_options() {
            pipeline.read = ReadStrategy::DatePartitioned(options);
        }
        pipeline
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_read_strategy(mut self, read: ReadStrategy) -> Self {
        self.read = read;
        self
    }

    pub fn with_write_strategy(mut self, write: WriteStrategy) -> Self {
        self.write = write;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Creation-date range for load, sync and prune
    pub fn with_created(mut self, created: DateRange) -> Self {
        self.created = created;
        self
    }

    /// Lower update bound for refresh; defaults to the target's newest row
    pub fn with_since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_row_limits(mut self, min_rows: Option<u64>, max_rows: Option<u64>) -> Self {
        self.min_rows = min_rows;
        self.max_rows = max_rows;
        self
    }

    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn base_query(&self) -> SourceQuery {
        let query = SourceQuery::new(self.table.source_table.clone()).with_created(self.created);
        match &self.filter {
            Some(filter) => query.with_filter(filter.clone()),
            None => query,
        }
    }

    /// Run the job to completion
    #[instrument(skip(self), fields(job = %self.name, action = %self.action, run_id = %Uuid::new_v4()))]
    pub async fn run(&self) -> std::result::Result<MetricsSnapshot, JobFailure> {
        let metrics = Metrics::root(self.name.clone());
        metrics.start();

        let mut result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.execute(&metrics) => result,
        };
        metrics.finish();

        if result.is_ok() {
            result = self.check_row_counts(&metrics);
        }

        let snapshot = metrics.snapshot();
        if let Some(path) = &self.metrics_file {
            if let Err(err) = snapshot.write_to(path) {
                warn!(path = %path.display(), error = %err, "Failed to write metrics file");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        match result {
            Ok(()) => {
                info!(metrics = %snapshot, "Job complete");
                Ok(snapshot)
            },
            Err(error) => {
                warn!(error = %error, metrics = %snapshot, "Job failed");
                Err(JobFailure {
                    error,
                    metrics: snapshot,
                })
            },
        }
    }

    fn check_row_counts(&self, metrics: &Metrics) -> Result<()> {
        if let Some(limit) = self.max_rows {
            if metrics.input() > limit {
                return Err(SyncError::TooManyRows {
                    limit,
                    seen: metrics.input(),
                });
            }
        }
        if let Some(minimum) = self.min_rows {
            if metrics.processed() < minimum {
                return Err(SyncError::TooFewRows {
                    minimum,
                    processed: metrics.processed(),
                });
            }
        }
        Ok(())
    }

    async fn execute(&self, metrics: &Arc<Metrics>) -> Result<()> {
        self.table.validate()?;
        let query = self.base_query();
        query.validate()?;
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be greater than 0".to_string()));
        }

        match self.action {
            Action::Load => self.load(query, metrics).await,
            Action::Refresh => {
                let since = match self.since {
                    Some(since) => Some(since),
                    None => self.target.max_updated(&self.table).await?,
                };
                info!(since = ?since, "Refreshing rows updated since");
                let query = match since {
                    Some(since) => query.with_updated(DateRange::since(since)),
                    None => query,
                };
                self.load(query, metrics).await
            },
            Action::Sync => self.sync(metrics).await,
            Action::Prune => self.prune(metrics).await,
        }
    }

    fn loader(&self, query: SourceQuery) -> Loader {
        Loader {
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            table: Arc::clone(&self.table),
            query,
            page_size: self.page_size,
            max_rows: self.max_rows,
            strategy: self.write,
        }
    }

    async fn load(&self, query: SourceQuery, metrics: &Arc<Metrics>) -> Result<()> {
        match &self.read {
            ReadStrategy::FullScan => self.loader(query.clone()).load(query, Arc::clone(metrics)).await,
            ReadStrategy::KeySetReplay(keys) => {
                let mut reader = KeySetReader::new(
                    Arc::clone(&self.source),
                    query,
                    keys.iter().cloned(),
                    self.page_size,
                    Arc::clone(metrics),
                )?;
                let mut session = self.target.session().await?;
                let writer = Writer::new(self.write, Arc::clone(&self.table), Arc::clone(metrics));
                writer.drain(&mut reader, session.as_mut()).await.map(|_| ())
            },
            ReadStrategy::DatePartitioned(options) => {
                let Some(range) = resolve_range(self.source.as_ref(), &query).await? else {
                    info!("No source rows in range; nothing to load");
                    return Ok(());
                };
                let partitioner = Partitioner::new(*options).with_cancellation(self.cancel.clone());
                partitioner.run(Arc::new(self.loader(query)), range, metrics).await
            },
        }
    }

    async fn sync(&self, metrics: &Arc<Metrics>) -> Result<()> {
        let reconciler = Reconciler::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            Arc::clone(&self.table),
        )
        .with_filter(self.filter.clone())
        .with_page_size(self.page_size)
        .with_max_rows(self.max_rows);

        match &self.read {
            ReadStrategy::FullScan => reconciler.run(self.created, metrics).await.map(|_| ()),
            ReadStrategy::KeySetReplay(_) => Err(SyncError::Config(
                "sync derives its own key sets and cannot replay a fixed one".to_string(),
            )),
            ReadStrategy::DatePartitioned(options) => {
                // Bounds resolved from the source alone would miss target rows
                // outside them, and those are exactly the rows to delete
                if !self.created.is_bounded() {
                    return Err(SyncError::Config(
                        "partitioned sync needs a bounded creation range".to_string(),
                    ));
                }
                let partitioner = Partitioner::new(*options).with_cancellation(self.cancel.clone());
                partitioner.run(Arc::new(reconciler), self.created, metrics).await
            },
        }
    }

    async fn prune(&self, metrics: &Arc<Metrics>) -> Result<()> {
        let created = match self.since {
            Some(since) => DateRange::since(since),
            None => self.created,
        };
        let audit = SourceQuery::new(AUDIT_DELETE_TABLE)
            .with_filter(format!("{}={}", AUDIT_TABLE_FIELD, self.table.source_table))
            .with_created(created)
            .with_fields([AUDIT_KEY_FIELD]);

        let mut reader = PaginatedReader::new(
            Arc::clone(&self.source),
            audit,
            self.page_size,
            metrics.child("audit"),
        )?
        .with_max_rows(self.max_rows);
        let mut session = self.target.session().await?;
        let writer = Writer::new(WriteStrategy::Delete, Arc::clone(&self.table), Arc::clone(metrics));

        while let Some(page) = reader.next_page().await? {
            let keys: Vec<Key> = page
                .iter()
                .filter_map(|r| r.get(AUDIT_KEY_FIELD))
                .filter(|k| !k.is_empty())
                .map(Key::from)
                .collect();
            writer.delete_keys(session.as_mut(), &keys, self.page_size).await?;
        }
        Ok(())
    }
}

/// Cursor read of one query written straight to the target
struct Loader {
    source: Arc<dyn RemoteSource>,
    target: Arc<dyn TargetStore>,
    table: Arc<TableDef>,
    query: SourceQuery,
    page_size: usize,
    max_rows: Option<u64>,
    strategy: WriteStrategy,
}

impl Loader {
    async fn load(&self, query: SourceQuery, metrics: Arc<Metrics>) -> Result<()> {
        let mut reader = PaginatedReader::new(Arc::clone(&self.source), query, self.page_size, Arc::clone(&metrics))?
            .with_max_rows(self.max_rows);
        let mut session = self.target.session().await?;
        let writer = Writer::new(self.strategy, Arc::clone(&self.table), metrics);
        writer.drain(&mut reader, session.as_mut()).await.map(|_| ())
    }
}

#[async_trait]
impl BucketAction for Loader {
    async fn process(&self, bucket: DateRange, metrics: Arc<Metrics>) -> Result<()> {
        let created = self.query.created.intersect(&bucket).unwrap_or(bucket);
        self.load(self.query.clone().with_created(created), metrics).await
    }
}
