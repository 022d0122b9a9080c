//! Key-cursor paginated reader

use std::sync::Arc;

use async_trait::async_trait;
use dmsync_common::types::{Key, Page};
use tracing::{debug, info, instrument, warn};

use super::{check_ascending, KeyPredicate, PageRequest, RecordReader, RemoteSource, SourceQuery, SourceStats};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;

#[derive(Debug, Default)]
struct Progress {
    stats: Option<SourceStats>,
    cursor: Option<Key>,
    rows: u64,
    pages: u64,
    done: bool,
}

/// Reads every row matching a [`SourceQuery`], ascending by key.
///
/// Each request carries `key > last key of the previous page` instead of an
/// offset, so the position in the result set is anchored to rows already
/// observed. The reader can be restarted from scratch with [`reset`] but not
/// resumed mid-sequence.
///
/// [`reset`]: PaginatedReader::reset
pub struct PaginatedReader {
    source: Arc<dyn RemoteSource>,
    query: SourceQuery,
    page_size: usize,
    max_rows: Option<u64>,
    metrics: Arc<Metrics>,
    progress: Progress,
    expected_recorded: bool,
}

impl PaginatedReader {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        query: SourceQuery,
        page_size: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        query.validate()?;
        if page_size == 0 {
            return Err(SyncError::Config("page size must be greater than 0".to_string()));
        }
        Ok(Self {
            source,
            query,
            page_size,
            max_rows: None,
            metrics,
            progress: Progress::default(),
            expected_recorded: false,
        })
    }

    /// Fail instead of truncating when more than `limit` rows show up
    pub fn with_max_rows(mut self, limit: Option<u64>) -> Self {
        self.max_rows = limit;
        self
    }

    pub fn query(&self) -> &SourceQuery {
        &self.query
    }

    /// Stats pre-check; issued once per run and cached
    #[instrument(skip(self), fields(table = %self.query.table, created = %self.query.created))]
    pub async fn prepare(&mut self) -> Result<SourceStats> {
        if let Some(stats) = self.progress.stats {
            return Ok(stats);
        }

        let stats = self.source.stats(&self.query).await?;
        debug!(expected = stats.count, "Stats pre-check complete");

        if !self.expected_recorded {
            self.metrics.add_expected(stats.count);
            self.expected_recorded = true;
        }
        self.metrics.start();
        self.progress.stats = Some(stats);
        Ok(stats)
    }

    /// Expected row count from the stats pre-check, once prepared
    pub fn expected(&self) -> Option<u64> {
        self.progress.stats.map(|s| s.count)
    }

    pub fn rows_read(&self) -> u64 {
        self.progress.rows
    }

    pub fn pages_read(&self) -> u64 {
        self.progress.pages
    }

    pub fn is_done(&self) -> bool {
        self.progress.done
    }

    /// Forget all progress so the next page starts from the first key again
    pub fn reset(&mut self) {
        self.progress = Progress::default();
    }

    fn complete(&mut self) {
        self.progress.done = true;
        self.metrics.finish();

        let expected = self.expected().unwrap_or(0);
        if self.progress.rows != expected {
            // Server-side access control can hide rows from the page call but
            // not from the count, so a mismatch is not fatal.
            warn!(
                table = %self.query.table,
                created = %self.query.created,
                expected,
                actual = self.progress.rows,
                "Rows read differ from stats pre-check"
            );
        } else {
            info!(
                table = %self.query.table,
                created = %self.query.created,
                rows = self.progress.rows,
                pages = self.progress.pages,
                "Read complete"
            );
        }
    }
}

#[async_trait]
impl RecordReader for PaginatedReader {
    async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.progress.done {
            return Ok(None);
        }
        let expected = self.prepare().await?.count;

        let request = PageRequest {
            query: self.query.clone(),
            keys: KeyPredicate::After(self.progress.cursor.clone()),
            limit: self.page_size,
        };
        let page = self.source.page(&request).await?;

        if page.is_empty() {
            self.complete();
            return Ok(None);
        }

        check_ascending(self.progress.cursor.as_ref(), &page)?;

        let size = page.len() as u64;
        self.progress.rows += size;
        self.progress.pages += 1;
        if let Some(limit) = self.max_rows {
            if self.progress.rows > limit {
                return Err(SyncError::TooManyRows {
                    limit,
                    seen: self.progress.rows,
                });
            }
        }

        self.progress.cursor = page.last().map(|r| r.key().clone());
        self.metrics.add_input(size);
        debug!(
            page = self.progress.pages,
            rows = size,
            total = self.progress.rows,
            cursor = ?self.progress.cursor,
            "Fetched page"
        );

        // A short page is only final once the expected count is reached;
        // access-control filtering can shorten pages in the middle of a run.
        if page.len() < self.page_size && self.progress.rows >= expected {
            self.complete();
        }

        Ok(Some(page))
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
