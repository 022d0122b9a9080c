//! Remote record source
//!
//! [`RemoteSource`] is the contract the engine consumes from the remote API:
//! an aggregate `stats` call and a `page` call that honours a key predicate.
//! Two readers sit on top of it:
//!
//! - [`PaginatedReader`]: filter + ranges, paged with a "key greater than the
//!   last key seen" cursor so that rows inserted or deleted upstream between
//!   page fetches can neither be skipped nor returned twice
//! - [`KeySetReader`]: replays a closed, already known set of keys in fixed
//!   size slices with a "key in {...}" predicate

pub mod http;
pub mod keyset;
pub mod memory;
pub mod paginated;
pub mod query;

pub use keyset::KeySetReader;
pub use paginated::PaginatedReader;

use std::sync::Arc;

use async_trait::async_trait;
use dmsync_common::types::{DateRange, Key, Page, Record, Timestamp};

use crate::error::{Result, SyncError};
use crate::metrics::Metrics;

/// Default number of rows requested per page
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// What to read: table, caller filter, ranges and projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub table: String,
    /// Encoded filter supplied by the caller, AND-ed with everything else
    pub filter: Option<String>,
    pub created: DateRange,
    pub updated: DateRange,
    /// Projection; empty means all fields
    pub fields: Vec<String>,
}

impl SourceQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            created: DateRange::unbounded(),
            updated: DateRange::unbounded(),
            fields: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_created(mut self, created: DateRange) -> Self {
        self.created = created;
        self
    }

    pub fn with_updated(mut self, updated: DateRange) -> Self {
        self.updated = updated;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Validate caller-supplied parts before any request is made
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(SyncError::Config("source table cannot be empty".to_string()));
        }
        if let Some(filter) = &self.filter {
            query::validate_filter(filter)?;
        }
        Ok(())
    }
}

/// Row selection applied on top of the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPredicate {
    /// Rows with a key strictly greater than the cursor (all rows when `None`)
    After(Option<Key>),
    /// Rows whose key is in the given set
    In(Vec<Key>),
}

/// One page fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub query: SourceQuery,
    pub keys: KeyPredicate,
    pub limit: usize,
}

/// Aggregate answer of the stats pre-check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceStats {
    pub count: u64,
    pub min_created: Option<Timestamp>,
    pub max_created: Option<Timestamp>,
}

/// The remote paged API
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Count and creation-date bounds of the rows matching `query`
    async fn stats(&self, query: &SourceQuery) -> Result<SourceStats>;

    /// Up to `request.limit` matching rows, ascending by key.
    ///
    /// Records carry the key and both timestamps whatever the projection.
    async fn page(&self, request: &PageRequest) -> Result<Page>;
}

/// Lazy, finite sequence of pages
#[async_trait]
pub trait RecordReader: Send {
    /// Next non-empty page, or `None` once the sequence is exhausted
    async fn next_page(&mut self) -> Result<Option<Page>>;

    fn metrics(&self) -> &Arc<Metrics>;

    /// Drain the reader into memory
    async fn read_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }
}

/// Reject a page whose keys do not strictly ascend past `previous`
pub(crate) fn check_ascending(previous: Option<&Key>, page: &[Record]) -> Result<()> {
    let mut last = previous;
    for record in page {
        if let Some(prev) = last {
            if record.key() <= prev {
                return Err(SyncError::OutOfOrder {
                    previous: prev.clone(),
                    key: record.key().clone(),
                });
            }
        }
        last = Some(record.key());
    }
    Ok(())
}
