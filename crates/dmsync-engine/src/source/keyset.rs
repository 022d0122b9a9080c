//! Key-set replay reader

use std::sync::Arc;

use async_trait::async_trait;
use dmsync_common::types::{Key, Page};
use tracing::{debug, warn};

use super::{check_ascending, KeyPredicate, PageRequest, RecordReader, RemoteSource, SourceQuery};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;

/// Fetches full rows for a closed, known set of keys.
///
/// The population is fixed up front, so there is no cursor: keys are sorted,
/// cut into slices of `slice_size` and each slice is requested with a
/// `key IN (...)` predicate. Keys deleted upstream in the meantime simply come
/// back missing.
pub struct KeySetReader {
    source: Arc<dyn RemoteSource>,
    query: SourceQuery,
    keys: Vec<Key>,
    slice_size: usize,
    position: usize,
    rows: u64,
    done: bool,
    metrics: Arc<Metrics>,
}

impl KeySetReader {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        query: SourceQuery,
        keys: impl IntoIterator<Item = Key>,
        slice_size: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        query.validate()?;
        if slice_size == 0 {
            return Err(SyncError::Config("page size must be greater than 0".to_string()));
        }

        let mut keys: Vec<Key> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        metrics.add_expected(keys.len() as u64);
        Ok(Self {
            source,
            query,
            keys,
            slice_size,
            position: 0,
            rows: 0,
            done: false,
            metrics,
        })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    fn complete(&mut self) {
        self.done = true;
        self.metrics.finish();
        if self.rows != self.keys.len() as u64 {
            warn!(
                table = %self.query.table,
                expected = self.keys.len(),
                actual = self.rows,
                "Key-set replay returned fewer rows than requested keys"
            );
        }
    }
}

#[async_trait]
impl RecordReader for KeySetReader {
    async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.position == 0 && !self.done {
            self.metrics.start();
        }

        while !self.done {
            if self.position >= self.keys.len() {
                self.complete();
                break;
            }

            let start = self.position;
            let end = (start + self.slice_size).min(self.keys.len());
            let slice = self.keys[start..end].to_vec();
            self.position = end;

            let request = PageRequest {
                query: self.query.clone(),
                keys: KeyPredicate::In(slice),
                limit: self.slice_size,
            };
            let page = self.source.page(&request).await?;
            check_ascending(None, &page)?;

            debug!(
                table = %self.query.table,
                requested = end - start,
                returned = page.len(),
                "Fetched key slice"
            );

            if !page.is_empty() {
                self.rows += page.len() as u64;
                self.metrics.add_input(page.len() as u64);
                return Ok(Some(page));
            }
        }

        Ok(None)
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
