//! In-memory remote source for tests and dry runs
//!
//! Holds rows per table, honours the filter (simple `field=value` clauses
//! joined by `^`), both date ranges, the key predicate and the projection,
//! and records every page request so callers can assert on paging behaviour.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dmsync_common::types::{FieldNames, Key, Page, Record, Timestamp};

use super::{KeyPredicate, PageRequest, RemoteSource, SourceQuery, SourceStats};
use crate::error::{Result, SyncError};

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, BTreeMap<Key, Record>>,
    requests: Vec<PageRequest>,
    returned: Vec<usize>,
    fail_created: Vec<Timestamp>,
    stats_override: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MemorySource {
    names: FieldNames,
    state: Mutex<State>,
}

impl MemorySource {
    pub fn new(names: FieldNames) -> Self {
        Self {
            names,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn field_names(&self) -> &FieldNames {
        &self.names
    }

    /// Insert or replace a row
    pub fn upsert(&self, table: &str, record: Record) {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.key().clone(), record);
    }

    /// Build a row from `(field, value)` pairs and insert it
    pub fn put(&self, table: &str, pairs: &[(&str, &str)]) -> Result<()> {
        let fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record = Record::from_fields(fields, &self.names)?;
        self.upsert(table, record);
        Ok(())
    }

    pub fn get(&self, table: &str, key: &Key) -> Option<Record> {
        self.state().tables.get(table).and_then(|rows| rows.get(key).cloned())
    }

    pub fn remove(&self, table: &str, key: &Key) -> Option<Record> {
        self.state().tables.get_mut(table).and_then(|rows| rows.remove(key))
    }

    pub fn len(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Every page request seen so far
    pub fn requests(&self) -> Vec<PageRequest> {
        self.state().requests.clone()
    }

    /// Row counts returned for each page request, in order
    pub fn returned_sizes(&self) -> Vec<usize> {
        self.state().returned.clone()
    }

    /// Fail any page request whose created range contains `ts`
    pub fn fail_pages_covering(&self, ts: Timestamp) {
        self.state().fail_created.push(ts);
    }

    /// Make `stats` report this count instead of the real one
    pub fn override_count(&self, count: Option<u64>) {
        self.state().stats_override = count;
    }

    fn matches(&self, query: &SourceQuery, record: &Record) -> bool {
        query.created.contains(record.created())
            && query.updated.contains(record.updated())
            && query
                .filter
                .as_deref()
                .map(|f| filter_matches(f, record))
                .unwrap_or(true)
    }
}

fn filter_matches(filter: &str, record: &Record) -> bool {
    filter
        .split('^')
        .filter(|clause| !clause.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((field, value)) => record.get(field) == Some(value),
            None => false,
        })
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn stats(&self, query: &SourceQuery) -> Result<SourceStats> {
        let state = self.state();
        let mut stats = SourceStats::default();

        if let Some(rows) = state.tables.get(&query.table) {
            for record in rows.values().filter(|r| self.matches(query, r)) {
                stats.count += 1;
                let created = record.created();
                stats.min_created = Some(stats.min_created.map_or(created, |m| m.min(created)));
                stats.max_created = Some(stats.max_created.map_or(created, |m| m.max(created)));
            }
        }
        if let Some(count) = state.stats_override {
            stats.count = count;
        }

        Ok(stats)
    }

    async fn page(&self, request: &PageRequest) -> Result<Page> {
        let mut state = self.state();
        state.requests.push(request.clone());

        if state
            .fail_created
            .iter()
            .any(|ts| request.query.created.contains(*ts))
        {
            return Err(SyncError::Remote(format!(
                "injected failure for {} {}",
                request.query.table, request.query.created
            )));
        }

        let page: Page = match state.tables.get(&request.query.table) {
            Some(rows) => rows
                .values()
                .filter(|r| match &request.keys {
                    KeyPredicate::After(None) => true,
                    KeyPredicate::After(Some(cursor)) => r.key() > cursor,
                    KeyPredicate::In(keys) => keys.contains(r.key()),
                })
                .filter(|r| self.matches(&request.query, r))
                .take(request.limit)
                .map(|r| r.project(&request.query.fields, &self.names))
                .collect(),
            None => Vec::new(),
        };

        state.returned.push(page.len());
        Ok(page)
    }
}
