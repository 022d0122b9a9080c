//! In-memory target store
//!
//! Rows live in a shared map per table. Sessions stage their writes in a
//! private overlay that is merged on commit, so uncommitted work is invisible
//! to other sessions and lost on rollback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dmsync_common::types::{DateRange, Key, Record, Timestamp};

use super::{Operation, TableDef, TargetSession, TargetStore};
use crate::error::{Result, SyncError};
use crate::writer::binder::BoundValue;

/// One stored row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub created: Timestamp,
    pub updated: Timestamp,
    pub values: BTreeMap<String, BoundValue>,
}

impl StoredRow {
    fn from_record(table: &TableDef, record: &Record) -> Self {
        let values = table
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.bind(record)))
            .collect();
        Self {
            created: record.created(),
            updated: record.updated(),
            values,
        }
    }

    fn merge(&mut self, table: &TableDef, record: &Record) {
        for column in table.update_columns(record) {
            self.values.insert(column.name.clone(), column.bind(record));
        }
        self.created = record.created();
        self.updated = record.updated();
    }
}

type Tables = HashMap<String, BTreeMap<Key, StoredRow>>;

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<Key>>,
    sessions: AtomicU64,
    commits: AtomicU64,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failing(&self) -> MutexGuard<'_, HashSet<Key>> {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    shared: Arc<Shared>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a committed row carrying only the identity columns
    pub fn seed(&self, table: &str, key: impl Into<Key>, created: Timestamp, updated: Timestamp) {
        self.shared.tables().entry(table.to_string()).or_default().insert(
            key.into(),
            StoredRow {
                created,
                updated,
                values: BTreeMap::new(),
            },
        );
    }

    pub fn row(&self, table: &str, key: &Key) -> Option<StoredRow> {
        self.shared.tables().get(table).and_then(|rows| rows.get(key).cloned())
    }

    pub fn keys(&self, table: &str) -> Vec<Key> {
        self.shared
            .tables()
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.shared.tables().get(table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Make any write touching `key` fail with a non-conflict database error
    pub fn fail_on(&self, key: impl Into<Key>) {
        self.shared.failing().insert(key.into());
    }

    pub fn sessions_opened(&self) -> u64 {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn timestamps(&self, table: &TableDef, created: &DateRange) -> Result<BTreeMap<Key, Timestamp>> {
        Ok(self
            .shared
            .tables()
            .get(&table.name)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| created.contains(row.created))
                    .map(|(key, row)| (key.clone(), row.updated))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn max_updated(&self, table: &TableDef) -> Result<Option<Timestamp>> {
        Ok(self
            .shared
            .tables()
            .get(&table.name)
            .and_then(|rows| rows.values().map(|r| r.updated).max()))
    }

    async fn session(&self) -> Result<Box<dyn TargetSession>> {
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            staged: HashMap::new(),
        }))
    }
}

/// Staged change per `(table, key)`; `None` is a pending delete
type Overlay = HashMap<(String, Key), Option<StoredRow>>;

struct MemorySession {
    shared: Arc<Shared>,
    staged: Overlay,
}

impl MemorySession {
    fn current(&self, table: &str, key: &Key) -> Option<StoredRow> {
        match self.staged.get(&(table.to_string(), key.clone())) {
            Some(staged) => staged.clone(),
            None => self
                .shared
                .tables()
                .get(table)
                .and_then(|rows| rows.get(key).cloned()),
        }
    }

    fn check_failure(&self, op: Operation, key: &Key) -> Result<()> {
        if self.shared.failing().contains(key) {
            return Err(SyncError::Database(sqlx::Error::Protocol(format!(
                "injected {op} failure for {key}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetSession for MemorySession {
    async fn apply(&mut self, op: Operation, table: &TableDef, record: &Record) -> Result<u64> {
        let key = record.key();
        self.check_failure(op, key)?;
        let slot = (table.name.clone(), key.clone());

        match (op, self.current(&table.name, key)) {
            (Operation::Insert, Some(_)) => Err(SyncError::ConstraintViolation(format!(
                "duplicate key {} in {}",
                key, table.name
            ))),
            (Operation::Insert, None) => {
                self.staged.insert(slot, Some(StoredRow::from_record(table, record)));
                Ok(1)
            },
            (Operation::Update, Some(mut row)) => {
                row.merge(table, record);
                self.staged.insert(slot, Some(row));
                Ok(1)
            },
            (Operation::Delete, Some(_)) => {
                self.staged.insert(slot, None);
                Ok(1)
            },
            (Operation::Update | Operation::Delete, None) => Ok(0),
        }
    }

    async fn delete(&mut self, table: &TableDef, key: &Key) -> Result<u64> {
        self.check_failure(Operation::Delete, key)?;
        if self.current(&table.name, key).is_none() {
            return Ok(0);
        }
        self.staged.insert((table.name.clone(), key.clone()), None);
        Ok(1)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut tables = self.shared.tables();
        for ((table, key), change) in self.staged.drain() {
            let rows = tables.entry(table).or_default();
            match change {
                Some(row) => {
                    rows.insert(key, row);
                },
                None => {
                    rows.remove(&key);
                },
            }
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }
}
