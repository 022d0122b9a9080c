//! Target store ("data mart") contract
//!
//! A [`TargetStore`] answers read-only questions about a table and hands out
//! [`TargetSession`]s. A session owns one connection for its whole life and
//! is never shared between tasks; writes applied through it become visible
//! only once [`TargetSession::commit`] returns.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use dmsync_common::types::{DateRange, FieldNames, Key, Record, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::writer::binder::{ColumnDef, ColumnType};

/// Statement kind applied to a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Target table layout
///
/// The key and both timestamp columns are always present; other columns are
/// added with [`TableDef::with_column`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Target table name
    pub name: String,
    /// Remote table the rows come from
    pub source_table: String,
    pub field_names: FieldNames,
    columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, source_table: impl Into<String>, field_names: FieldNames) -> Self {
        let columns = vec![
            ColumnDef::text(field_names.key.clone(), Some(32)),
            ColumnDef::new(field_names.created.clone(), ColumnType::DateTime),
            ColumnDef::new(field_names.updated.clone(), ColumnType::DateTime),
        ];
        Self {
            name: name.into(),
            source_table: source_table.into(),
            field_names,
            columns,
        }
    }

    /// Add a column, replacing any existing column of the same name
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        self
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn key_column(&self) -> &str {
        &self.field_names.key
    }

    /// Columns an update sets for `record`: every non-key column whose field
    /// the record carries
    pub fn update_columns<'a>(&'a self, record: &'a Record) -> impl Iterator<Item = &'a ColumnDef> + 'a {
        self.columns
            .iter()
            .filter(move |c| c.name != self.field_names.key && record.get(&c.name).is_some())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.source_table.trim().is_empty() {
            return Err(SyncError::Config("table names cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Read-side view of the target plus a session factory
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// `{key -> last-modified}` for every target row created within `created`
    async fn timestamps(&self, table: &TableDef, created: &DateRange) -> Result<BTreeMap<Key, Timestamp>>;

    /// Newest last-modified timestamp in the table, if it has rows
    async fn max_updated(&self, table: &TableDef) -> Result<Option<Timestamp>>;

    /// Open a session on a dedicated connection
    async fn session(&self) -> Result<Box<dyn TargetSession>>;
}

/// Unit of write work owned by one task
#[async_trait]
pub trait TargetSession: Send {
    /// Apply `op` for `record`, returning the affected row count.
    ///
    /// A uniqueness violation comes back as
    /// [`SyncError::ConstraintViolation`] and leaves the session usable.
    async fn apply(&mut self, op: Operation, table: &TableDef, record: &Record) -> Result<u64>;

    /// Delete by key alone
    async fn delete(&mut self, table: &TableDef, key: &Key) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
