//! Conflict-tolerant page writers
//!
//! A [`Writer`] applies one page at a time through a [`TargetSession`] and
//! commits once per page. Conflicts are absorbed per row:
//!
//! | strategy | row outcome                                                  |
//! |----------|--------------------------------------------------------------|
//! | Insert   | unique violation counts as skipped                           |
//! | Update   | zero affected rows counts as skipped                         |
//! | Upsert   | update, falling back to insert when zero rows were affected   |
//! | Delete   | zero affected rows counts as skipped                         |
//!
//! Any other error rolls the page back and aborts. Metrics are credited only
//! after the page commits.

pub mod binder;

use std::sync::Arc;

use dmsync_common::types::{Key, Record};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::source::RecordReader;
use crate::target::{Operation, TableDef, TargetSession};

/// How rows are applied to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteStrategy::Insert => "insert",
            WriteStrategy::Update => "update",
            WriteStrategy::Upsert => "upsert",
            WriteStrategy::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Per-page write tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
}

impl WriteOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted + self.skipped
    }

    fn add(&mut self, other: WriteOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }

    fn credit(&self, metrics: &Metrics) {
        metrics.add_inserted(self.inserted);
        metrics.add_updated(self.updated);
        metrics.add_deleted(self.deleted);
        metrics.add_skipped(self.skipped);
    }
}

pub struct Writer {
    strategy: WriteStrategy,
    table: Arc<TableDef>,
    metrics: Arc<Metrics>,
}

impl Writer {
    pub fn new(strategy: WriteStrategy, table: Arc<TableDef>, metrics: Arc<Metrics>) -> Self {
        Self {
            strategy,
            table,
            metrics,
        }
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Apply one page and commit it
    #[instrument(skip_all, fields(table = %self.table.name, strategy = %self.strategy, rows = page.len()))]
    pub async fn write_page(&self, session: &mut dyn TargetSession, page: &[Record]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        for record in page {
            match self.write_record(session, record).await {
                Ok(row) => outcome.add(row),
                Err(err) => return Err(self.abort(session, err).await),
            }
        }
        self.finish_page(session, outcome).await
    }

    /// Delete by key in pages of `page_size`, committing each page
    #[instrument(skip_all, fields(table = %self.table.name, keys = keys.len()))]
    pub async fn delete_keys(
        &self,
        session: &mut dyn TargetSession,
        keys: &[Key],
        page_size: usize,
    ) -> Result<WriteOutcome> {
        let mut total = WriteOutcome::default();
        for chunk in keys.chunks(page_size.max(1)) {
            let mut outcome = WriteOutcome::default();
            for key in chunk {
                match session.delete(&self.table, key).await {
                    Ok(0) => {
                        debug!(%key, "Row already gone");
                        outcome.skipped += 1;
                    },
                    Ok(_) => outcome.deleted += 1,
                    Err(err) => return Err(self.abort(session, err).await),
                }
            }
            total.add(self.finish_page(session, outcome).await?);
        }
        Ok(total)
    }

    /// Write every page a reader yields
    pub async fn drain(&self, reader: &mut dyn RecordReader, session: &mut dyn TargetSession) -> Result<WriteOutcome> {
        let mut total = WriteOutcome::default();
        while let Some(page) = reader.next_page().await? {
            total.add(self.write_page(session, &page).await?);
        }
        Ok(total)
    }

    async fn write_record(&self, session: &mut dyn TargetSession, record: &Record) -> Result<WriteOutcome> {
        let mut row = WriteOutcome::default();
        match self.strategy {
            WriteStrategy::Insert => self.insert(session, record, &mut row).await?,
            WriteStrategy::Update => match session.apply(Operation::Update, &self.table, record).await? {
                0 => {
                    warn!(table = %self.table.name, key = %record.key(), "Update matched no row; skipping");
                    row.skipped += 1;
                },
                _ => row.updated += 1,
            },
            WriteStrategy::Upsert => match session.apply(Operation::Update, &self.table, record).await? {
                0 => self.insert(session, record, &mut row).await?,
                _ => row.updated += 1,
            },
            WriteStrategy::Delete => match session.apply(Operation::Delete, &self.table, record).await? {
                0 => {
                    debug!(table = %self.table.name, key = %record.key(), "Row already gone");
                    row.skipped += 1;
                },
                _ => row.deleted += 1,
            },
        }
        Ok(row)
    }

    async fn insert(&self, session: &mut dyn TargetSession, record: &Record, row: &mut WriteOutcome) -> Result<()> {
        match session.apply(Operation::Insert, &self.table, record).await {
            Ok(_) => row.inserted += 1,
            Err(err) if err.is_constraint_violation() => {
                debug!(table = %self.table.name, key = %record.key(), error = %err, "Insert conflict; skipping");
                row.skipped += 1;
            },
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn finish_page(&self, session: &mut dyn TargetSession, outcome: WriteOutcome) -> Result<WriteOutcome> {
        if let Err(err) = session.commit().await {
            return Err(self.abort(session, err).await);
        }
        outcome.credit(&self.metrics);
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            skipped = outcome.skipped,
            "Page committed"
        );
        Ok(outcome)
    }

    async fn abort(&self, session: &mut dyn TargetSession, err: SyncError) -> SyncError {
        error!(table = %self.table.name, error = %err, "Write failed; rolling back page");
        if let Err(rollback) = session.rollback().await {
            warn!(error = %rollback, "Rollback failed");
        }
        err
    }
}
