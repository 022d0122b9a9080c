//! Hierarchical read/write counters
//!
//! A job owns one root [`Metrics`] node. Every partition, reader and writer
//! gets a private child of it. Each increment is applied to the node and then
//! to every ancestor, so the root reflects live totals without polling its
//! children, and children on different threads never contend on anything but
//! the shared ancestors' atomics.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{TimeDelta, Utc};
use dmsync_common::types::{format_timestamp, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Expected,
    Input,
    Inserted,
    Updated,
    Deleted,
    Skipped,
}

#[derive(Debug, Default)]
struct Times {
    started: Option<Timestamp>,
    finished: Option<Timestamp>,
}

/// One node of the metrics tree
#[derive(Debug)]
pub struct Metrics {
    name: String,
    parent: Option<Arc<Metrics>>,
    expected: AtomicU64,
    input: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    skipped: AtomicU64,
    times: Mutex<Times>,
}

impl Metrics {
    fn new(name: String, parent: Option<Arc<Metrics>>) -> Self {
        Self {
            name,
            parent,
            expected: AtomicU64::new(0),
            input: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            times: Mutex::new(Times::default()),
        }
    }

    /// Create the root node of a job
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), None))
    }

    /// Create a child whose every change rolls up into `self`.
    ///
    /// A fresh node can only point at an existing one, so the tree never
    /// contains a cycle.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), Some(Arc::clone(self))))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Metrics>> {
        self.parent.as_ref()
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Expected => &self.expected,
            Counter::Input => &self.input,
            Counter::Inserted => &self.inserted,
            Counter::Updated => &self.updated,
            Counter::Deleted => &self.deleted,
            Counter::Skipped => &self.skipped,
        }
    }

    fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let mut node = Some(self);
        while let Some(current) = node {
            current.cell(counter).fetch_add(n, Ordering::Relaxed);
            node = current.parent.as_deref();
        }
    }

    pub fn add_expected(&self, n: u64) {
        self.add(Counter::Expected, n);
    }

    pub fn add_input(&self, n: u64) {
        self.add(Counter::Input, n);
    }

    pub fn add_inserted(&self, n: u64) {
        self.add(Counter::Inserted, n);
    }

    pub fn add_updated(&self, n: u64) {
        self.add(Counter::Updated, n);
    }

    pub fn add_deleted(&self, n: u64) {
        self.add(Counter::Deleted, n);
    }

    pub fn add_skipped(&self, n: u64) {
        self.add(Counter::Skipped, n);
    }

    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }

    pub fn input(&self) -> u64 {
        self.input.load(Ordering::Relaxed)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Sum of the write-side counters
    pub fn processed(&self) -> u64 {
        self.inserted() + self.updated() + self.deleted() + self.skipped()
    }

    pub fn start(&self) {
        self.start_at(Utc::now());
    }

    /// Record a start time; every level keeps the earliest one it has seen
    pub fn start_at(&self, ts: Timestamp) {
        let mut node = Some(self);
        while let Some(current) = node {
            let mut times = current.times.lock().unwrap_or_else(PoisonError::into_inner);
            times.started = Some(times.started.map_or(ts, |s| s.min(ts)));
            drop(times);
            node = current.parent.as_deref();
        }
    }

    pub fn finish(&self) {
        self.finish_at(Utc::now());
    }

    /// Record a finish time; every level keeps the latest one it has seen
    pub fn finish_at(&self, ts: Timestamp) {
        let mut node = Some(self);
        while let Some(current) = node {
            let mut times = current.times.lock().unwrap_or_else(PoisonError::into_inner);
            times.finished = Some(times.finished.map_or(ts, |f| f.max(ts)));
            drop(times);
            node = current.parent.as_deref();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let times = self.times.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            name: self.name.clone(),
            expected: self.expected(),
            input: self.input(),
            inserted: self.inserted(),
            updated: self.updated(),
            deleted: self.deleted(),
            skipped: self.skipped(),
            started: times.started,
            finished: times.finished,
        }
    }
}

/// Frozen copy of a metrics node, used for reporting and export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub expected: u64,
    pub input: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub started: Option<Timestamp>,
    pub finished: Option<Timestamp>,
}

impl MetricsSnapshot {
    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.deleted + self.skipped
    }

    pub fn elapsed(&self) -> Option<TimeDelta> {
        match (self.started, self.finished) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }

    /// Render as `name=value` lines
    pub fn export_lines(&self) -> String {
        let ts = |t: Option<Timestamp>| t.map(format_timestamp).unwrap_or_default();
        let elapsed = self
            .elapsed()
            .map(|d| format!("{:.3}", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default();

        format!(
            "start={}\nfinish={}\nelapsed={}\ninserted={}\nupdated={}\ndeleted={}\nskipped={}\nprocessed={}\n",
            ts(self.started),
            ts(self.finished),
            elapsed,
            self.inserted,
            self.updated,
            self.deleted,
            self.skipped,
            self.processed(),
        )
    }

    /// Overwrite `path` with the exported lines
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.export_lines().as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: input={}/{} inserted={} updated={} deleted={} skipped={}",
            self.name,
            self.input,
            self.expected,
            self.inserted,
            self.updated,
            self.deleted,
            self.skipped
        )
    }
}
