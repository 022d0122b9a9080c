//! Shared fixtures for engine integration tests
//!
//! Builds in-memory sources and targets seeded with `incident` rows whose keys
//! are 32-character hex strings, so lexical and numeric order agree.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use dmsync_common::types::{parse_timestamp, FieldNames, Key, Timestamp};
use dmsync_engine::source::memory::MemorySource;
use dmsync_engine::target::memory::MemoryTarget;
use dmsync_engine::target::TableDef;
use dmsync_engine::writer::binder::{ColumnDef, ColumnType};

pub const TABLE: &str = "incident";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dmsync_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Key number `n`
pub fn key(n: u32) -> Key {
    Key::new(format!("{n:032x}"))
}

pub fn ts(value: &str) -> Timestamp {
    parse_timestamp(value).unwrap()
}

pub fn table() -> TableDef {
    TableDef::new(TABLE, TABLE, FieldNames::default())
        .with_column(ColumnDef::text("short_description", Some(160)))
        .with_column(ColumnDef::new("priority", ColumnType::Integer))
}

pub fn source() -> Arc<MemorySource> {
    Arc::new(MemorySource::new(FieldNames::default()))
}

/// Add or replace a source row
pub fn put(source: &MemorySource, n: u32, created: &str, updated: &str) -> Result<()> {
    let key = key(n);
    let description = format!("incident {n}");
    source.put(
        TABLE,
        &[
            ("sys_id", key.as_str()),
            ("sys_created_on", created),
            ("sys_updated_on", updated),
            ("short_description", &description),
            ("priority", "3"),
        ],
    )?;
    Ok(())
}

/// Source rows `first..=last`, all created and updated at `when`
pub fn put_range(source: &MemorySource, first: u32, last: u32, when: &str) -> Result<()> {
    for n in first..=last {
        put(source, n, when, when)?;
    }
    Ok(())
}

pub fn target() -> Arc<MemoryTarget> {
    Arc::new(MemoryTarget::new())
}

/// Whether target and source hold the same keys with the same timestamps
pub fn in_sync(source: &MemorySource, target: &MemoryTarget) -> bool {
    let target_keys = target.keys(TABLE);
    target_keys.len() == source.len(TABLE)
        && target_keys.iter().all(|k| {
            let row = target.row(TABLE, k);
            let upstream = source.get(TABLE, k);
            matches!((row, upstream), (Some(row), Some(rec)) if row.updated == rec.updated())
        })
}
