//! dmsync Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Extraction and reconciliation engine that copies rows from a remote
//! paginated record API into a relational target and keeps them in sync.
//!
//! # Overview
//!
//! - **Source**: cursor-paginated and key-set readers over a [`RemoteSource`]
//! - **Partitioning**: calendar buckets processed sequentially or concurrently
//! - **Reconciliation**: key + timestamp diff into insert/update/skip/delete
//! - **Writers**: per-page, conflict-tolerant insert/update/upsert/delete
//! - **Metrics**: counters that roll up from every task to one root per job
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dmsync_common::types::FieldNames;
//! use dmsync_engine::config::EngineConfig;
//! use dmsync_engine::pipeline::{Action, Pipeline};
//! use dmsync_engine::source::http::HttpSource;
//! use dmsync_engine::target::postgres::PgTarget;
//! use dmsync_engine::target::TableDef;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let source = Arc::new(HttpSource::new(&config.source)?);
//!     let target = Arc::new(PgTarget::connect(&config.target).await?);
//!     let table = TableDef::new("incident", "incident", FieldNames::default());
//!
//!     let snapshot = Pipeline::from_config(&config, Action::Sync, source, target, table)
//!         .run()
//!         .await?;
//!     println!("{}", snapshot.export_lines());
//!     Ok(())
//! }
//! ```
//!
//! [`RemoteSource`]: source::RemoteSource

pub mod config;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod target;
pub mod writer;

// Re-export commonly used types
pub use error::{JobFailure, Result, SyncError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{Action, Pipeline, ReadStrategy};
pub use writer::WriteStrategy;
