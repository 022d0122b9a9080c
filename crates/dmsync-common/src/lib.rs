//! dmsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared data model, error types and logging setup for the dmsync workspace.
//!
//! # Overview
//!
//! - **Types**: keys, records, timestamps, date ranges and calendar intervals
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by every component
//!
//! # Example
//!
//! ```no_run
//! use dmsync_common::types::{DateRange, Interval, parse_timestamp};
//!
//! fn main() -> dmsync_common::Result<()> {
//!     let range = DateRange::between(
//!         parse_timestamp("2024-01-15 00:00:00")?,
//!         parse_timestamp("2024-03-10 00:00:00")?,
//!     )?;
//!     let month_start = Interval::Month.truncate(parse_timestamp("2024-02-17 08:30:00")?)?;
//!     assert!(range.contains(month_start));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
