//! Common types used across dmsync

mod interval;
mod range;
mod record;

pub use interval::Interval;
pub use range::DateRange;
pub use record::{FieldNames, Key, Page, Record};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{CommonError, Result};

/// Point in time as reported by the remote source (always UTC)
pub type Timestamp = DateTime<Utc>;

/// Wire format of timestamps on both sides of a sync
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `YYYY-MM-DD HH:MM:SS` string as a UTC timestamp
pub fn parse_timestamp(value: &str) -> Result<Timestamp> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| CommonError::InvalidTimestamp(value.to_string()))
}

/// Render a timestamp in the wire format
pub fn format_timestamp(ts: Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
