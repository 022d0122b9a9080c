//! Encoded query rendering
//!
//! The remote API filters with `^`-separated clauses (`field=value^field2>x`)
//! and sorts with a trailing `ORDERBYfield`.

use dmsync_common::types::{DateRange, Key, Timestamp};

use crate::error::{Result, SyncError};

/// Builder for an encoded query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedQuery {
    clauses: Vec<String>,
    order_by: Option<String>,
}

impl EncodedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a caller filter verbatim after validating it
    pub fn filter(mut self, filter: Option<&str>) -> Result<Self> {
        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            validate_filter(filter)?;
            self.clauses.push(filter.to_string());
        }
        Ok(self)
    }

    /// Restrict `field` to the half-open range
    pub fn range(mut self, field: &str, range: &DateRange) -> Self {
        if let Some(start) = range.start() {
            self.clauses.push(format!("{}>={}", field, date_generate(start)));
        }
        if let Some(end) = range.end() {
            self.clauses.push(format!("{}<{}", field, date_generate(end)));
        }
        self
    }

    pub fn greater_than(mut self, field: &str, key: &Key) -> Self {
        self.clauses.push(format!("{}>{}", field, key));
        self
    }

    pub fn in_keys(mut self, field: &str, keys: &[Key]) -> Self {
        let joined = keys.iter().map(Key::as_str).collect::<Vec<_>>().join(",");
        self.clauses.push(format!("{}IN{}", field, joined));
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut parts = self.clauses.clone();
        if let Some(field) = &self.order_by {
            parts.push(format!("ORDERBY{}", field));
        }
        parts.join("^")
    }
}

fn date_generate(ts: Timestamp) -> String {
    format!(
        "javascript:gs.dateGenerate('{}','{}')",
        ts.format("%Y-%m-%d"),
        ts.format("%H:%M:%S")
    )
}

/// A caller filter may narrow rows but must not reorder them or OR in other
/// rows, otherwise the key cursor and the range clauses lose their meaning
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.contains("ORDERBY") {
        return Err(SyncError::Config(format!(
            "filter must not contain an ordering clause: {filter}"
        )));
    }
    if filter.contains("^NQ") || filter.starts_with("NQ") || filter.contains("^OR") {
        return Err(SyncError::Config(format!(
            "filter must not contain OR clauses: {filter}"
        )));
    }
    if filter.starts_with('^') || filter.ends_with('^') {
        return Err(SyncError::Config(format!("filter has a dangling separator: {filter}")));
    }
    Ok(())
}
