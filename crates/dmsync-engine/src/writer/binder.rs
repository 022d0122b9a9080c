//! Per-column value binding
//!
//! Source fields arrive as strings. Each target column converts its field to a
//! typed [`BoundValue`]; a value that cannot be converted is replaced by
//! [`BoundValue::Null`] with a warning so one bad field never rejects the row.

use chrono::{NaiveDate, NaiveDateTime};
use dmsync_common::types::{parse_timestamp, Key, Record};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Target column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ColumnType {
    Text { max_len: Option<usize> },
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    /// Duration stored as whole seconds; the source renders it as a datetime
    /// offset from the epoch
    Duration,
}

impl ColumnType {
    /// Postgres type the bound parameter is cast to
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text { .. } => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::DateTime => "TIMESTAMP",
            ColumnType::Duration => "INTEGER",
        }
    }
}

/// Typed value ready to be bound to a statement parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundValue {
    Null,
    Text(String),
    Integer(i64),
    /// Kept as its canonical decimal text; the database parses it
    Decimal(String),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Seconds(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Target column name, also the source field name
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }

    pub fn text(name: impl Into<String>, max_len: Option<usize>) -> Self {
        Self::new(name, ColumnType::Text { max_len })
    }

    /// Convert the field of `record` named like this column
    pub fn bind(&self, record: &Record) -> BoundValue {
        match record.get(&self.name) {
            Some(raw) => self.coerce(raw, record.key()),
            None => BoundValue::Null,
        }
    }

    /// Convert one raw value, nulling it out with a warning on failure
    pub fn coerce(&self, raw: &str, key: &Key) -> BoundValue {
        let value = raw.trim();
        if value.is_empty() {
            return BoundValue::Null;
        }

        let result = match self.column_type {
            ColumnType::Text { max_len } => Ok(BoundValue::Text(truncate(raw, max_len, &self.name, key))),
            ColumnType::Integer => value
                .parse::<i64>()
                .map(BoundValue::Integer)
                .map_err(|e| e.to_string()),
            ColumnType::Decimal => parse_decimal(value).map(BoundValue::Decimal),
            ColumnType::Boolean => parse_bool(value).map(BoundValue::Boolean),
            ColumnType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(BoundValue::Date)
                .map_err(|e| e.to_string()),
            ColumnType::DateTime => parse_timestamp(value)
                .map(|ts| BoundValue::DateTime(ts.naive_utc()))
                .map_err(|e| e.to_string()),
            ColumnType::Duration => parse_duration(value),
        };

        match result {
            Ok(bound) => bound,
            Err(reason) => {
                warn!(
                    column = %self.name,
                    key = %key,
                    value = %raw,
                    %reason,
                    "Field could not be converted; writing null"
                );
                BoundValue::Null
            },
        }
    }
}

fn truncate(raw: &str, max_len: Option<usize>, column: &str, key: &Key) -> String {
    let Some(max_len) = max_len else {
        return raw.to_string();
    };
    if raw.chars().count() <= max_len {
        return raw.to_string();
    }

    warn!(
        column = %column,
        key = %key,
        length = raw.chars().count(),
        max_len,
        "Field exceeds column length; truncating"
    );
    raw.chars().take(max_len).collect()
}

fn parse_decimal(value: &str) -> Result<String, String> {
    let digits = value.strip_prefix(['-', '+']).unwrap_or(value);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next().unwrap_or_default();

    let valid = !(whole.is_empty() && fraction.is_empty())
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.bytes().all(|b| b.is_ascii_digit());
    if valid {
        Ok(value.to_string())
    } else {
        Err(format!("'{value}' is not a decimal number"))
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("'{value}' is not a boolean")),
    }
}

fn parse_duration(value: &str) -> Result<BoundValue, String> {
    let ts = parse_timestamp(value).map_err(|e| e.to_string())?;
    let seconds = ts.timestamp();
    if seconds < 0 {
        return Err(format!("duration underflow: {seconds} seconds"));
    }
    if seconds > i64::from(i32::MAX) {
        return Err(format!("duration overflow: {seconds} seconds"));
    }
    Ok(BoundValue::Seconds(seconds as i32))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::from("0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_integer_and_malformed_integer() {
        let col = ColumnDef::new("priority", ColumnType::Integer);
        assert_eq!(col.coerce("42", &key()), BoundValue::Integer(42));
        assert_eq!(col.coerce("forty-two", &key()), BoundValue::Null);
        assert_eq!(col.coerce("", &key()), BoundValue::Null);
    }

    #[test]
    fn test_text_truncation_respects_char_boundaries() {
        let col = ColumnDef::text("short_description", Some(3));
        assert_eq!(col.coerce("héllo", &key()), BoundValue::Text("hél".into()));
        assert_eq!(col.coerce("ok", &key()), BoundValue::Text("ok".into()));

        let unlimited = ColumnDef::text("description", None);
        assert_eq!(unlimited.coerce("héllo", &key()), BoundValue::Text("héllo".into()));
    }

    #[test]
    fn test_decimal() {
        let col = ColumnDef::new("cost", ColumnType::Decimal);
        assert_eq!(col.coerce("-12.50", &key()), BoundValue::Decimal("-12.50".into()));
        assert_eq!(col.coerce(".5", &key()), BoundValue::Decimal(".5".into()));
        assert_eq!(col.coerce("1.2.3", &key()), BoundValue::Null);
        assert_eq!(col.coerce("-", &key()), BoundValue::Null);
    }

    #[test]
    fn test_boolean() {
        let col = ColumnDef::new("active", ColumnType::Boolean);
        assert_eq!(col.coerce("true", &key()), BoundValue::Boolean(true));
        assert_eq!(col.coerce("0", &key()), BoundValue::Boolean(false));
        assert_eq!(col.coerce("maybe", &key()), BoundValue::Null);
    }

    #[test]
    fn test_dates() {
        let date = ColumnDef::new("due", ColumnType::Date);
        assert_eq!(
            date.coerce("2024-02-29", &key()),
            BoundValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(date.coerce("2023-02-29", &key()), BoundValue::Null);

        let datetime = ColumnDef::new("opened_at", ColumnType::DateTime);
        assert!(matches!(
            datetime.coerce("2024-01-15 08:30:00", &key()),
            BoundValue::DateTime(_)
        ));
        assert_eq!(datetime.coerce("15/01/2024", &key()), BoundValue::Null);
    }

    #[test]
    fn test_duration_bounds() {
        let col = ColumnDef::new("business_duration", ColumnType::Duration);
        assert_eq!(col.coerce("1970-01-01 02:00:05", &key()), BoundValue::Seconds(7205));
        // Before the epoch
        assert_eq!(col.coerce("1969-12-31 23:59:59", &key()), BoundValue::Null);
        // Past i32::MAX seconds
        assert_eq!(col.coerce("2100-01-01 00:00:00", &key()), BoundValue::Null);
    }

    #[test]
    fn test_bind_missing_field_is_null() {
        let names = dmsync_common::types::FieldNames::default();
        let fields = [
            ("sys_id", "0123456789abcdef0123456789abcdef"),
            ("sys_created_on", "2024-01-01 00:00:00"),
            ("sys_updated_on", "2024-01-02 00:00:00"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let record = Record::from_fields(fields, &names).unwrap();

        assert_eq!(ColumnDef::new("priority", ColumnType::Integer).bind(&record), BoundValue::Null);
    }
}
