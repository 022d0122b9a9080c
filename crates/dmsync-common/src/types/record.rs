use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{parse_timestamp, Timestamp};
use crate::error::{CommonError, Result};

/// Opaque primary-key identifier of a source row.
///
/// Keys are totally ordered by plain lexical comparison, which is the order the
/// remote source sorts on when paging with a key cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Names of the three fields every source row carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    pub key: String,
    pub created: String,
    pub updated: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            key: "sys_id".to_string(),
            created: "sys_created_on".to_string(),
            updated: "sys_updated_on".to_string(),
        }
    }
}

/// One source row: raw string fields plus the parsed key and timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    key: Key,
    created: Timestamp,
    updated: Timestamp,
    fields: BTreeMap<String, String>,
}

/// Ordered batch of records returned by a single fetch
pub type Page = Vec<Record>;

impl Record {
    /// Build a record from raw fields, requiring the key and both timestamps
    pub fn from_fields(fields: BTreeMap<String, String>, names: &FieldNames) -> Result<Self> {
        let key = fields
            .get(&names.key)
            .filter(|v| !v.is_empty())
            .map(|v| Key::new(v.as_str()))
            .ok_or_else(|| CommonError::MissingField(names.key.clone()))?;
        let created = required_timestamp(&fields, &names.created)?;
        let updated = required_timestamp(&fields, &names.updated)?;

        Ok(Self {
            key,
            created,
            updated,
            fields,
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn updated(&self) -> Timestamp {
        self.updated
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Copy of this record keeping only the requested fields.
    ///
    /// The key and timestamp fields always survive the projection.
    pub fn project(&self, wanted: &[String], names: &FieldNames) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(name, _)| {
                wanted.is_empty()
                    || wanted.contains(name)
                    || **name == names.key
                    || **name == names.created
                    || **name == names.updated
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            key: self.key.clone(),
            created: self.created,
            updated: self.updated,
            fields,
        }
    }
}

fn required_timestamp(fields: &BTreeMap<String, String>, name: &str) -> Result<Timestamp> {
    let raw = fields
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CommonError::MissingField(name.to_string()))?;
    parse_timestamp(raw)
}
