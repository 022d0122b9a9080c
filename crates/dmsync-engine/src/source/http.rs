//! HTTP adapter for a Table-API style remote source
//!
//! - `GET {base}/api/now/stats/{table}` answers the stats pre-check
//! - `GET {base}/api/now/table/{table}` answers page requests
//!
//! Both take the encoded query in `sysparm_query`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use dmsync_common::types::{parse_timestamp, FieldNames, Page, Record};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::query::EncodedQuery;
use super::{KeyPredicate, PageRequest, RemoteSource, SourceQuery, SourceStats};
use crate::config::SourceConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Deserialize)]
struct StatsEnvelope {
    result: StatsResult,
}

#[derive(Debug, Deserialize)]
struct StatsResult {
    stats: StatsBody,
}

#[derive(Debug, Deserialize)]
struct StatsBody {
    count: String,
    #[serde(default)]
    min: HashMap<String, String>,
    #[serde(default)]
    max: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    result: Vec<BTreeMap<String, serde_json::Value>>,
}

pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    names: FieldNames,
}

impl HttpSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            names: config.field_names.clone(),
        })
    }

    fn encode(&self, query: &SourceQuery, keys: Option<&KeyPredicate>) -> Result<String> {
        let mut encoded = EncodedQuery::new()
            .filter(query.filter.as_deref())?
            .range(&self.names.created, &query.created)
            .range(&self.names.updated, &query.updated);

        match keys {
            Some(KeyPredicate::After(Some(cursor))) => {
                encoded = encoded.greater_than(&self.names.key, cursor);
            },
            Some(KeyPredicate::In(keys)) => {
                encoded = encoded.in_keys(&self.names.key, keys);
            },
            Some(KeyPredicate::After(None)) | None => {},
        }
        if keys.is_some() {
            encoded = encoded.order_by(&self.names.key);
        }

        Ok(encoded.build())
    }

    fn projection(&self, fields: &[String]) -> Option<String> {
        if fields.is_empty() {
            return None;
        }
        let mut all: Vec<&str> = fields.iter().map(String::as_str).collect();
        for required in [&self.names.key, &self.names.created, &self.names.updated] {
            if !all.contains(&required.as_str()) {
                all.push(required);
            }
        }
        Some(all.join(","))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut request = self
            .client
            .get(url)
            .query(params)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Remote(format!("GET {} returned {}", url, status)));
        }

        Ok(response.json::<T>().await?)
    }

    fn to_record(&self, row: BTreeMap<String, serde_json::Value>) -> Result<Record> {
        let fields = row
            .into_iter()
            .map(|(name, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    // Reference fields arrive as {"value": ..} objects unless links are excluded
                    serde_json::Value::Object(map) => map
                        .get("value")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    other => other.to_string(),
                };
                (name, text)
            })
            .collect();
        Ok(Record::from_fields(fields, &self.names)?)
    }
}

fn optional_timestamp(map: &HashMap<String, String>, field: &str) -> Result<Option<dmsync_common::types::Timestamp>> {
    match map.get(field).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => Ok(Some(parse_timestamp(raw)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    #[instrument(skip(self, query), fields(table = %query.table))]
    async fn stats(&self, query: &SourceQuery) -> Result<SourceStats> {
        let url = format!("{}/api/now/stats/{}", self.base_url, query.table);
        let params = [
            ("sysparm_query", self.encode(query, None)?),
            ("sysparm_count", "true".to_string()),
            ("sysparm_min_fields", self.names.created.clone()),
            ("sysparm_max_fields", self.names.created.clone()),
        ];

        let envelope: StatsEnvelope = self.get(&url, &params).await?;
        let body = envelope.result.stats;
        let count = body
            .count
            .trim()
            .parse::<u64>()
            .map_err(|_| SyncError::Remote(format!("invalid stats count '{}'", body.count)))?;

        Ok(SourceStats {
            count,
            min_created: optional_timestamp(&body.min, &self.names.created)?,
            max_created: optional_timestamp(&body.max, &self.names.created)?,
        })
    }

    #[instrument(skip(self, request), fields(table = %request.query.table, limit = request.limit))]
    async fn page(&self, request: &PageRequest) -> Result<Page> {
        let url = format!("{}/api/now/table/{}", self.base_url, request.query.table);
        let mut params = vec![
            ("sysparm_query", self.encode(&request.query, Some(&request.keys))?),
            ("sysparm_limit", request.limit.to_string()),
            ("sysparm_display_value", "false".to_string()),
            ("sysparm_exclude_reference_link", "true".to_string()),
        ];
        if let Some(fields) = self.projection(&request.query.fields) {
            params.push(("sysparm_fields", fields));
        }

        let envelope: PageEnvelope = self.get(&url, &params).await?;
        debug!(rows = envelope.result.len(), "Page received");

        envelope
            .result
            .into_iter()
            .map(|row| self.to_record(row))
            .collect()
    }
}
