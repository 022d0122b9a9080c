//! Configuration management
//!
//! Values come from `DMSYNC_*` environment variables (a `.env` file is loaded
//! first if present) and fall back to the defaults below. [`EngineConfig::validate`]
//! runs before any I/O.

use std::path::PathBuf;
use std::time::Duration;

use dmsync_common::logging::LogConfig;
use dmsync_common::types::{FieldNames, Interval};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::partition::PartitionOptions;
use crate::source::query::validate_filter;

// ============================================================================
// Source Configuration Constants
// ============================================================================

/// Default remote instance URL for local development.
pub const DEFAULT_SOURCE_URL: &str = "http://localhost:8080";

/// Default HTTP request timeout in seconds.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 60;

/// Default number of rows per page request.
pub const DEFAULT_PAGE_SIZE: usize = crate::source::DEFAULT_PAGE_SIZE;

// ============================================================================
// Target Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/dmsync";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Job Configuration Constants
// ============================================================================

/// Default number of concurrent partitions.
pub const DEFAULT_THREADS: usize = 1;

/// Default partition interval.
pub const DEFAULT_INTERVAL: Interval = Interval::Month;

/// Default delay between progress reports in seconds.
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub job: JobConfig,
    pub log: LogConfig,
}

/// Remote API connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub page_size: usize,
    pub field_names: FieldNames,
}

/// Target database connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub schema: Option<String>,
}

/// Per-job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Concurrent partitions; 1 runs them sequentially
    pub threads: usize,
    /// Partition interval; `None` reads the whole range as one unit
    pub interval: Option<Interval>,
    /// Encoded filter AND-ed into every source query
    pub filter: Option<String>,
    pub min_rows: Option<u64>,
    pub max_rows: Option<u64>,
    pub progress_interval_secs: u64,
    pub fail_fast: bool,
    /// Where to write `name=value` metrics after the job
    pub metrics_file: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_URL.to_string(),
            username: None,
            password: None,
            timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
            page_size: DEFAULT_PAGE_SIZE,
            field_names: FieldNames::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            schema: None,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            interval: None,
            filter: None,
            min_rows: None,
            max_rows: None,
            progress_interval_secs: DEFAULT_PROGRESS_INTERVAL_SECS,
            fail_fast: false,
            metrics_file: None,
        }
    }
}

impl JobConfig {
    /// Partitioning options, when an interval is configured
    pub fn partition_options(&self) -> Option<PartitionOptions> {
        self.interval.map(|interval| PartitionOptions {
            threads: self.threads,
            interval,
            progress_interval: Duration::from_secs(self.progress_interval_secs),
            fail_fast: self.fail_fast,
        })
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = FieldNames::default();
        let threads = parsed("DMSYNC_THREADS")?.unwrap_or(DEFAULT_THREADS);
        let interval: Option<Interval> = parsed("DMSYNC_INTERVAL").map_err(|_| {
            SyncError::Config(
                "DMSYNC_INTERVAL must be one of year, quarter, month, week, day, hour, 5min, minute".to_string(),
            )
        })?;
        let config = EngineConfig {
            source: SourceConfig {
                base_url: var("DMSYNC_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                username: var("DMSYNC_SOURCE_USER"),
                password: var("DMSYNC_SOURCE_PASSWORD"),
                timeout_secs: parsed("DMSYNC_SOURCE_TIMEOUT")?.unwrap_or(DEFAULT_SOURCE_TIMEOUT_SECS),
                page_size: parsed("DMSYNC_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE),
                field_names: FieldNames {
                    key: var("DMSYNC_KEY_FIELD").unwrap_or(defaults.key),
                    created: var("DMSYNC_CREATED_FIELD").unwrap_or(defaults.created),
                    updated: var("DMSYNC_UPDATED_FIELD").unwrap_or(defaults.updated),
                },
            },
            target: TargetConfig {
                database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parsed("DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: parsed("DATABASE_CONNECT_TIMEOUT")?
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                schema: var("DMSYNC_TARGET_SCHEMA"),
            },
            job: JobConfig {
                threads,
                // Parallelism needs buckets to spread over
                interval: interval.or((threads > 1).then_some(DEFAULT_INTERVAL)),
                filter: var("DMSYNC_FILTER"),
                min_rows: parsed("DMSYNC_MIN_ROWS")?,
                max_rows: parsed("DMSYNC_MAX_ROWS")?,
                progress_interval_secs: parsed("DMSYNC_PROGRESS_INTERVAL")?
                    .unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS),
                fail_fast: parsed("DMSYNC_FAIL_FAST")?.unwrap_or(false),
                metrics_file: var("DMSYNC_METRICS_FILE").map(PathBuf::from),
            },
            log: LogConfig::from_env().map_err(|e| SyncError::Config(e.to_string()))?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.base_url.trim().is_empty() {
            return Err(SyncError::Config("Source URL cannot be empty".to_string()));
        }
        if !self.source.base_url.starts_with("http://") && !self.source.base_url.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "Source URL must be http(s): {}",
                self.source.base_url
            )));
        }
        if self.source.page_size == 0 {
            return Err(SyncError::Config("Page size must be greater than 0".to_string()));
        }
        if self.source.password.is_some() && self.source.username.is_none() {
            return Err(SyncError::Config("Source password given without a user".to_string()));
        }

        if self.target.database_url.is_empty() {
            return Err(SyncError::Config("Database URL cannot be empty".to_string()));
        }
        if self.target.max_connections == 0 {
            return Err(SyncError::Config(
                "Database max_connections must be greater than 0".to_string(),
            ));
        }
        if self.job.threads as u64 > u64::from(self.target.max_connections) {
            // Each partition holds its own connection
            tracing::warn!(
                threads = self.job.threads,
                max_connections = self.target.max_connections,
                "More partitions than pooled connections; some will wait for a connection"
            );
        }

        if let (Some(min), Some(max)) = (self.job.min_rows, self.job.max_rows) {
            if min > max {
                return Err(SyncError::Config(format!(
                    "min_rows ({min}) cannot be greater than max_rows ({max})"
                )));
            }
        }
        if self.job.progress_interval_secs == 0 {
            return Err(SyncError::Config("Progress interval must be greater than 0".to_string()));
        }
        if let Some(filter) = &self.job.filter {
            validate_filter(filter)?;
        }

        Ok(())
    }
}
