//! Engine error types
//!
//! Variants follow the failure taxonomy of a sync job: configuration errors are
//! raised before any I/O, conflicts are recoverable by writers, and everything
//! else aborts the page loop of the partition that hit it.

use dmsync_common::types::Key;
use dmsync_common::CommonError;
use thiserror::Error;

use crate::metrics::MetricsSnapshot;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data model error: {0}")]
    Common(#[from] CommonError),

    #[error("Remote source error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Uniqueness or primary-key violation reported by the target store
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Too many rows: limit is {limit}, encountered {seen}")]
    TooManyRows { limit: u64, seen: u64 },

    #[error("Too few rows: minimum is {minimum}, processed {processed}")]
    TooFewRows { minimum: u64, processed: u64 },

    #[error("Duplicate source key {0}")]
    DuplicateKey(Key),

    #[error("Source returned key {key} after {previous}")]
    OutOfOrder { previous: Key, key: Key },

    #[error("Reconciliation plan invariant violated: {0}")]
    PlanInvariant(String),

    #[error("Partition {bucket} failed: {source}")]
    Partition {
        bucket: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Partition task panicked: {0}")]
    TaskPanicked(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a writer may treat this error as a benign race and keep going
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, SyncError::ConstraintViolation(_))
    }

    /// Map a sqlx error, singling out unique violations
    pub fn from_database(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                SyncError::ConstraintViolation(db.message().to_string())
            },
            _ => SyncError::Database(err),
        }
    }
}

/// User-visible failure of a whole job: the error plus the partial metrics
/// accumulated before it happened
#[derive(Error, Debug)]
#[error("{error} ({metrics})")]
pub struct JobFailure {
    #[source]
    pub error: SyncError,
    pub metrics: MetricsSnapshot,
}
