//! Error types for the shared data model

use thiserror::Error;

/// Result type alias for data model operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while building or manipulating data model values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Invalid timestamp '{0}': expected YYYY-MM-DD HH:MM:SS")]
    InvalidTimestamp(String),

    #[error("Invalid date range: start {start} is not before end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Record is missing required field '{0}'")]
    MissingField(String),

    #[error("Timestamp out of range: {0}")]
    OutOfRange(String),
}
