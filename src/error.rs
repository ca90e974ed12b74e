//! Error types for the sync core.
//!
//! Library code returns [`SyncError`]; the CLI wraps it in `anyhow`.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for sync and graph operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// A single record that failed to write during a batch push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub id: String,
    pub message: String,
}

impl RecordError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A source could not be reached (I/O, timeout, auth) after retries.
    #[error("connector '{connector}' unavailable: {reason}")]
    ConnectorUnavailable { connector: String, reason: String },

    /// A batch push partially failed. The remaining records were written.
    #[error(
        "partial write to '{connector}' table '{table}': {} of {attempted} records failed",
        failures.len()
    )]
    ConnectorPartialWrite {
        connector: String,
        table: String,
        attempted: usize,
        failures: Vec<RecordError>,
    },

    #[error("entity store unavailable: {0}")]
    StoreUnavailable(String),

    /// Reserved for a three-way merge mode. The two-way algorithm never raises it.
    #[error("ambiguous conflict on record '{0}'")]
    ConflictAmbiguous(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn unavailable(connector: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::ConnectorUnavailable {
            connector: connector.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::StoreUnavailable(format!("serialization: {}", err))
    }
}
