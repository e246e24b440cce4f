//! Error types for Closet.
//!
//! Variants are grouped by how the task queue treats them: transient
//! infrastructure failures are retried with backoff, everything else fails
//! the stage immediately.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    /// SQLite gave up waiting for a lock held by another process.
    #[error("Database busy: {0}")]
    DatabaseBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No items found in image {0}")]
    NoItemsDetected(String),

    #[error("Match score {score:.3} below threshold {threshold:.3} for '{target}'")]
    LowConfidence {
        target: String,
        score: f32,
        threshold: f32,
    },

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed task should be redelivered after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Service(_)
                | Self::MalformedResponse(_)
                | Self::Storage(_)
                | Self::DatabaseBusy(_)
                | Self::Io(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::DatabaseBusy(e.to_string())
            }
            _ => Self::Database(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
