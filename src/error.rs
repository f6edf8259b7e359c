//! Error types for the scrape core.
//!
//! Every fatal condition during a running job ends up as a [`ScrapeError`]; its
//! `Display` text is what gets recorded verbatim in `scrape_jobs.error_message`.

use std::time::Duration;

use thiserror::Error;

/// Failures raised by the message store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored value could not be decoded: {0}")]
    Decode(String),

    #[error("background database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures raised while mapping a raw record into a [`crate::models::Message`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message {id} has an invalid timestamp '{value}'")]
    InvalidTimestamp { id: String, value: String },

    #[error("message {id} has an invalid edited timestamp '{value}'")]
    InvalidEditedTimestamp { id: String, value: String },

    #[error("message {id} could not serialize {field}: {source}")]
    Serialize {
        id: String,
        field: &'static str,
        source: serde_json::Error,
    },
}

/// Problems with the scrape configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The primary error type of a scrape job.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The channel is not present in the scrape configuration.
    #[error("Channel {0} not found in config")]
    Configuration(String),

    /// The extraction source could not be opened or authenticated.
    #[error("failed to open extraction source: {0}")]
    SourceAcquisition(String),

    /// A batch pull or advance step failed.
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: crate::models::JobStatus,
        to: crate::models::JobStatus,
    },

    #[error("Can only resume interrupted jobs (job {id} is {status})")]
    NotResumable {
        id: i64,
        status: crate::models::JobStatus,
    },

    #[error("scrape cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for ScrapeError {
    fn from(e: rusqlite::Error) -> Self {
        ScrapeError::Storage(StorageError::Sqlite(e))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
