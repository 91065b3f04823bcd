//! Error types for pgdump-s3
//!
//! Every stage of a backup run reports failures as `AppError`.
//! Object store adapters report the narrower `StoreError`, which the
//! replication engine and pipeline map onto the stage-specific variants.

use thiserror::Error;

/// Application-wide error type
///
/// A failed run is logged and counted by `kind()`; nothing is retried
/// within the run. The next scheduled tick starts over.
#[derive(Debug, Error)]
pub enum AppError {
    /// Required configuration values are absent
    #[error("Missing required configuration: {}", fields.join(", "))]
    ConfigurationMissing { fields: Vec<String> },

    /// Configuration present but invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The dump tool failed or produced no artifact
    #[error("Dump producer failed: {0}")]
    DumpProducerFailed(String),

    /// The timestamped upload failed
    #[error("Upload of {key} failed: {message}")]
    UploadFailed { key: String, message: String },

    /// Replication source does not exist
    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    /// The store refused to open a copy session
    #[error("Failed to initiate copy session for {key}: {message}")]
    SessionInitiationFailed { key: String, message: String },

    /// A single range copy failed
    #[error("Copy of part {part_number} failed: {message}")]
    PartCopyFailed { part_number: u32, message: String },

    /// Final assembly of the copy session was rejected
    #[error("Failed to complete copy session for {key}: {message}")]
    CompletionFailed { key: String, message: String },

    /// The run was cancelled before it could finish
    #[error("Operation cancelled")]
    Cancelled,

    /// Cron expression or scheduler failure
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Other object store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigurationMissing { .. } => "configuration_missing",
            AppError::Config(_) => "config",
            AppError::InvalidConnectionString(_) => "invalid_connection_string",
            AppError::DumpProducerFailed(_) => "dump_producer_failed",
            AppError::UploadFailed { .. } => "upload_failed",
            AppError::ObjectNotFound { .. } => "object_not_found",
            AppError::SessionInitiationFailed { .. } => "session_initiation_failed",
            AppError::PartCopyFailed { .. } => "part_copy_failed",
            AppError::CompletionFailed { .. } => "completion_failed",
            AppError::Cancelled => "cancelled",
            AppError::Schedule(_) => "schedule",
            AppError::Storage(_) => "storage",
            AppError::Io(_) => "io",
            AppError::Internal(_) => "internal",
        }
    }

    /// Record this error in the error counter
    pub fn record(&self) {
        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Failure reported by an `ObjectStore` implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist
    #[error("no such key: {key}")]
    NotFound { key: String },

    /// The store rejected the request or could not be reached
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Request {
            operation,
            message: message.into(),
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
