use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// Only `TransientFetch` is retried by the job queue; everything else is
/// terminal for the unit of work that produced it and must never abort
/// the surrounding batch.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transient fetch error: {message}")]
    TransientFetch { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("enrichment failed for {field}: {message}")]
    PartialEnrichment { field: String, message: String },

    #[error("fatal: {message}")]
    Fatal { message: String },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn validation(message: impl Into<String>) -> Self {
        IngestError::Validation {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        IngestError::Fatal {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        IngestError::TransientFetch {
            message: message.into(),
        }
    }

    /// Whether the queue should retry the job that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientFetch { .. })
    }

    /// Whether stripping the optional enrichment field and retrying once
    /// is the documented recovery path.
    pub fn is_enrichment(&self) -> bool {
        matches!(self, IngestError::PartialEnrichment { .. })
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                IngestError::Conflict {
                    message: err.to_string(),
                }
            }
            _ => IngestError::Database {
                message: err.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
