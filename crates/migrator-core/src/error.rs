//! Error types for the upload migrator.
//!
//! Step executors never let these escape the step machine: anything raised while
//! an upload is in flight is classified into a [`FailureReason`](crate::failure::FailureReason)
//! and recorded on the outcome instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    // Remote service errors
    #[error("HTTP {status} from {service}: {message}")]
    Http {
        service: String,
        status: u16,
        message: String,
    },

    #[error("Indexing service returned {status}: {message}")]
    IndexingService { status: u16, message: String },

    #[error("Request to {service} timed out after {elapsed:?}")]
    Timeout { service: String, elapsed: Duration },

    #[error("Throughput exceeded on {service}")]
    Throughput { service: String },

    #[error("{operation} failed: {message}")]
    Collaborator { operation: String, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Planning aborted: {message}")]
    Planning { message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Migration run cancelled")]
    Cancelled,
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            MigrationError::Timeout {
                service,
                elapsed: Duration::from_secs(0),
            }
        } else if let Some(status) = err.status() {
            MigrationError::Http {
                service,
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            MigrationError::Collaborator {
                operation: format!("request to {}", service),
                message: err.to_string(),
            }
        }
    }
}

impl MigrationError {
    /// Create a collaborator error for a named remote operation.
    pub fn collaborator(operation: impl Into<String>, message: impl ToString) -> Self {
        MigrationError::Collaborator {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrationError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error belongs to the transient class that point queries retry.
    ///
    /// Timeouts, throttling, and gateway-style HTTP statuses are retried; everything
    /// else propagates on the first attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrationError::Timeout { .. } | MigrationError::Throughput { .. } => true,
            MigrationError::Http { status, .. } => matches!(status, 429 | 503 | 504),
            _ => false,
        }
    }

    /// Whether the indexing service itself is failing (5xx) rather than the request.
    pub fn is_indexing_outage(&self) -> bool {
        matches!(self, MigrationError::IndexingService { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::NotFound {
            kind: "space",
            id: "did:key:z6Mk".into(),
        };
        assert_eq!(err.to_string(), "space not found: did:key:z6Mk");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MigrationError::Timeout {
            service: "uploads".into(),
            elapsed: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(MigrationError::Throughput {
            service: "uploads".into()
        }
        .is_retryable());
        assert!(MigrationError::Http {
            service: "sizes".into(),
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!MigrationError::Http {
            service: "sizes".into(),
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!MigrationError::collaborator("publish location claim", "denied").is_retryable());
    }

    #[test]
    fn test_indexing_outage() {
        assert!(MigrationError::IndexingService {
            status: 500,
            message: "boom".into()
        }
        .is_indexing_outage());
        assert!(!MigrationError::IndexingService {
            status: 404,
            message: "missing".into()
        }
        .is_indexing_outage());
    }
}
