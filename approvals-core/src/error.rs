//! Error types for the approvals core.
//!
//! Uses `thiserror` for public API error types. `ApprovalError` carries the
//! engine taxonomy (not found, conflict, invalid input, unauthorized) plus
//! wrapped storage and collaborator faults.

use std::fmt;

/// Top-level error type for the approvals core library.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("{service} call failed: {message}")]
    Collaborator {
        service: &'static str,
        message: String,
    },
}

impl ApprovalError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Coarse classification used by callers that map errors onto a transport.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApprovalError::NotFound { .. } => ErrorKind::NotFound,
            ApprovalError::Conflict { .. } => ErrorKind::Conflict,
            ApprovalError::InvalidInput { .. } => ErrorKind::InvalidInput,
            ApprovalError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ApprovalError::Storage(StoreError::Conflict { .. }) => ErrorKind::Conflict,
            ApprovalError::Storage(_) | ApprovalError::Collaborator { .. } => ErrorKind::Internal,
        }
    }
}

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Unauthorized,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Constraint violated: {message}")]
    Conflict { message: String },

    #[error("Blocking task failed: {message}")]
    Task { message: String },

    #[error("Database I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    /// Constraint failures (unique, foreign key, check, trigger aborts) become `Conflict`.
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict {
                    message: msg.clone().unwrap_or_else(|| e.to_string()),
                }
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl From<rusqlite::Error> for ApprovalError {
    fn from(err: rusqlite::Error) -> Self {
        ApprovalError::Storage(err.into())
    }
}

impl From<serde_json::Error> for ApprovalError {
    fn from(err: serde_json::Error) -> Self {
        ApprovalError::Storage(err.into())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task {
            message: err.to_string(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A type alias for results using the top-level `ApprovalError`.
pub type Result<T> = std::result::Result<T, ApprovalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = ApprovalError::not_found("approval_workflow", "wf-1");
        assert_eq!(err.to_string(), "approval_workflow not found: wf-1");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = ApprovalError::invalid_input("reason", "rejection reason is required");
        assert_eq!(
            err.to_string(),
            "Invalid input for 'reason': rejection reason is required"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_store_conflict_maps_to_conflict_kind() {
        let err: ApprovalError = StoreError::Conflict {
            message: "duplicate".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_sqlite_error_is_internal() {
        let err: ApprovalError = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().starts_with("Storage error: SQLite error"));
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT UNIQUE); INSERT INTO t (name) VALUES ('a');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t (name) VALUES ('a')", [])
            .unwrap_err();
        let err: ApprovalError = err.into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Unauthorized.to_string(), "unauthorized");
        assert_eq!(ErrorKind::Conflict.to_string(), "conflict");
    }
}
