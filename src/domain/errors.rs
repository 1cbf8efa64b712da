//! Core error definitions for the partition migration engine.
//!
//! This module provides a centralized `MigrationError` enum and a `Result`
//! type used throughout the application, plus the `ErrorKind` classification
//! that drives the retry and abort policies of the workers.

use thiserror::Error;

/// Error types encountered during a migration run.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Credential vault error: {0}")]
    Vault(String),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Schema conflict on {table}: {reason}")]
    SchemaConflict { table: String, reason: String },

    #[error("Truncate declined for {partition}: user declined truncate")]
    ConfirmationDenied { partition: String },

    #[error("Row count mismatch for {partition}: source={src_count}, target={target}")]
    RowCountMismatch {
        partition: String,
        src_count: i64,
        target: i64,
    },

    #[error("Migration canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        MigrationError::Store(e.to_string())
    }
}

/// A specialized Result type for the migration engine.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Coarse error classification used by the run loop.
///
/// The mapping follows the run policies: `Transient` errors are retried with
/// backoff, `Validation` errors fail fast before any DDL, `SchemaConflict`
/// and `ConfirmationDenied` fail the current partition, and `Fatal` errors
/// abort the whole run while preserving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Validation,
    SchemaConflict,
    ConfirmationDenied,
    Canceled,
    Fatal,
}

impl MigrationError {
    /// Classifies this error for the retry/abort policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Config(_) | MigrationError::Validation(_) => ErrorKind::Validation,
            MigrationError::Vault(_) | MigrationError::Store(_) => ErrorKind::Fatal,
            MigrationError::Postgres(e) => classify_pg_error(e),
            // Pool checkouts and raw socket I/O fail on connection trouble;
            // both are worth another attempt.
            MigrationError::Pool(_) | MigrationError::Io(_) => ErrorKind::Transient,
            MigrationError::SchemaConflict { .. } | MigrationError::RowCountMismatch { .. } => {
                ErrorKind::SchemaConflict
            }
            MigrationError::ConfirmationDenied { .. } => ErrorKind::ConfirmationDenied,
            MigrationError::Canceled => ErrorKind::Canceled,
        }
    }

    /// True for resource-exhaustion errors (SQLSTATE class 53) that the
    /// row-batch engine answers by halving the batch size.
    pub fn is_memory_pressure(&self) -> bool {
        match self {
            MigrationError::Postgres(e) => {
                matches!(sqlstate(e), Some(code) if code.starts_with("53"))
            }
            _ => false,
        }
    }
}

/// Extracts the five-character SQLSTATE, if the server reported one.
fn sqlstate(e: &postgres::Error) -> Option<&str> {
    e.code().map(|c| c.code())
}

fn classify_pg_error(e: &postgres::Error) -> ErrorKind {
    match sqlstate(e) {
        // Connection exceptions, deadlocks, serialization failures and
        // admin-initiated shutdowns are worth another attempt.
        Some(code) if code.starts_with("08") => ErrorKind::Transient,
        Some("40001") | Some("40P01") | Some("57P01") => ErrorKind::Transient,
        // Resource exhaustion: retried at a smaller batch size.
        Some(code) if code.starts_with("53") => ErrorKind::Transient,
        // Duplicate/undefined objects and datatype mismatches mean the
        // target shape does not line up with the registry.
        Some(code) if code.starts_with("42") => ErrorKind::SchemaConflict,
        Some(_) => ErrorKind::Fatal,
        // No SQLSTATE: client-side I/O (reset, timeout) mid-conversation.
        None => ErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_kind() {
        let err = MigrationError::Validation("bad range".to_string());
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_store_errors_are_fatal() {
        let err = MigrationError::Store("disk full".to_string());
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_confirmation_denied_kind() {
        let err = MigrationError::ConfirmationDenied {
            partition: "point_history_240921".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ConfirmationDenied);
        assert!(err.to_string().contains("user declined truncate"));
    }

    #[test]
    fn test_count_mismatch_is_schema_conflict() {
        let err = MigrationError::RowCountMismatch {
            partition: "point_history_240921".to_string(),
            src_count: 86_400,
            target: 86_000,
        };
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
    }
}
