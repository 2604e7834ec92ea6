//! Error types for EmberDB
//!
//! Every failure surfaced by the engine is an [`Error`]. Each variant maps to a
//! stable [`ErrorKind`] tag and an [`ErrorCategory`], which the transaction
//! layer uses to decide whether a statement, the transaction, or the whole
//! engine is affected.

use std::fmt;

use thiserror::Error;

/// The main error type for EmberDB
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========== Schema Errors ==========
    #[error("Schema error: table '{0}' not found")]
    NoSuchTable(String),

    #[error("Schema error: column '{column}' not found in table '{table}'")]
    NoSuchColumn { table: String, column: String },

    #[error("Schema error: unresolved column '{column}' in statement on '{table}'")]
    UnresolvedColumn { table: String, column: String },

    #[error("Schema error: table '{0}' already exists")]
    TableExists(String),

    #[error("Schema error: column '{column}' already exists in table '{table}'")]
    ColumnExists { table: String, column: String },

    #[error("Schema error: index '{0}' already exists")]
    DuplicateIndex(String),

    #[error("Schema error: index '{0}' not found")]
    NoSuchIndex(String),

    #[error("Type error: {0}")]
    TypeMismatch(String),

    // ========== Constraint Errors ==========
    #[error("Constraint error: duplicate key {key} in '{table}'")]
    DuplicateKey { table: String, key: String },

    #[error("Constraint error: null value in column '{column}' of table '{table}'")]
    NotNullViolation { table: String, column: String },

    #[error("Constraint error: duplicate value {value} for unique column '{column}' of table '{table}'")]
    UniqueViolation {
        table: String,
        column: String,
        value: String,
    },

    // ========== Concurrency Errors ==========
    #[error("Transaction error: lock timeout on {0}")]
    LockTimeout(String),

    #[error("Transaction error: transaction {0} chosen as deadlock victim")]
    Deadlock(u64),

    #[error("Transaction error: could not serialize access to {0} due to a concurrent update")]
    SerializationFailure(String),

    #[error("Transaction error: operation cancelled")]
    Cancelled,

    // ========== Storage Errors ==========
    #[error("Storage error: no space left ({0})")]
    NoSpace(String),

    #[error("Storage error: corrupted page {page_id} in table {table_id}")]
    CorruptPage { table_id: u32, page_id: u32 },

    #[error("I/O error: {0}")]
    IoError(String),

    // ========== Runtime Errors ==========
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Stable, machine-readable error tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoSuchTable,
    NoSuchColumn,
    UnresolvedColumn,
    TableExists,
    ColumnExists,
    DuplicateIndex,
    NoSuchIndex,
    TypeMismatch,
    DuplicateKey,
    NotNullViolation,
    UniqueViolation,
    LockTimeout,
    Deadlock,
    SerializationFailure,
    Cancelled,
    NoSpace,
    CorruptPage,
    IoError,
    Parse,
    Unsupported,
    InvalidArgument,
    InternalInvariant,
}

/// Error families that drive propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Schema,
    Constraint,
    Concurrency,
    Storage,
    Runtime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoSuchTable => "NoSuchTable",
            ErrorKind::NoSuchColumn => "NoSuchColumn",
            ErrorKind::UnresolvedColumn => "UnresolvedColumn",
            ErrorKind::TableExists => "TableExists",
            ErrorKind::ColumnExists => "ColumnExists",
            ErrorKind::DuplicateIndex => "DuplicateIndex",
            ErrorKind::NoSuchIndex => "NoSuchIndex",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::DuplicateKey => "DuplicateKey",
            ErrorKind::NotNullViolation => "NotNullViolation",
            ErrorKind::UniqueViolation => "UniqueViolation",
            ErrorKind::LockTimeout => "LockTimeout",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::SerializationFailure => "SerializationFailure",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::NoSpace => "NoSpace",
            ErrorKind::CorruptPage => "CorruptPage",
            ErrorKind::IoError => "IoError",
            ErrorKind::Parse => "Parse",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::InternalInvariant => "InternalInvariant",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::NoSuchTable
            | ErrorKind::NoSuchColumn
            | ErrorKind::UnresolvedColumn
            | ErrorKind::TableExists
            | ErrorKind::ColumnExists
            | ErrorKind::DuplicateIndex
            | ErrorKind::NoSuchIndex
            | ErrorKind::TypeMismatch => ErrorCategory::Schema,
            ErrorKind::DuplicateKey | ErrorKind::NotNullViolation | ErrorKind::UniqueViolation => {
                ErrorCategory::Constraint
            }
            ErrorKind::LockTimeout
            | ErrorKind::Deadlock
            | ErrorKind::SerializationFailure
            | ErrorKind::Cancelled => ErrorCategory::Concurrency,
            ErrorKind::NoSpace | ErrorKind::CorruptPage | ErrorKind::IoError => {
                ErrorCategory::Storage
            }
            ErrorKind::Parse
            | ErrorKind::Unsupported
            | ErrorKind::InvalidArgument
            | ErrorKind::InternalInvariant => ErrorCategory::Runtime,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSuchTable(_) => ErrorKind::NoSuchTable,
            Error::NoSuchColumn { .. } => ErrorKind::NoSuchColumn,
            Error::UnresolvedColumn { .. } => ErrorKind::UnresolvedColumn,
            Error::TableExists(_) => ErrorKind::TableExists,
            Error::ColumnExists { .. } => ErrorKind::ColumnExists,
            Error::DuplicateIndex(_) => ErrorKind::DuplicateIndex,
            Error::NoSuchIndex(_) => ErrorKind::NoSuchIndex,
            Error::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Error::NotNullViolation { .. } => ErrorKind::NotNullViolation,
            Error::UniqueViolation { .. } => ErrorKind::UniqueViolation,
            Error::LockTimeout(_) => ErrorKind::LockTimeout,
            Error::Deadlock(_) => ErrorKind::Deadlock,
            Error::SerializationFailure(_) => ErrorKind::SerializationFailure,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NoSpace(_) => ErrorKind::NoSpace,
            Error::CorruptPage { .. } => ErrorKind::CorruptPage,
            Error::IoError(_) => ErrorKind::IoError,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InternalInvariant(_) => ErrorKind::InternalInvariant,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Deadlocks and serialization failures abort the transaction and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Deadlock | ErrorKind::SerializationFailure
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::IoError(format!("catalog serialization: {}", err))
    }
}

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoSuchTable("users".to_string());
        assert_eq!(err.to_string(), "Schema error: table 'users' not found");

        let err = Error::UniqueViolation {
            table: "users".into(),
            column: "email".into(),
            value: "'a@x'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Constraint error: duplicate value 'a@x' for unique column 'email' of table 'users'"
        );
    }

    #[test]
    fn test_kind_tags_and_categories() {
        assert_eq!(Error::Cancelled.kind().as_str(), "Cancelled");
        assert_eq!(Error::Deadlock(7).category(), ErrorCategory::Concurrency);
        assert_eq!(
            Error::CorruptPage {
                table_id: 1,
                page_id: 3
            }
            .category(),
            ErrorCategory::Storage
        );
        assert_eq!(
            Error::Unsupported("JOIN".into()).category(),
            ErrorCategory::Runtime
        );
        assert!(Error::SerializationFailure("users".into()).is_retryable());
        assert!(!Error::LockTimeout("users".into()).is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }
}
