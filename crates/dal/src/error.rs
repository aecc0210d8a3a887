//! Error handling for the data-access layer
//!
//! This module defines the closed error taxonomy callers branch on:
//! - `DalError` for everything the layer surfaces
//! - `StorageFailure` for engine-level failures, classified by `FailureKind`
//! - `ErrorCategory` to split transient failures from fatal ones
//!
//! # Design Principles
//! - All errors implement Send + Sync for async compatibility
//! - Callers branch on `ErrorKind`, never on engine-specific detail
//! - Engine errors keep their original cause as the `source`

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Base trait for all data-access errors
///
/// Ensures errors are thread-safe, `'static` and implement the standard
/// `Error` trait so they can cross task boundaries.
pub trait DataAccessError: std::error::Error + Send + Sync + 'static {}

/// Boxed underlying cause of an engine failure
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Retry classification of a storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Expected to succeed if the logical operation is re-executed
    Transient,
    /// Retrying cannot fix it
    Fatal,
}

/// What went wrong inside a storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A command exceeded its timeout
    Timeout,
    /// The connection dropped or could not be established
    ConnectionReset,
    /// Serialization conflict between concurrent transactions
    SerializationConflict,
    /// The engine picked this transaction as a deadlock victim
    Deadlock,
    /// Unique, foreign key, not-null or check constraint violated
    ConstraintViolation,
    /// The engine rejected the statement itself
    InvalidQuery,
    /// Update or delete targeted a record that does not exist
    MissingRecord,
    /// A record could not be encoded to or decoded from its stored form
    Encoding,
    /// Engine or driver misconfiguration detected at runtime
    Configuration,
    /// Anything the engine could not classify
    Other,
}

impl FailureKind {
    /// Gets the retry category for this kind
    pub fn category(self) -> ErrorCategory {
        match self {
            FailureKind::Timeout
            | FailureKind::ConnectionReset
            | FailureKind::SerializationConflict
            | FailureKind::Deadlock => ErrorCategory::Transient,

            FailureKind::ConstraintViolation
            | FailureKind::InvalidQuery
            | FailureKind::MissingRecord
            | FailureKind::Encoding
            | FailureKind::Configuration
            | FailureKind::Other => ErrorCategory::Fatal,
        }
    }

    /// Short stable name, used for log fields and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::SerializationConflict => "serialization_conflict",
            FailureKind::Deadlock => "deadlock",
            FailureKind::ConstraintViolation => "constraint_violation",
            FailureKind::InvalidQuery => "invalid_query",
            FailureKind::MissingRecord => "missing_record",
            FailureKind::Encoding => "encoding",
            FailureKind::Configuration => "configuration",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a storage engine
#[derive(Error, Debug)]
#[error("Storage {kind} failure: {message}")]
pub struct StorageFailure {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<BoxedCause>,
}

impl DataAccessError for StorageFailure {}

impl StorageFailure {
    /// Create a failure without an underlying cause
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping the driver error that caused it
    pub fn with_source(
        kind: FailureKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a command timeout failure
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("{operation} did not complete within {after:?}"),
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Kind of a `DalError`, for callers that branch on the failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedEngine,
    InvalidConfiguration,
    InvalidState,
    ContextDisposed,
    RetryExhausted,
    Storage,
    Cancelled,
}

/// Errors surfaced by the data-access layer
#[derive(Error, Debug)]
pub enum DalError {
    /// Engine identifier is not registered
    #[error("Unsupported storage engine '{engine}' (registered: {registered})")]
    UnsupportedEngine { engine: String, registered: String },

    /// Malformed connection descriptor or out-of-range setting
    #[error("Invalid configuration value for {key}: {value} ({reason})")]
    InvalidConfiguration {
        key: String,
        value: String,
        reason: String,
    },

    /// Illegal unit-of-work transition
    #[error("Invalid unit of work state: {details}")]
    InvalidState { details: String },

    /// Operation attempted after the context was disposed
    #[error("Storage context for engine '{engine}' has been disposed")]
    ContextDisposed { engine: String },

    /// Every attempt failed transiently
    #[error("Retry attempts exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: StorageFailure,
    },

    /// Storage failure surfaced directly (fatal, or not wrapped by a retry policy)
    #[error(transparent)]
    Storage(#[from] StorageFailure),

    /// A cancellation signal stopped the operation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },
}

impl DataAccessError for DalError {}

/// Result type alias for data-access operations
pub type DalResult<T> = Result<T, DalError>;

impl DalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DalError::UnsupportedEngine { .. } => ErrorKind::UnsupportedEngine,
            DalError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            DalError::InvalidState { .. } => ErrorKind::InvalidState,
            DalError::ContextDisposed { .. } => ErrorKind::ContextDisposed,
            DalError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            DalError::Storage(_) => ErrorKind::Storage,
            DalError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether a retry policy should re-execute the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, DalError::Storage(failure) if failure.is_transient())
    }

    /// Whether the caller may retry at a higher level
    ///
    /// Only `RetryExhausted` qualifies; every other kind is a caller bug,
    /// misconfiguration or a fatal engine failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DalError::RetryExhausted { .. })
    }

    /// Create an invalid configuration error
    pub fn invalid_config(
        key: impl Into<String>,
        value: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfiguration {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(details: impl Into<String>) -> Self {
        Self::InvalidState {
            details: details.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Split a transient storage failure from everything else
    pub(crate) fn into_transient(self) -> Result<StorageFailure, DalError> {
        match self {
            DalError::Storage(failure) if failure.is_transient() => Ok(failure),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_failure_kind_categories() {
        for kind in [
            FailureKind::Timeout,
            FailureKind::ConnectionReset,
            FailureKind::SerializationConflict,
            FailureKind::Deadlock,
        ] {
            assert_eq!(kind.category(), ErrorCategory::Transient, "{kind}");
        }

        for kind in [
            FailureKind::ConstraintViolation,
            FailureKind::InvalidQuery,
            FailureKind::MissingRecord,
            FailureKind::Encoding,
            FailureKind::Configuration,
            FailureKind::Other,
        ] {
            assert_eq!(kind.category(), ErrorCategory::Fatal, "{kind}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = DalError::UnsupportedEngine {
            engine: "oracle-legacy".to_string(),
            registered: "memory, sqlite".to_string(),
        };
        let display = format!("{err}");
        assert!(display.contains("oracle-legacy"));
        assert!(display.contains("memory, sqlite"));

        let err = DalError::invalid_config("command_timeout_secs", 0, "must be greater than 0");
        assert!(format!("{err}").contains("command_timeout_secs"));
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let failure =
            StorageFailure::with_source(FailureKind::ConnectionReset, "flush failed", io_error);
        let err = DalError::RetryExhausted {
            attempts: 3,
            source: failure,
        };

        assert_eq!(err.to_string(), "Retry attempts exhausted after 3 attempts");

        let cause = err.source().expect("exhaustion wraps the last failure");
        assert!(cause.to_string().contains("connection_reset"));
        assert!(cause.source().is_some());
        assert!(err.is_retryable());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_kind_and_transient_classification() {
        let transient: DalError = StorageFailure::timeout("flush", Duration::from_secs(1)).into();
        assert_eq!(transient.kind(), ErrorKind::Storage);
        assert!(transient.is_transient());
        assert!(!transient.is_retryable());

        let fatal: DalError =
            StorageFailure::new(FailureKind::ConstraintViolation, "duplicate key").into();
        assert!(!fatal.is_transient());

        let state = DalError::invalid_state("already committed");
        assert_eq!(state.kind(), ErrorKind::InvalidState);
        assert!(!state.is_transient());
        assert!(state.into_transient().is_err());
    }

    #[test]
    fn test_data_access_error_trait() {
        fn accepts(_: impl DataAccessError) {}

        accepts(DalError::cancelled("commit"));
        accepts(StorageFailure::new(FailureKind::Other, "boom"));
    }
}
