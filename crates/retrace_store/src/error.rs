//! Store errors

use retrace_core::{CoreError, VersionError};

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Trace store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No event at this index in the reader's snapshot
    #[error("Event {index} not found (trace holds {len})")]
    NotFound {
        /// Requested index
        index: u64,
        /// Committed events
        len: u64,
    },
    /// Trace files disagree or fail verification
    #[error("Corrupt trace: {reason}")]
    Corrupt {
        /// What failed
        reason: String,
        /// First index dropped by recovery
        truncated_at: Option<u64>,
    },
    /// File does not start with the expected magic
    #[error("{file}: bad magic")]
    BadMagic {
        /// File name
        file: &'static str,
    },
    /// Unsupported format version
    #[error("{file}: {source}")]
    Version {
        /// File name
        file: &'static str,
        /// Version problem
        source: VersionError,
    },
    /// Another writer holds the session lock
    #[error("Session is locked by a live recorder")]
    Locked,
    /// Mutation on a session without a writer
    #[error("Session is read-only ({status})")]
    ReadOnly {
        /// Current session status
        status: String,
    },
    /// Appended event breaks index or timestamp order
    #[error("Out of order append: {reason}")]
    OutOfOrder {
        /// Which ordering rule broke
        reason: String,
    },
    /// Target directory already holds a session
    #[error("Session directory already exists: {0}")]
    AlreadyExists(String),
    /// Operating system error
    #[error("I/O error during {operation}: {reason}")]
    Io {
        /// What was being done
        operation: String,
        /// OS error text
        reason: String,
    },
    /// Payload blob failed to decode
    #[error("Invalid payload encoding")]
    Encoding,
    /// Scan stopped by its cancel token
    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Wrap an I/O error
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Corruption without truncation
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
            truncated_at: None,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { index, .. } => CoreError::NotFound {
                kind: "event".to_string(),
                id: index.to_string(),
            },
            StoreError::Corrupt {
                reason,
                truncated_at,
            } => CoreError::CorruptTrace {
                reason,
                truncated_at,
            },
            StoreError::BadMagic { .. } | StoreError::Version { .. } => CoreError::CorruptTrace {
                reason: err.to_string(),
                truncated_at: None,
            },
            StoreError::Io { operation, reason } => CoreError::Io { operation, reason },
            StoreError::Encoding => CoreError::InvalidEncoding,
            StoreError::Cancelled => CoreError::Cancelled,
            other => CoreError::Validation {
                field: "store".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidEncoding => Self::Encoding,
            CoreError::Cancelled => Self::Cancelled,
            CoreError::Io { operation, reason } => Self::Io { operation, reason },
            other => Self::Io {
                operation: "store".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_maps_to_corrupt_trace() {
        let err = StoreError::Corrupt {
            reason: "torn tail".into(),
            truncated_at: Some(7),
        };
        assert_eq!(
            CoreError::from(err),
            CoreError::CorruptTrace {
                reason: "torn tail".into(),
                truncated_at: Some(7)
            }
        );
    }

    #[test]
    fn test_not_found_maps() {
        let err = StoreError::NotFound { index: 3, len: 2 };
        assert!(err.to_string().contains('3'));
        assert!(matches!(CoreError::from(err), CoreError::NotFound { .. }));
    }
}
