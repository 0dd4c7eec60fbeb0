//! Replay errors

use retrace_core::CoreError;
use retrace_dump::DumpError;
use retrace_store::StoreError;

/// Replay result type
pub type ReplayResult<T> = Result<T, ReplayError>;

/// Query language errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Nothing to parse
    #[error("Empty query")]
    Empty,
    /// First word is not a query command
    #[error("Unknown query command: {0}")]
    UnknownCommand(String),
    /// Command given without its range
    #[error("Missing parameter for {0}")]
    MissingParameter(&'static str),
    /// A number failed to parse
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    /// Comparison operator is not one of `<`, `<=`, `==`, `>=`, `>`
    #[error("Invalid comparison operator: {0}")]
    InvalidOperator(String),
    /// Words left after a complete query
    #[error("Unexpected input: {0}")]
    Trailing(String),
}

/// Replay controller errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// Trace read failed
    #[error(transparent)]
    Store(StoreError),
    /// Minidump could not be used
    #[error(transparent)]
    Dump(#[from] DumpError),
    /// Query text is malformed
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A payload failed to decode
    #[error("Payload of event {index} is unreadable: {reason}")]
    Payload {
        /// Event index
        index: u64,
        /// Decoder message
        reason: String,
    },
    /// Scan stopped by its cancel token
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<StoreError> for ReplayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => Self::Cancelled,
            other => Self::Store(other),
        }
    }
}

impl From<QueryError> for CoreError {
    fn from(err: QueryError) -> Self {
        CoreError::Validation {
            field: "query".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<ReplayError> for CoreError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::Store(e) => e.into(),
            ReplayError::Dump(e) => e.into(),
            ReplayError::Query(e) => e.into(),
            ReplayError::Payload { .. } => CoreError::InvalidEncoding,
            ReplayError::Cancelled => CoreError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_recoverable() {
        assert!(CoreError::from(ReplayError::Cancelled).is_recoverable());
    }

    #[test]
    fn test_store_cancel_becomes_replay_cancel() {
        assert_eq!(ReplayError::from(StoreError::Cancelled), ReplayError::Cancelled);
        assert!(matches!(ReplayError::from(StoreError::Locked), ReplayError::Store(_)));
    }

    #[test]
    fn test_query_error_maps_to_validation() {
        let err = ReplayError::from(QueryError::UnknownCommand("frob".to_string()));
        assert!(matches!(CoreError::from(err), CoreError::Validation { .. }));
    }
}
