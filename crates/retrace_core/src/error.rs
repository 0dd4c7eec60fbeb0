//! Core error types for retrace.
//!
//! Every crate keeps its own error enum and converts into [`CoreError`]
//! when a caller wants a single type to match on.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Why attaching to a target failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachFailure {
    /// Executable or PID does not exist
    TargetNotFound,
    /// The kernel refused the trace request
    Denied,
    /// Attach did not complete within the configured timeout
    TimedOut,
    /// The caller abandoned the attach
    Aborted,
}

impl fmt::Display for AttachFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetNotFound => write!(f, "target not found"),
            Self::Denied => write!(f, "attach permission denied"),
            Self::TimedOut => write!(f, "attach timed out"),
            Self::Aborted => write!(f, "attach aborted"),
        }
    }
}

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Could not attach to the target; no session was produced
    Attach {
        /// Failure class
        failure: AttachFailure,
        /// Target description (path or pid)
        target: String,
    },

    /// Trace index and payload disagree
    CorruptTrace {
        /// What was inconsistent
        reason: String,
        /// First index dropped by recovery, if recovery truncated
        truncated_at: Option<u64>,
    },

    /// Filter configuration rejected before recording
    InvalidFilter {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Minidump could not be parsed
    MinidumpFormat {
        /// Parse failure detail
        reason: String,
    },

    /// Cooperative cancellation of a long scan
    Cancelled,

    /// Invalid encoding
    InvalidEncoding,

    /// Not found
    NotFound {
        /// Kind of thing looked up
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// I/O failure
    Io {
        /// Operation that failed
        operation: String,
        /// OS error text
        reason: String,
    },

    /// Validation error
    Validation {
        /// Field that failed validation
        field: String,
        /// Why
        reason: String,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Whether the caller can keep using the session after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CorruptTrace { .. } | Self::MinidumpFormat { .. } | Self::Cancelled
        )
    }

    /// Build an I/O error from an operation name and a std error
    #[must_use]
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach { failure, target } => write!(f, "Attach to {} failed: {}", target, failure),
            Self::CorruptTrace { reason, truncated_at } => match truncated_at {
                Some(at) => write!(f, "Corrupt trace (truncated at event {}): {}", at, reason),
                None => write!(f, "Corrupt trace: {}", reason),
            },
            Self::InvalidFilter { field, reason } => {
                write!(f, "Invalid filter {}: {}", field, reason)
            }
            Self::MinidumpFormat { reason } => write!(f, "Invalid minidump: {}", reason),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::Io { operation, reason } => write!(f, "I/O error during {}: {}", operation, reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

impl From<postcard::Error> for CoreError {
    fn from(_: postcard::Error) -> Self {
        Self::InvalidEncoding
    }
}
