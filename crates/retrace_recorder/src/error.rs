//! Recorder errors

use retrace_core::{AttachFailure, CoreError};
use retrace_dump::DumpError;
use retrace_filter::FilterError;
use retrace_store::StoreError;

/// Recorder result type
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Why the recorder could not get hold of the target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// Executable or PID does not exist
    #[error("Target not found: {target}")]
    TargetNotFound {
        /// Path or pid as given
        target: String,
    },
    /// The kernel refused the trace request
    #[error("Attach to {target} denied: {reason}")]
    Denied {
        /// Path or pid as given
        target: String,
        /// OS error text
        reason: String,
    },
    /// Attach did not finish in time
    #[error("Attach to {target} timed out after {timeout_ms}ms")]
    TimedOut {
        /// Path or pid as given
        target: String,
        /// Configured limit
        timeout_ms: u64,
    },
    /// The caller abandoned the attach
    #[error("Attach to {target} aborted")]
    Aborted {
        /// Path or pid as given
        target: String,
    },
}

impl AttachError {
    /// Target description
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::TargetNotFound { target }
            | Self::Denied { target, .. }
            | Self::TimedOut { target, .. }
            | Self::Aborted { target } => target,
        }
    }

    /// Failure class
    #[must_use]
    pub const fn failure(&self) -> AttachFailure {
        match self {
            Self::TargetNotFound { .. } => AttachFailure::TargetNotFound,
            Self::Denied { .. } => AttachFailure::Denied,
            Self::TimedOut { .. } => AttachFailure::TimedOut,
            Self::Aborted { .. } => AttachFailure::Aborted,
        }
    }
}

/// Recorder errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecorderError {
    /// Could not attach
    #[error(transparent)]
    Attach(#[from] AttachError),
    /// Filter rejected before recording
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// Trace write failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Minidump could not be encoded or attached
    #[error(transparent)]
    Dump(#[from] DumpError),
    /// Tracing backend failure after attach
    #[error("Tracer error: {reason}")]
    Tracer {
        /// What went wrong
        reason: String,
    },
    /// Preload event socket failure
    #[error("Preload socket error: {reason}")]
    Preload {
        /// What went wrong
        reason: String,
    },
    /// Background task ended abnormally
    #[error("Recorder task failed: {reason}")]
    Task {
        /// Join error text
        reason: String,
    },
}

impl RecorderError {
    pub(crate) fn tracer(reason: impl Into<String>) -> Self {
        Self::Tracer {
            reason: reason.into(),
        }
    }
}

impl From<AttachError> for CoreError {
    fn from(err: AttachError) -> Self {
        CoreError::Attach {
            failure: err.failure(),
            target: err.target().to_string(),
        }
    }
}

impl From<RecorderError> for CoreError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::Attach(e) => e.into(),
            RecorderError::Filter(e) => e.into(),
            RecorderError::Store(e) => e.into(),
            RecorderError::Dump(e) => e.into(),
            RecorderError::Tracer { reason } => CoreError::Internal {
                message: format!("tracer: {reason}"),
            },
            RecorderError::Preload { reason } => CoreError::Internal {
                message: format!("preload: {reason}"),
            },
            RecorderError::Task { reason } => CoreError::Internal { message: reason },
        }
    }
}
