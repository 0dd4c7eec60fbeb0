//! Minidump errors

use retrace_core::CoreError;
use retrace_store::StoreError;

/// Minidump result type
pub type DumpResult<T> = Result<T, DumpError>;

/// Minidump errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    /// Input is not a well-formed minidump
    #[error("Invalid minidump: {reason}")]
    InvalidFormat {
        /// What is malformed
        reason: String,
    },
    /// File could not be read or written
    #[error("I/O error during {operation}: {reason}")]
    Io {
        /// What was being done
        operation: String,
        /// OS error text
        reason: String,
    },
    /// Trace lookup failed during correlation
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DumpError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }
}

impl From<DumpError> for CoreError {
    fn from(err: DumpError) -> Self {
        match err {
            DumpError::InvalidFormat { reason } => CoreError::MinidumpFormat { reason },
            DumpError::Io { operation, reason } => CoreError::Io { operation, reason },
            DumpError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_format_maps_to_minidump_format() {
        let err = DumpError::invalid("short header");
        assert!(matches!(CoreError::from(err), CoreError::MinidumpFormat { .. }));
    }
}
