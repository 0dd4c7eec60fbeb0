//! Filter errors

use retrace_core::CoreError;

/// Filter configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// Malformed `[*]name+size` expression
    #[error("Invalid watch expression '{expr}': {reason}")]
    InvalidWatch {
        /// Offending expression
        expr: String,
        /// What is wrong with it
        reason: String,
    },
    /// Ceiling below zero
    #[error("Ceiling {field} must not be negative (got {value})")]
    NegativeCeiling {
        /// Ceiling name
        field: &'static str,
        /// Value given
        value: i64,
    },
    /// Unparseable allow-list entry
    #[error("Invalid {field} entry '{entry}'")]
    InvalidAllowEntry {
        /// Allow-list name
        field: &'static str,
        /// Offending entry
        entry: String,
    },
    /// Out-of-range tunable
    #[error("Invalid tunable {field}: {reason}")]
    InvalidTunable {
        /// Tunable name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
    /// Trigger name that cannot be a symbol
    #[error("Invalid trigger function '{0}'")]
    InvalidTrigger(String),
    /// Config file unreadable
    #[error("Cannot read config {path}: {reason}")]
    Io {
        /// File path
        path: String,
        /// OS error
        reason: String,
    },
    /// Config file is not valid JSON for a filter
    #[error("Cannot parse config {path}: {reason}")]
    Parse {
        /// File path
        path: String,
        /// Parser message
        reason: String,
    },
}

impl FilterError {
    /// Config field the error concerns
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::InvalidWatch { .. } => "watch",
            Self::NegativeCeiling { field, .. }
            | Self::InvalidAllowEntry { field, .. }
            | Self::InvalidTunable { field, .. } => *field,
            Self::InvalidTrigger(_) => "trigger",
            Self::Io { .. } | Self::Parse { .. } => "config",
        }
    }
}

impl From<FilterError> for CoreError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Io { path, reason } => CoreError::Io {
                operation: format!("read {path}"),
                reason,
            },
            other => CoreError::InvalidFilter {
                field: other.field().to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_ceiling_converts_to_invalid_filter() {
        let err = FilterError::NegativeCeiling {
            field: "stack_bytes",
            value: -1,
        };
        match CoreError::from(err) {
            CoreError::InvalidFilter { field, reason } => {
                assert_eq!(field, "stack_bytes");
                assert!(reason.contains("-1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_io_converts_to_io() {
        let err = FilterError::Io {
            path: "/nope".into(),
            reason: "denied".into(),
        };
        assert!(matches!(CoreError::from(err), CoreError::Io { .. }));
    }
}
