//! On-disk format versions.
//!
//! Every retrace file starts with a four-byte magic and a u16 version. A
//! reader accepts its own version and refuses anything newer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of one on-disk format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion(u16);

impl FormatVersion {
    /// First released layout
    pub const V1: Self = Self(1);

    /// Version written by this build
    pub const CURRENT: Self = Self::V1;

    /// Create from the raw header field
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw header field
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Check that a version read from disk can be decoded by this build
    ///
    /// # Errors
    ///
    /// Returns error if the version is zero or newer than [`Self::CURRENT`]
    pub fn check(found: u16) -> Result<Self, VersionError> {
        if found == 0 {
            return Err(VersionError::Zero);
        }
        if found > Self::CURRENT.0 {
            return Err(VersionError::Unsupported {
                found,
                supported: Self::CURRENT.0,
            });
        }
        Ok(Self(found))
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Version errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Header carries version zero
    #[error("Format version is zero")]
    Zero,
    /// Written by a newer build
    #[error("Unsupported format version {found} (this build reads up to {supported})")]
    Unsupported {
        /// Version found in the header
        found: u16,
        /// Newest version this build reads
        supported: u16,
    },
}
