//! Trace directory layout.

use std::path::{Path, PathBuf};

/// Session metadata file
pub const META_FILE: &str = "session.meta";
/// Fixed-width event index
pub const INDEX_FILE: &str = "events.idx";
/// Payload blobs
pub const PAYLOAD_FILE: &str = "payload.bin";
/// Optional minidump
pub const MINIDUMP_FILE: &str = "crash.dmp";

/// Paths inside one session directory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceDir {
    root: PathBuf,
}

impl TraceDir {
    /// Layout rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Session directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `session.meta`
    #[must_use]
    pub fn meta(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    /// `events.idx`
    #[must_use]
    pub fn index(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// `payload.bin`
    #[must_use]
    pub fn payload(&self) -> PathBuf {
        self.root.join(PAYLOAD_FILE)
    }

    /// `crash.dmp`
    #[must_use]
    pub fn minidump(&self) -> PathBuf {
        self.root.join(MINIDUMP_FILE)
    }

    /// Whether the directory looks like a session
    #[must_use]
    pub fn is_session(&self) -> bool {
        self.meta().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let dir = TraceDir::new("/tmp/s1");
        assert_eq!(dir.meta(), PathBuf::from("/tmp/s1/session.meta"));
        assert_eq!(dir.index(), PathBuf::from("/tmp/s1/events.idx"));
        assert_eq!(dir.payload(), PathBuf::from("/tmp/s1/payload.bin"));
        assert_eq!(dir.minidump(), PathBuf::from("/tmp/s1/crash.dmp"));
        assert!(!dir.is_session());
    }
}
