//! Session summaries and session-directory management.

use crate::error::{StoreError, StoreResult};
use crate::layout::TraceDir;
use crate::meta::{SessionMeta, SessionStatus};
use crate::store::TraceStore;
use nix::fcntl::{Flock, FlockArg};
use retrace_core::{CancelToken, MonoTime};
use retrace_log::{Category, CategoryMask};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Statistics over one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session directory
    pub dir: PathBuf,
    /// Session metadata
    pub meta: SessionMeta,
    /// Committed events
    pub event_count: u64,
    /// Timestamp of the first event
    pub first_timestamp: Option<MonoTime>,
    /// Timestamp of the last event
    pub last_timestamp: Option<MonoTime>,
    /// Events per category, indexed by [`Category::slot`]
    pub category_counts: [u64; 4],
    /// Whether a minidump is linked and present
    pub has_minidump: bool,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

impl SessionSummary {
    /// Scan a store's headers
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or any read error
    pub fn collect(store: &TraceStore, cancel: &CancelToken) -> StoreResult<Self> {
        let mut summary = Self {
            dir: store.dir().root().to_path_buf(),
            meta: store.meta(),
            event_count: 0,
            first_timestamp: None,
            last_timestamp: None,
            category_counts: [0; 4],
            has_minidump: store.minidump_path().is_some(),
            warnings: store.warnings().to_vec(),
        };
        for header in store.headers(.., CategoryMask::ALL).with_cancel(cancel.clone()) {
            let header = header?;
            summary.event_count += 1;
            summary.first_timestamp.get_or_insert(header.timestamp);
            summary.last_timestamp = Some(header.timestamp);
            summary.category_counts[header.category.slot()] += 1;
        }
        if summary.meta.status == SessionStatus::Crashed && !summary.has_minidump {
            summary
                .warnings
                .push("target crashed but no minidump could be produced".to_string());
        }
        Ok(summary)
    }

    /// Events of one category
    #[must_use]
    pub fn count(&self, category: Category) -> u64 {
        self.category_counts[category.slot()]
    }

    /// Nanoseconds between first and last event
    #[must_use]
    pub fn span_nanos(&self) -> u64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last.since(first),
            _ => 0,
        }
    }

    /// Add a warning
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// Sessions under `parent`, most recent first. Directories that fail to
/// open are skipped with a warning.
///
/// # Errors
///
/// Returns error if `parent` cannot be listed
pub fn list_sessions(parent: &Path) -> StoreResult<Vec<SessionSummary>> {
    let entries =
        std::fs::read_dir(parent).map_err(|e| StoreError::io("list session directory", &e))?;
    let never = CancelToken::never();
    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !TraceDir::new(&path).is_session() {
            continue;
        }
        match TraceStore::open(&path).and_then(|store| SessionSummary::collect(&store, &never)) {
            Ok(summary) => sessions.push(summary),
            Err(e) => warn!(dir = %path.display(), error = %e, "Skipping unreadable session"),
        }
    }
    sessions.sort_by(|a, b| b.meta.start_time.cmp(&a.meta.start_time));
    Ok(sessions)
}

/// Remove a session directory. A session with a live recorder is refused.
///
/// # Errors
///
/// Returns `Locked` while a recorder holds the session, or an I/O error
pub fn delete_session(path: &Path) -> StoreResult<()> {
    let dir = TraceDir::new(path);
    if !dir.is_session() {
        return Err(StoreError::Io {
            operation: "delete session".to_string(),
            reason: format!("{} is not a session directory", path.display()),
        });
    }
    let meta_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.meta())
        .map_err(|e| StoreError::io("open session.meta", &e))?;
    let lock = Flock::lock(meta_file, FlockArg::LockExclusiveNonblock)
        .map_err(|_| StoreError::Locked)?;
    std::fs::remove_dir_all(dir.root()).map_err(|e| StoreError::io("delete session", &e))?;
    drop(lock);
    info!(dir = %path.display(), "Deleted session");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CreateOptions;
    use retrace_log::{Event, EventHeader};

    fn make(dir: &Path, categories: &[Category], status: Option<SessionStatus>) -> TraceStore {
        let store = TraceStore::create(dir, CreateOptions::new("/bin/x", 9)).unwrap();
        for (i, c) in categories.iter().enumerate() {
            let ts = MonoTime::from_nanos(100 + i as u64 * 50);
            let header = EventHeader::new(i as u64, ts, *c, 1);
            store.append(&Event::new(header, Vec::new())).unwrap();
        }
        if let Some(status) = status {
            store.finalize(status).unwrap();
        }
        store
    }

    #[test]
    fn test_summary_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let cats = [Category::Syscall, Category::Syscall, Category::DBus];
        let store = make(tmp.path(), &cats, Some(SessionStatus::Complete));
        let summary = SessionSummary::collect(&store, &CancelToken::never()).unwrap();
        assert_eq!(summary.event_count, 3);
        assert_eq!(summary.count(Category::Syscall), 2);
        assert_eq!(summary.count(Category::DBus), 1);
        assert_eq!(summary.count(Category::X11), 0);
        assert_eq!(summary.span_nanos(), 100);
        assert!(summary.warnings.is_empty());
    }

    #[test]
    fn test_summary_crashed_without_minidump_warns() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make(tmp.path(), &[Category::Signal], Some(SessionStatus::Crashed));
        let summary = SessionSummary::collect(&store, &CancelToken::never()).unwrap();
        assert!(!summary.has_minidump);
        assert_eq!(summary.warnings.len(), 1);
    }

    #[test]
    fn test_list_sessions_recent_first() {
        let parent = tempfile::tempdir().unwrap();
        make(&parent.path().join("a"), &[Category::Syscall], Some(SessionStatus::Complete));
        std::thread::sleep(std::time::Duration::from_millis(2));
        make(&parent.path().join("b"), &[], Some(SessionStatus::Complete));
        std::fs::create_dir(parent.path().join("not-a-session")).unwrap();

        let sessions = list_sessions(parent.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].dir.ends_with("b"));
        assert!(sessions[1].dir.ends_with("a"));
    }

    #[test]
    fn test_delete_session() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("s");
        make(&path, &[Category::Syscall], Some(SessionStatus::Complete));
        delete_session(&path).unwrap();
        assert!(!path.exists());
        assert!(delete_session(&path).is_err());
    }

    #[test]
    fn test_delete_live_session_refused() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("live");
        let _writer = make(&path, &[Category::Syscall], None);
        assert_eq!(delete_session(&path), Err(StoreError::Locked));
        assert!(path.exists());
    }
}
