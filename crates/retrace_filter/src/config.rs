//! Filter configuration.
//!
//! Deserialised from JSON with every field optional; missing fields take
//! the recorder defaults.

use crate::allow::{CodeAllow, SyscallAllow};
use crate::error::FilterError;
use crate::watch::{WatchVar, is_symbol};
use indexmap::IndexMap;
use retrace_log::{Category, CategoryMask};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Independent enables per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryToggles {
    /// Capture system calls
    pub syscall: bool,
    /// Capture signals
    pub signal: bool,
    /// Capture X11 events (needs the X11 preload interceptor)
    pub x11: bool,
    /// Capture D-Bus messages (needs the D-Bus preload interceptor)
    pub dbus: bool,
}

impl Default for CategoryToggles {
    fn default() -> Self {
        Self {
            syscall: true,
            signal: true,
            x11: false,
            dbus: false,
        }
    }
}

impl CategoryToggles {
    /// Enabled categories as a mask
    #[must_use]
    pub fn mask(&self) -> CategoryMask {
        let mut mask = CategoryMask::NONE;
        for (on, category) in [
            (self.syscall, Category::Syscall),
            (self.signal, Category::Signal),
            (self.x11, Category::X11),
            (self.dbus, Category::DBus),
        ] {
            if on {
                mask = mask.with(category);
            }
        }
        mask
    }

    /// Toggle one category
    pub fn set(&mut self, category: Category, on: bool) {
        match category {
            Category::Syscall => self.syscall = on,
            Category::Signal => self.signal = on,
            Category::X11 => self.x11 = on,
            Category::DBus => self.dbus = on,
        }
    }
}

/// When the store fsyncs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// fsync index and payload after every append
    EveryEvent,
    /// fsync once when the session is finalized
    #[default]
    OnClose,
}

/// Recorder tunables carried with the filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Bounded capture queue depth
    pub queue_depth: usize,
    /// Reorder window before committing, in ms
    pub reorder_window_ms: u64,
    /// Store sync policy
    pub sync: SyncPolicy,
    /// Upper bound on attach, in ms
    pub attach_timeout_ms: u64,
    /// Preload libraries injected into the target for X11/D-Bus capture
    pub preload: Vec<PathBuf>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            reorder_window_ms: 20,
            sync: SyncPolicy::OnClose,
            attach_timeout_ms: 5_000,
            preload: Vec::new(),
        }
    }
}

/// What to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Enabled categories
    pub categories: CategoryToggles,
    /// Syscall allow-list
    pub syscalls: SyscallAllow,
    /// Signal allow-list
    pub signals: CodeAllow,
    /// X11 event type allow-list
    pub x11_events: CodeAllow,
    /// D-Bus message type allow-list
    pub dbus_messages: CodeAllow,
    /// Heap snapshot ceiling in KB; 0 disables
    pub heap_kb: i64,
    /// Stack snapshot ceiling in bytes
    pub stack_bytes: i64,
    /// Syscall argument buffer ceiling in bytes
    pub param_bytes: i64,
    /// Watched globals
    pub watch: Vec<WatchVar>,
    /// Start recording after this function first returns
    pub trigger: Option<String>,
    /// Record only the originating thread
    pub current_thread_only: bool,
    /// Recorder tunables
    pub tunables: Tunables,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            categories: CategoryToggles::default(),
            syscalls: SyscallAllow::default(),
            signals: CodeAllow::default(),
            x11_events: CodeAllow::default(),
            dbus_messages: CodeAllow::default(),
            heap_kb: 0,
            stack_bytes: 32,
            param_bytes: 256,
            watch: Vec::new(),
            trigger: None,
            current_thread_only: true,
            tunables: Tunables::default(),
        }
    }
}

impl FilterConfig {
    /// Builder method: enable exactly the categories in `mask`
    #[must_use]
    pub fn with_categories(mut self, mask: CategoryMask) -> Self {
        for category in Category::ALL {
            self.categories.set(category, mask.contains(category));
        }
        self
    }

    /// Builder method: start trigger
    #[must_use]
    pub fn with_trigger(mut self, function: impl Into<String>) -> Self {
        self.trigger = Some(function.into());
        self
    }

    /// Builder method: record every thread
    #[must_use]
    pub fn all_threads(mut self) -> Self {
        self.current_thread_only = false;
        self
    }

    /// Check every field
    ///
    /// # Errors
    ///
    /// Returns the first problem found
    pub fn validate(&self) -> Result<(), FilterError> {
        for (field, value) in [
            ("heap_kb", self.heap_kb),
            ("stack_bytes", self.stack_bytes),
            ("param_bytes", self.param_bytes),
        ] {
            if value < 0 {
                return Err(FilterError::NegativeCeiling { field, value });
            }
        }
        if let Some(trigger) = self.trigger.as_deref().filter(|t| !is_symbol(t)) {
            return Err(FilterError::InvalidTrigger(trigger.to_string()));
        }
        if self.tunables.queue_depth == 0 {
            return Err(FilterError::InvalidTunable {
                field: "queue_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tunables.attach_timeout_ms == 0 {
            return Err(FilterError::InvalidTunable {
                field: "attach_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Ordered key/value view for display
    #[must_use]
    pub fn summary(&self) -> IndexMap<&'static str, String> {
        let mut out = IndexMap::new();
        let categories: Vec<_> = self.categories.mask().iter().map(|c| c.name()).collect();
        out.insert("categories", categories.join(","));
        out.insert("heap", format!("{} KB", self.heap_kb));
        out.insert("stack", format!("{} bytes", self.stack_bytes));
        out.insert("params", format!("{} bytes", self.param_bytes));
        let watch: Vec<_> = self.watch.iter().map(ToString::to_string).collect();
        out.insert("watch", watch.join(","));
        out.insert("trigger", self.trigger.clone().unwrap_or_default());
        out.insert("current_thread_only", self.current_thread_only.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FilterConfig::default();
        assert_eq!(cfg.heap_kb, 0);
        assert_eq!(cfg.stack_bytes, 32);
        assert_eq!(cfg.param_bytes, 256);
        assert!(cfg.current_thread_only);
        assert_eq!(
            cfg.categories.mask(),
            CategoryMask::only(Category::Syscall).with(Category::Signal)
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: FilterConfig =
            serde_json::from_str(r#"{"stack_bytes": 64, "watch": ["*g+8"], "categories": {"dbus": true}}"#)
                .unwrap();
        assert_eq!(cfg.stack_bytes, 64);
        assert_eq!(cfg.param_bytes, 256);
        assert!(cfg.categories.dbus);
        assert!(cfg.categories.syscall);
        assert_eq!(cfg.watch[0].size, 8);
    }

    #[test]
    fn test_negative_ceiling_rejected() {
        let cfg = FilterConfig {
            param_bytes: -5,
            ..FilterConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(FilterError::NegativeCeiling {
                field: "param_bytes",
                value: -5
            })
        );
    }

    #[test]
    fn test_zero_ceilings_allowed() {
        let cfg = FilterConfig {
            heap_kb: 0,
            stack_bytes: 0,
            param_bytes: 0,
            ..FilterConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_trigger_rejected() {
        let cfg = FilterConfig::default().with_trigger("not a symbol");
        assert!(matches!(cfg.validate(), Err(FilterError::InvalidTrigger(_))));
    }

    #[test]
    fn test_with_categories() {
        let cfg = FilterConfig::default().with_categories(CategoryMask::only(Category::X11));
        assert!(cfg.categories.x11);
        assert!(!cfg.categories.syscall);
    }

    #[test]
    fn test_sync_policy_serde() {
        let t: Tunables = serde_json::from_str(r#"{"sync":"every_event"}"#).unwrap();
        assert_eq!(t.sync, SyncPolicy::EveryEvent);
        assert_eq!(t.queue_depth, 1024);
    }

    #[test]
    fn test_summary_order() {
        let keys: Vec<_> = FilterConfig::default().summary().keys().copied().collect();
        assert_eq!(keys[0], "categories");
        assert_eq!(keys.last(), Some(&"current_thread_only"));
    }
}
