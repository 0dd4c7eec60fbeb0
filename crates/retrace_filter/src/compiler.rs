//! Filter compilation.
//!
//! Turns a validated [`FilterConfig`] into the lookup structure the capture
//! path consults once per stop.

use crate::allow::CodeAllow;
use crate::config::{FilterConfig, Tunables};
use crate::error::FilterError;
use crate::watch::WatchVar;
use retrace_log::{Category, CategoryMask};
use std::collections::BTreeSet;
use tracing::debug;

/// Compiled filter ready for the capture path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    mask: CategoryMask,
    syscalls: Option<BTreeSet<u32>>,
    signals: CodeAllow,
    x11_events: CodeAllow,
    dbus_messages: CodeAllow,
    /// Heap snapshot bytes; 0 disables heap capture
    pub heap_ceiling: usize,
    /// Stack snapshot bytes
    pub stack_ceiling: usize,
    /// Bytes captured per syscall buffer argument or message
    pub param_ceiling: usize,
    /// Watched globals
    pub watch: Vec<WatchVar>,
    /// Start trigger function
    pub trigger: Option<String>,
    /// Drop events from threads other than the originating one
    pub current_thread_only: bool,
    /// Recorder tunables
    pub tunables: Tunables,
}

impl CompiledFilter {
    /// Validate and compile
    ///
    /// # Errors
    ///
    /// Returns the first validation error
    pub fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        config.validate()?;
        let to_usize = |field: &'static str, value: i64| {
            usize::try_from(value).map_err(|_| FilterError::NegativeCeiling { field, value })
        };
        let heap_kb = to_usize("heap_kb", config.heap_kb)?;

        let compiled = Self {
            mask: config.categories.mask(),
            syscalls: config.syscalls.expand(),
            signals: config.signals.clone(),
            x11_events: config.x11_events.clone(),
            dbus_messages: config.dbus_messages.clone(),
            heap_ceiling: heap_kb.saturating_mul(1024),
            stack_ceiling: to_usize("stack_bytes", config.stack_bytes)?,
            param_ceiling: to_usize("param_bytes", config.param_bytes)?,
            watch: config.watch.clone(),
            trigger: config.trigger.clone(),
            current_thread_only: config.current_thread_only,
            tunables: config.tunables.clone(),
        };
        debug!(
            mask = compiled.mask.bits(),
            syscalls = compiled.syscalls.as_ref().map_or(0, BTreeSet::len),
            watch = compiled.watch.len(),
            "Compiled filter"
        );
        Ok(compiled)
    }

    /// Enabled categories
    #[must_use]
    pub fn mask(&self) -> CategoryMask {
        self.mask
    }

    /// Whether a category is enabled at all
    #[must_use]
    pub fn enabled(&self, category: Category) -> bool {
        self.mask.contains(category)
    }

    /// Syscall numbers admitted; `None` admits all
    #[must_use]
    pub fn syscall_set(&self) -> Option<&BTreeSet<u32>> {
        self.syscalls.as_ref()
    }

    /// Whether an event of `category` with `code` is captured
    #[must_use]
    pub fn admits(&self, category: Category, code: u32) -> bool {
        if !self.enabled(category) {
            return false;
        }
        match category {
            Category::Syscall => self.syscalls.as_ref().is_none_or(|set| set.contains(&code)),
            Category::Signal => self.signals.admits(code),
            Category::X11 => self.x11_events.admits(code),
            Category::DBus => self.dbus_messages.admits(code),
        }
    }

    /// Whether X11 or D-Bus capture needs the preload listener
    #[must_use]
    pub fn needs_preload(&self) -> bool {
        self.enabled(Category::X11) || self.enabled(Category::DBus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allow::SyscallAllow;

    #[test]
    fn test_disabled_category_admits_nothing() {
        let config = FilterConfig::default().with_categories(CategoryMask::only(Category::Syscall));
        let filter = CompiledFilter::compile(&config).unwrap();
        assert!(filter.admits(Category::Syscall, 0));
        assert!(!filter.admits(Category::Signal, 15));
        assert!(!filter.needs_preload());
    }

    #[test]
    fn test_syscall_allow_list() {
        let config = FilterConfig {
            syscalls: SyscallAllow::parse("memory").unwrap(),
            ..FilterConfig::default()
        };
        let filter = CompiledFilter::compile(&config).unwrap();
        assert!(filter.admits(Category::Syscall, 9));
        assert!(!filter.admits(Category::Syscall, 0));
    }

    #[test]
    fn test_ceilings_in_bytes() {
        let config = FilterConfig {
            heap_kb: 4,
            ..FilterConfig::default()
        };
        let filter = CompiledFilter::compile(&config).unwrap();
        assert_eq!(filter.heap_ceiling, 4096);
        assert_eq!(filter.stack_ceiling, 32);
        assert_eq!(filter.param_ceiling, 256);
    }

    #[test]
    fn test_compile_rejects_invalid() {
        let config = FilterConfig {
            heap_kb: -1,
            ..FilterConfig::default()
        };
        assert!(CompiledFilter::compile(&config).is_err());
    }

    #[test]
    fn test_code_allow_lists_apply() {
        let mut config = FilterConfig::default();
        config.categories.dbus = true;
        config.signals = CodeAllow(vec![17]);
        config.dbus_messages = CodeAllow(vec![1, 2]);
        let filter = CompiledFilter::compile(&config).unwrap();
        assert!(filter.admits(Category::Signal, 17));
        assert!(!filter.admits(Category::Signal, 15));
        assert!(filter.admits(Category::DBus, 2));
        assert!(!filter.admits(Category::DBus, 4));
        assert!(filter.needs_preload());
    }
}
