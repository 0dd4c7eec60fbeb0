//! Loading filter configuration.
//!
//! Resolution order: explicit path, then `RETRACE_CONFIG`, then
//! `$HOME/.config/retrace.json`. A missing default file means defaults; a
//! missing explicit file is an error. Command-line overrides are applied last.

use crate::allow::{CodeAllow, SyscallAllow};
use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::watch::WatchVar;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "RETRACE_CONFIG";

/// Default config path from the environment
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    resolve_path(std::env::var_os(CONFIG_ENV), std::env::var_os("HOME"))
}

fn resolve_path(explicit: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    explicit
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(|| home.map(|h| PathBuf::from(h).join(".config").join("retrace.json")))
}

/// Read and validate one config file
///
/// # Errors
///
/// Returns error if the file cannot be read, parsed or validated
pub fn load_file(path: &Path) -> Result<FilterConfig, FilterError> {
    let text = std::fs::read_to_string(path).map_err(|e| FilterError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config: FilterConfig = serde_json::from_str(&text).map_err(|e| FilterError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    config.validate()?;
    debug!(path = %path.display(), "Loaded filter config");
    Ok(config)
}

/// Load the effective config
///
/// # Errors
///
/// Returns error if an explicit file is missing, or any file found is invalid
pub fn load_config(explicit: Option<&Path>) -> Result<FilterConfig, FilterError> {
    if let Some(path) = explicit {
        return load_file(path);
    }
    match config_path() {
        Some(path) if path.exists() => load_file(&path),
        Some(path) => {
            info!(path = %path.display(), "No filter config, using defaults");
            Ok(FilterConfig::default())
        }
        None => Ok(FilterConfig::default()),
    }
}

/// Command-line overrides, in the recorder's flag syntax
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOverrides {
    /// `--var=[*]name+size[,...]`
    pub vars: Option<String>,
    /// `--func=name`
    pub func: Option<String>,
    /// `--sys=group|name|nr[,...]`
    pub sys: Option<String>,
    /// `--signal=nr[,...]`
    pub signal: Option<String>,
    /// `--x11=type[,...]`; enables X11 capture
    pub x11: Option<String>,
    /// `--dbus=type[,...]`; enables D-Bus capture
    pub dbus: Option<String>,
    /// `--stack-size` in bytes
    pub stack_size: Option<i64>,
    /// `--heap-size` in KB
    pub heap_size: Option<i64>,
    /// `--param-size` in bytes
    pub param_size: Option<i64>,
    /// `-1`: record only the originating thread
    pub current_thread: bool,
}

impl FilterOverrides {
    /// Apply on top of `config` and validate the result
    ///
    /// # Errors
    ///
    /// Returns error on a malformed flag value
    pub fn apply(&self, mut config: FilterConfig) -> Result<FilterConfig, FilterError> {
        if let Some(vars) = &self.vars {
            config.watch = WatchVar::parse_list(vars)?;
        }
        if let Some(func) = &self.func {
            config.trigger = Some(func.clone()).filter(|f| !f.is_empty());
        }
        if let Some(sys) = &self.sys {
            config.syscalls = SyscallAllow::parse(sys)?;
            config.categories.syscall = true;
        }
        if let Some(signal) = &self.signal {
            config.signals = CodeAllow::parse("signals", signal)?;
            config.categories.signal = true;
        }
        if let Some(x11) = &self.x11 {
            config.x11_events = CodeAllow::parse("x11_events", x11)?;
            config.categories.x11 = true;
        }
        if let Some(dbus) = &self.dbus {
            config.dbus_messages = CodeAllow::parse("dbus_messages", dbus)?;
            config.categories.dbus = true;
        }
        if let Some(v) = self.stack_size {
            config.stack_bytes = v;
        }
        if let Some(v) = self.heap_size {
            config.heap_kb = v;
        }
        if let Some(v) = self.param_size {
            config.param_bytes = v;
        }
        if self.current_thread {
            config.current_thread_only = true;
        }
        config.validate()?;
        Ok(config)
    }
}
