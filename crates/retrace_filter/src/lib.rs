//! retrace Filter Configuration
//!
//! What the recorder captures: enabled categories, per-category code
//! allow-lists, payload ceilings, watched globals, the start trigger and the
//! originating-thread restriction, plus the recorder tunables that travel
//! with them. A [`FilterConfig`] is validated and compiled into a
//! [`CompiledFilter`] before recording starts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allow;
pub mod compiler;
pub mod config;
pub mod error;
pub mod source;
pub mod watch;

pub use allow::{CodeAllow, SyscallAllow};
pub use compiler::CompiledFilter;
pub use config::{CategoryToggles, FilterConfig, SyncPolicy, Tunables};
pub use error::FilterError;
pub use source::{CONFIG_ENV, FilterOverrides, config_path, load_config, load_file};
pub use watch::WatchVar;
