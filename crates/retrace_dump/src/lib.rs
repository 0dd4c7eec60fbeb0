//! retrace Minidump
//!
//! A minidump captures a crashed target: the faulting thread and signal,
//! every thread's registers and stack top, the loaded modules and a few
//! memory ranges. It is written by the recorder next to the trace and
//! linked to it by session id; [`correlate`] places the crash on the trace
//! timeline.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod correlate;
pub mod error;
pub mod format;
pub mod loader;
pub mod writer;

pub use correlate::{Correlation, correlate, nearest_index};
pub use error::{DumpError, DumpResult};
pub use format::{MemoryRange, Minidump, ModuleRecord, StreamKind, SystemInfo, ThreadRecord};
pub use loader::{load, parse};
pub use writer::encode;
