//! retrace Recorder
//!
//! Attaches to a target, observes system calls and signals through a
//! [`Backend`] and X11/D-Bus events through preloaded interceptors, applies
//! the compiled filter at capture time and appends the surviving events to
//! a trace store in timestamp order. A fatal signal leaves a minidump next
//! to the trace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod crash;
mod driver;
pub mod error;
pub mod gate;
pub mod preload;
pub mod procfs;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod recorder;
pub mod sequencer;
pub mod symbols;
pub mod tracer;

pub use capture::{CaptureContext, Detail, Observation, capture};
pub use error::{AttachError, RecorderError, RecorderResult};
pub use gate::{Gate, SharedGate};
pub use preload::{EVENT_SOCKET_ENV, Envelope, PreloadListener};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::{PtraceBackend, PtraceTracer};
pub use recorder::{Recorder, RecorderNotice, Recording, StopHandle};
pub use sequencer::{Captured, Sequencer};
pub use symbols::SymbolTable;
pub use tracer::{Backend, Inspector, ScriptedBackend, ScriptedTracer, Stop, Target, TracePlan, Tracer};
