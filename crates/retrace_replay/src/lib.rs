//! Retrace replay controller
//!
//! Random-access navigation over a recorded session: cursor stepping,
//! state reconstruction at any event, binary and linear seeks, restricted
//! views from the query language, and postmortem merge of a minidump.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod controller;
pub mod describe;
pub mod error;
pub mod postmortem;
pub mod query;
pub mod seek;
pub mod state;
pub mod view;

pub use checkpoint::{CHECKPOINT_INTERVAL, Checkpoints};
pub use controller::ReplayController;
pub use describe::describe;
pub use error::{QueryError, ReplayError, ReplayResult};
pub use postmortem::Postmortem;
pub use query::{Query, Selector};
pub use seek::{CmpOp, EventFn, Predicate, SeekOutcome, seek};
pub use state::{CrashRecord, GlobalValue, HeapSnapshot, ReconstructedState, StackSnapshot};
pub use view::View;
