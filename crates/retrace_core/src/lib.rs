//! retrace Core Types
//!
//! Pure types shared by every retrace crate: the error taxonomy, the
//! recording clocks, session identifiers, payload digests, format versions
//! and the cooperative cancellation token used by long scans.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod hash;
pub mod id;
pub mod time;
pub mod version;

// Re-exports
pub use cancel::CancelToken;
pub use error::{AttachFailure, CoreError, CoreResult};
pub use hash::Digest;
pub use id::SessionId;
pub use time::{ClockOffset, MonoClock, MonoTime, WallTime};
pub use version::{FormatVersion, VersionError};
