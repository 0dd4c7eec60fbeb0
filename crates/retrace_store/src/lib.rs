//! retrace Trace Store
//!
//! Append-only, crash-safe storage for one recording session:
//!
//! - `session.meta` - session metadata with a checksummed fixed layout
//! - `events.idx` - one 64-byte entry per event
//! - `payload.bin` - concatenated payload blobs
//! - `crash.dmp` - optional minidump
//!
//! One writer appends; any number of readers see the events committed
//! before their iterator was created. Opening a session whose writer died
//! truncates the torn tail and marks the session `Corrupt`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod index;
pub mod iter;
pub mod layout;
pub mod meta;
pub mod order;
pub mod session;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use index::{ENTRY_SIZE, IndexEntry};
pub use iter::{EventIter, HeaderIter};
pub use layout::TraceDir;
pub use meta::{SessionMeta, SessionStatus};
pub use order::{ORDER_CACHE_CAPACITY, OrderKey, OrderQuery, sort_headers};
pub use session::{SessionSummary, delete_session, list_sessions};
pub use store::{CreateOptions, TraceStore};
