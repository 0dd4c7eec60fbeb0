//! retrace Event Model
//!
//! The atomic recorded unit ([`Event`]), its category tag, the typed payload
//! sections carried inside the opaque payload blob, and the naming tables
//! used to describe syscalls, signals, X11 events and D-Bus messages.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod encoding;
pub mod event;
pub mod names;
pub mod payload;

pub use cursor::{Cursor, Direction};
pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError, EncodeError};
pub use event::{Category, CategoryMask, Event, EventHeader};
pub use names::{
    SyscallGroup, dbus_name, errno_name, event_name, signal_name, signal_number, syscall_groups,
    syscall_name, syscall_number, x11_name,
};
pub use payload::{Payload, Section};
