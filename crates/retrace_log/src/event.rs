//! Event records.
//!
//! An [`Event`] is a fixed-width [`EventHeader`] plus an opaque payload blob.
//! The header is what the trace index stores; the payload lives in a side
//! file and decodes to [`crate::Payload`] on demand.

use crate::payload::Payload;
use retrace_core::{CoreResult, MonoTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of observable event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Category {
    /// System call, captured at exit
    Syscall = 0,
    /// Signal delivered to a traced thread
    Signal = 1,
    /// X11 event dispatched by the client library
    X11 = 2,
    /// D-Bus message sent or received
    DBus = 3,
}

impl Category {
    /// Every category in tag order
    pub const ALL: [Category; 4] = [Self::Syscall, Self::Signal, Self::X11, Self::DBus];

    /// On-disk tag
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode an on-disk tag
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Syscall),
            1 => Some(Self::Signal),
            2 => Some(Self::X11),
            3 => Some(Self::DBus),
            _ => None,
        }
    }

    /// Position in [`Self::ALL`], used to index per-category tables
    #[must_use]
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Lowercase name used in configs and envelopes
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Syscall => "syscall",
            Self::Signal => "signal",
            Self::X11 => "x11",
            Self::DBus => "dbus",
        }
    }

    /// Parse a lowercase name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of categories, one bit per [`Category`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryMask(u8);

impl CategoryMask {
    /// No category
    pub const NONE: Self = Self(0);

    /// Every category
    pub const ALL: Self = Self(0b1111);

    /// Mask with a single category
    #[must_use]
    pub const fn only(category: Category) -> Self {
        Self(1 << category.as_u8())
    }

    /// Mask plus one more category
    #[must_use]
    pub const fn with(self, category: Category) -> Self {
        Self(self.0 | (1 << category.as_u8()))
    }

    /// Mask minus one category
    #[must_use]
    pub const fn without(self, category: Category) -> Self {
        Self(self.0 & !(1 << category.as_u8()))
    }

    /// Whether the category is in the set
    #[must_use]
    pub const fn contains(self, category: Category) -> bool {
        self.0 & (1 << category.as_u8()) != 0
    }

    /// Whether the set is empty
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Categories in the set, in tag order
    pub fn iter(self) -> impl Iterator<Item = Category> {
        Category::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl Default for CategoryMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromIterator<Category> for CategoryMask {
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl From<Category> for CategoryMask {
    fn from(category: Category) -> Self {
        Self::only(category)
    }
}

/// Fixed-width part of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHeader {
    /// Position in the trace, gap-free from zero
    pub index: u64,
    /// Monotonic ns since recording start
    pub timestamp: MonoTime,
    /// Event kind
    pub category: Category,
    /// Syscall number, signal number, X11 event type or D-Bus message type
    pub code: u32,
    /// Originating thread
    pub thread_id: u32,
    /// Live traced threads at capture
    pub thread_count: u16,
    /// Nanoseconds the event took to resolve
    pub duration: u64,
    /// Return or status code
    pub result: i64,
}

impl EventHeader {
    /// Header with zeroed fields for a category
    #[must_use]
    pub fn new(index: u64, timestamp: MonoTime, category: Category, code: u32) -> Self {
        Self {
            index,
            timestamp,
            category,
            code,
            thread_id: 0,
            thread_count: 1,
            duration: 0,
            result: 0,
        }
    }

    /// Builder method: originating thread
    #[must_use]
    pub fn with_thread(mut self, thread_id: u32, thread_count: u16) -> Self {
        self.thread_id = thread_id;
        self.thread_count = thread_count;
        self
    }

    /// Builder method: duration and result
    #[must_use]
    pub fn with_outcome(mut self, duration: u64, result: i64) -> Self {
        self.duration = duration;
        self.result = result;
        self
    }

    /// Time the event started resolving
    #[must_use]
    pub fn started_at(&self) -> MonoTime {
        MonoTime::from_nanos(self.timestamp.as_nanos().saturating_sub(self.duration))
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Fixed-width fields
    pub header: EventHeader,
    /// Encoded [`Payload`]; empty when nothing was captured
    pub payload: Vec<u8>,
}

impl Event {
    /// Create an event from a header and encoded payload
    #[must_use]
    pub fn new(header: EventHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Create an event by encoding typed sections
    ///
    /// # Errors
    ///
    /// Returns error if the sections cannot be encoded
    pub fn with_sections(header: EventHeader, payload: &Payload) -> CoreResult<Self> {
        Ok(Self {
            header,
            payload: payload.encode()?,
        })
    }

    /// Trace position
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.header.index
    }

    /// Event kind
    #[must_use]
    pub const fn category(&self) -> Category {
        self.header.category
    }

    /// Monotonic timestamp
    #[must_use]
    pub const fn timestamp(&self) -> MonoTime {
        self.header.timestamp
    }

    /// Decode the payload sections
    ///
    /// # Errors
    ///
    /// Returns error if the blob is not a valid section list
    pub fn sections(&self) -> CoreResult<Payload> {
        Payload::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Section;

    #[test]
    fn test_category_tag_roundtrip() {
        for c in Category::ALL {
            assert_eq!(Category::from_u8(c.as_u8()), Some(c));
            assert_eq!(Category::parse(c.name()), Some(c));
        }
        assert_eq!(Category::from_u8(4), None);
        assert_eq!(Category::parse("x12"), None);
    }

    #[test]
    fn test_mask_ops() {
        let mask = CategoryMask::only(Category::Syscall).with(Category::DBus);
        assert!(mask.contains(Category::Syscall));
        assert!(mask.contains(Category::DBus));
        assert!(!mask.contains(Category::Signal));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![Category::Syscall, Category::DBus]);
        assert!(mask.without(Category::Syscall).without(Category::DBus).is_empty());
        assert_eq!(CategoryMask::default(), CategoryMask::ALL);
    }

    #[test]
    fn test_mask_from_iter() {
        let mask: CategoryMask = [Category::X11, Category::Signal].into_iter().collect();
        assert_eq!(mask, CategoryMask::only(Category::Signal).with(Category::X11));
    }

    #[test]
    fn test_started_at_saturates() {
        let h = EventHeader::new(0, MonoTime::from_nanos(100), Category::Syscall, 0)
            .with_outcome(250, 0);
        assert_eq!(h.started_at(), MonoTime::zero());

        let h = h.with_outcome(40, 0);
        assert_eq!(h.started_at(), MonoTime::from_nanos(60));
    }

    #[test]
    fn test_event_sections() {
        let header = EventHeader::new(3, MonoTime::from_nanos(9), Category::Syscall, 1)
            .with_thread(77, 2)
            .with_outcome(5, 12);
        let payload = Payload::from(vec![Section::Args { words: vec![1, 2, 3] }]);
        let event = Event::with_sections(header, &payload).unwrap();

        assert_eq!(event.index(), 3);
        assert_eq!(event.category(), Category::Syscall);
        assert_eq!(event.sections().unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_is_empty_blob() {
        let header = EventHeader::new(0, MonoTime::zero(), Category::Signal, 17);
        let event = Event::with_sections(header, &Payload::default()).unwrap();
        assert!(event.payload.is_empty());
        assert!(event.sections().unwrap().is_empty());
    }
}
