//! Typed payload sections.
//!
//! On disk a payload is a canonically encoded list of sections. An empty
//! list is stored as a zero-length blob so events without captured data cost
//! nothing in the payload file.

use crate::encoding::{CanonicalDecode, CanonicalEncode};
use retrace_core::CoreResult;
use serde::{Deserialize, Serialize};

/// One piece of captured data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    /// Raw syscall argument words
    Args {
        /// Register-order argument values
        words: Vec<u64>,
    },
    /// Buffer referenced by a syscall argument
    Memory {
        /// Start address in the target
        addr: u64,
        /// Captured bytes
        bytes: Vec<u8>,
    },
    /// Top of a thread's stack
    Stack {
        /// Thread the stack belongs to
        tid: u32,
        /// Stack pointer at capture
        sp: u64,
        /// Bytes from `sp` upward
        bytes: Vec<u8>,
    },
    /// Start of the heap mapping
    Heap {
        /// Heap start address
        addr: u64,
        /// Captured bytes
        bytes: Vec<u8>,
    },
    /// Watched global variable
    Global {
        /// Watch expression as configured
        name: String,
        /// Address read from
        addr: u64,
        /// Captured bytes
        bytes: Vec<u8>,
    },
    /// General purpose register file
    Registers {
        /// Thread the registers belong to
        tid: u32,
        /// Raw register block
        bytes: Vec<u8>,
    },
    /// Live traced thread set
    Threads {
        /// Thread ids, ascending
        tids: Vec<u32>,
    },
    /// Signal details
    SignalInfo {
        /// Signal number
        signo: i32,
        /// `si_code`
        code: i32,
        /// Faulting address for SIGSEGV-like signals
        fault_addr: u64,
    },
    /// X11 event struct or D-Bus message bytes
    Message {
        /// Raw bytes from the interceptor
        bytes: Vec<u8>,
    },
}

impl Section {
    /// Short kind name for display
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Args { .. } => "args",
            Self::Memory { .. } => "memory",
            Self::Stack { .. } => "stack",
            Self::Heap { .. } => "heap",
            Self::Global { .. } => "global",
            Self::Registers { .. } => "registers",
            Self::Threads { .. } => "threads",
            Self::SignalInfo { .. } => "siginfo",
            Self::Message { .. } => "message",
        }
    }

    /// Captured byte buffer, if the section carries one
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Memory { bytes, .. }
            | Self::Stack { bytes, .. }
            | Self::Heap { bytes, .. }
            | Self::Global { bytes, .. }
            | Self::Registers { bytes, .. }
            | Self::Message { bytes } => Some(bytes),
            Self::Args { .. } | Self::Threads { .. } | Self::SignalInfo { .. } => None,
        }
    }

    /// Cut the byte buffer down to `ceiling` bytes
    pub fn truncate(&mut self, ceiling: usize) {
        match self {
            Self::Memory { bytes, .. }
            | Self::Stack { bytes, .. }
            | Self::Heap { bytes, .. }
            | Self::Global { bytes, .. }
            | Self::Registers { bytes, .. }
            | Self::Message { bytes } => bytes.truncate(ceiling),
            Self::Args { .. } | Self::Threads { .. } | Self::SignalInfo { .. } => {}
        }
    }
}

/// Decoded payload: an ordered list of sections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    sections: Vec<Section>,
}

impl CanonicalEncode for Payload {}

impl Payload {
    /// Empty payload
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section
    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }

    /// Append a section with its buffer cut to `ceiling`; a zero ceiling
    /// drops buffer sections entirely
    pub fn push_bounded(&mut self, mut section: Section, ceiling: usize) {
        if ceiling == 0 && section.bytes().is_some() {
            return;
        }
        section.truncate(ceiling);
        self.sections.push(section);
    }

    /// Sections in capture order
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Iterate sections
    pub fn iter(&self) -> std::slice::Iter<'_, Section> {
        self.sections.iter()
    }

    /// Number of sections
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether no section was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Encode; an empty payload encodes to an empty blob
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        if self.sections.is_empty() {
            return Ok(Vec::new());
        }
        Ok(CanonicalEncode::encode(self)?)
    }

    /// Decode a blob produced by [`Self::encode`]
    ///
    /// # Errors
    ///
    /// Returns error if the blob is not a valid section list
    pub fn decode(blob: &[u8]) -> CoreResult<Self> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        Ok(<Self as CanonicalDecode<'_>>::decode(blob)?)
    }
}

impl From<Vec<Section>> for Payload {
    fn from(sections: Vec<Section>) -> Self {
        Self { sections }
    }
}

impl IntoIterator for Payload {
    type Item = Section;
    type IntoIter = std::vec::IntoIter<Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.into_iter()
    }
}

impl<'a> IntoIterator for &'a Payload {
    type Item = &'a Section;
    type IntoIter = std::slice::Iter<'a, Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}
