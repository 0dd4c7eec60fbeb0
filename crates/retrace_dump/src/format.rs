//! Minidump format v1.
//!
//! All integers little-endian.
//!
//! ```text
//! header (48 bytes)
//!   0 magic "RTMD"   4 u16 version   6 u16 stream count
//!   8 [u8;16] session id            24 i64 crash wall ns
//!  32 u32 fault tid 36 u32 signal   40 u64 fault address
//! directory, one 24-byte record per stream
//!   u32 kind, u32 reserved, u64 offset, u64 length
//! streams
//!   1 system info  u16 len + arch, u32 cpus, u16 len + uname
//!   2 thread list  u32 count, then per thread: u32 tid, u32 reserved,
//!                  u32 len + registers, u64 stack start, u32 len + stack
//!   3 module list  u32 count, then per module: u64 base, u64 size, u16 len + path
//!   4 memory list  u32 count, then per range: u64 start, u32 len + bytes
//! ```

use retrace_core::{SessionId, WallTime};
use serde::{Deserialize, Serialize};

/// File magic
pub const MAGIC: [u8; 4] = *b"RTMD";
/// Header length
pub const HEADER_SIZE: usize = 48;
/// Directory record length
pub const DIRECTORY_ENTRY_SIZE: usize = 24;

/// Stream kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StreamKind {
    /// Architecture, CPU count, uname
    SystemInfo = 1,
    /// Thread registers and stacks
    ThreadList = 2,
    /// Loaded modules
    ModuleList = 3,
    /// Captured memory ranges
    MemoryList = 4,
}

impl StreamKind {
    /// Decode a directory kind
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::SystemInfo),
            2 => Some(Self::ThreadList),
            3 => Some(Self::ModuleList),
            4 => Some(Self::MemoryList),
            _ => None,
        }
    }
}

/// Host description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// CPU architecture, e.g. `x86_64`
    pub arch: String,
    /// Online CPUs
    pub cpu_count: u32,
    /// `uname` line
    pub uname: String,
}

/// One thread at crash time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread id
    pub tid: u32,
    /// Raw general purpose register block
    pub registers: Vec<u8>,
    /// Address of the first stack byte captured
    pub stack_start: u64,
    /// Stack bytes from `stack_start` upward
    pub stack: Vec<u8>,
}

/// One loaded module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Load address
    pub base: u64,
    /// Mapped size
    pub size: u64,
    /// File path
    pub path: String,
}

impl ModuleRecord {
    /// Whether `addr` falls inside the module
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// One captured memory range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    /// Start address
    pub start: u64,
    /// Captured bytes
    pub bytes: Vec<u8>,
}

/// A decoded minidump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minidump {
    /// Session this dump belongs to
    pub session_id: SessionId,
    /// Wall time of the crash
    pub crash_time: WallTime,
    /// Faulting thread
    pub fault_tid: u32,
    /// Terminating signal
    pub signal: u32,
    /// Faulting address, 0 when not applicable
    pub fault_addr: u64,
    /// Host description
    pub system: SystemInfo,
    /// Threads, faulting thread first
    pub threads: Vec<ThreadRecord>,
    /// Loaded modules
    pub modules: Vec<ModuleRecord>,
    /// Extra memory ranges, e.g. the heap start
    pub memory: Vec<MemoryRange>,
}

impl Minidump {
    /// Empty dump for a crash
    #[must_use]
    pub fn new(session_id: SessionId, crash_time: WallTime, fault_tid: u32, signal: u32) -> Self {
        Self {
            session_id,
            crash_time,
            fault_tid,
            signal,
            fault_addr: 0,
            system: SystemInfo::default(),
            threads: Vec::new(),
            modules: Vec::new(),
            memory: Vec::new(),
        }
    }

    /// Record of the faulting thread
    #[must_use]
    pub fn fault_thread(&self) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.tid == self.fault_tid)
    }

    /// Module containing `addr`
    #[must_use]
    pub fn module_at(&self, addr: u64) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_contains() {
        let m = ModuleRecord {
            base: 0x1000,
            size: 0x100,
            path: "/lib/x.so".into(),
        };
        assert!(m.contains(0x1000));
        assert!(m.contains(0x10ff));
        assert!(!m.contains(0x1100));
        assert!(!m.contains(0xfff));
    }

    #[test]
    fn test_fault_thread_lookup() {
        let mut dump = Minidump::new(SessionId::nil(), WallTime::from_unix_nanos(0), 7, 11);
        dump.threads.push(ThreadRecord {
            tid: 7,
            registers: vec![0; 8],
            stack_start: 0,
            stack: Vec::new(),
        });
        assert_eq!(dump.fault_thread().map(|t| t.tid), Some(7));
        assert!(dump.module_at(0).is_none());
        assert_eq!(StreamKind::from_u32(3), Some(StreamKind::ModuleList));
        assert_eq!(StreamKind::from_u32(0), None);
    }
}
