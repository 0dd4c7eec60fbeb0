//! Reconstructed state.
//!
//! The state at event `i` is the fold of every event up to and including
//! `i`: each snapshot kind keeps the last value written at or before `i`.
//! Folding forward from any earlier fold gives the same result as folding
//! from the start, which is what makes checkpoints valid.

use crate::error::{ReplayError, ReplayResult};
use indexmap::IndexMap;
use retrace_core::{CancelToken, MonoTime, WallTime};
use retrace_dump::ModuleRecord;
use retrace_log::{CategoryMask, EventHeader, Payload, Section};
use retrace_store::TraceStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Last stack snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSnapshot {
    /// Event that carried it
    pub index: u64,
    /// Thread the stack belongs to
    pub tid: u32,
    /// Stack pointer
    pub sp: u64,
    /// Bytes from `sp` upward
    pub bytes: Vec<u8>,
}

/// Last heap snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSnapshot {
    /// Event that carried it
    pub index: u64,
    /// Heap start
    pub addr: u64,
    /// Captured bytes
    pub bytes: Vec<u8>,
}

/// Last value of a watched global
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalValue {
    /// Event that carried it
    pub index: u64,
    /// Address read
    pub addr: u64,
    /// Captured bytes
    pub bytes: Vec<u8>,
}

/// Crash merged in from a correlated minidump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    /// Nearest trace event
    pub index: Option<u64>,
    /// Crash time
    pub crash_time: WallTime,
    /// Faulting thread
    pub fault_tid: u32,
    /// Terminating signal
    pub signal: u32,
    /// Faulting address
    pub fault_addr: u64,
    /// Register block of the faulting thread
    pub registers: Vec<u8>,
    /// Loaded modules
    pub modules: Vec<ModuleRecord>,
}

/// Program state reconstructed at one trace position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedState {
    /// Last event folded in; `None` for the empty state
    pub position: Option<u64>,
    /// Its timestamp
    pub timestamp: Option<MonoTime>,
    /// Watched globals in first-seen order
    pub globals: IndexMap<String, GlobalValue>,
    /// Last stack snapshot
    pub stack: Option<StackSnapshot>,
    /// Last heap snapshot
    pub heap: Option<HeapSnapshot>,
    /// Last register block per thread
    pub registers: BTreeMap<u32, Vec<u8>>,
    /// Active threads
    pub threads: BTreeSet<u32>,
    /// Crash, once the position reaches it
    pub crash: Option<CrashRecord>,
}

impl ReconstructedState {
    /// Empty state, before any event
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in
    pub fn apply(&mut self, header: &EventHeader, payload: &Payload) {
        let index = header.index;
        self.position = Some(index);
        self.timestamp = Some(header.timestamp);
        self.threads.insert(header.thread_id);
        for section in payload {
            match section {
                Section::Stack { tid, sp, bytes } => {
                    self.stack = Some(StackSnapshot {
                        index,
                        tid: *tid,
                        sp: *sp,
                        bytes: bytes.clone(),
                    });
                }
                Section::Heap { addr, bytes } => {
                    self.heap = Some(HeapSnapshot {
                        index,
                        addr: *addr,
                        bytes: bytes.clone(),
                    });
                }
                Section::Global { name, addr, bytes } => {
                    self.globals.insert(
                        name.clone(),
                        GlobalValue {
                            index,
                            addr: *addr,
                            bytes: bytes.clone(),
                        },
                    );
                }
                Section::Registers { tid, bytes } => {
                    self.registers.insert(*tid, bytes.clone());
                }
                Section::Threads { tids } => {
                    self.threads = tids.iter().copied().collect();
                }
                Section::Args { .. }
                | Section::Memory { .. }
                | Section::SignalInfo { .. }
                | Section::Message { .. } => {}
            }
        }
    }

    /// Watched global by its watch expression
    #[must_use]
    pub fn global(&self, name: &str) -> Option<&GlobalValue> {
        self.globals.get(name)
    }
}

/// Fold events in `range` into `state`, checking `cancel` between events
///
/// # Errors
///
/// Returns `Cancelled`, a read error, or `Payload` for an undecodable payload
pub(crate) fn fold(
    store: &TraceStore,
    state: &mut ReconstructedState,
    range: Range<u64>,
    cancel: &CancelToken,
) -> ReplayResult<()> {
    for event in store.iter(range, CategoryMask::ALL).with_cancel(cancel.clone()) {
        let event = event?;
        let payload = Payload::decode(&event.payload).map_err(|e| ReplayError::Payload {
            index: event.header.index,
            reason: e.to_string(),
        })?;
        state.apply(&event.header, &payload);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_log::Category;

    fn header(index: u64, tid: u32) -> EventHeader {
        EventHeader::new(index, MonoTime::from_nanos(index * 10), Category::Syscall, 0)
            .with_thread(tid, 1)
    }

    #[test]
    fn test_last_writer_wins() {
        let mut state = ReconstructedState::new();
        state.apply(
            &header(0, 1),
            &Payload::from(vec![
                Section::Global {
                    name: "g+4".to_string(),
                    addr: 0x10,
                    bytes: vec![1, 0, 0, 0],
                },
                Section::Heap {
                    addr: 0x100,
                    bytes: vec![9],
                },
            ]),
        );
        state.apply(
            &header(1, 2),
            &Payload::from(vec![Section::Global {
                name: "g+4".to_string(),
                addr: 0x10,
                bytes: vec![2, 0, 0, 0],
            }]),
        );
        assert_eq!(state.position, Some(1));
        assert_eq!(state.global("g+4").unwrap().bytes, vec![2, 0, 0, 0]);
        assert_eq!(state.global("g+4").unwrap().index, 1);
        assert_eq!(state.heap.as_ref().unwrap().index, 0);
        assert_eq!(state.threads, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_thread_list_replaces_set() {
        let mut state = ReconstructedState::new();
        state.apply(&header(0, 1), &Payload::new());
        state.apply(&header(1, 2), &Payload::new());
        state.apply(
            &header(2, 3),
            &Payload::from(vec![Section::Threads { tids: vec![3, 4] }]),
        );
        assert_eq!(state.threads, BTreeSet::from([3, 4]));
    }

    #[test]
    fn test_exited_thread_leaves_set() {
        let mut state = ReconstructedState::new();
        state.apply(
            &EventHeader::new(0, MonoTime::from_nanos(10), Category::Syscall, 39).with_thread(71, 2),
            &Payload::from(vec![Section::Threads { tids: vec![70, 71] }]),
        );
        assert_eq!(state.threads, BTreeSet::from([70, 71]));
        state.apply(
            &EventHeader::new(1, MonoTime::from_nanos(20), Category::Syscall, 39).with_thread(70, 1),
            &Payload::from(vec![Section::Threads { tids: vec![70] }]),
        );
        assert_eq!(state.threads, BTreeSet::from([70]));
        state.apply(&header(2, 70), &Payload::new());
        assert_eq!(state.threads, BTreeSet::from([70]));
    }

    #[test]
    fn test_stack_keeps_latest() {
        let mut state = ReconstructedState::new();
        for i in 0..3 {
            state.apply(
                &header(i, 1),
                &Payload::from(vec![Section::Stack {
                    tid: 1,
                    sp: 0x7000 - i,
                    bytes: vec![i as u8; 4],
                }]),
            );
        }
        let stack = state.stack.unwrap();
        assert_eq!(stack.index, 2);
        assert_eq!(stack.sp, 0x7000 - 2);
    }

    #[test]
    fn test_state_serializes() {
        let mut state = ReconstructedState::new();
        state.apply(
            &header(3, 9),
            &Payload::from(vec![Section::Global {
                name: "flag+1".to_string(),
                addr: 0x20,
                bytes: vec![1],
            }]),
        );
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["position"], 3);
        assert_eq!(json["globals"]["flag+1"]["bytes"], serde_json::json!([1]));
        let back: ReconstructedState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
