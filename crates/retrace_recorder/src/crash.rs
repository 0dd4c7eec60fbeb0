//! Crash snapshots.
//!
//! Taken at the signal-delivery stop of a fatal signal, while the faulting
//! thread still holds its state. The snapshot only becomes the session's
//! minidump if the signal then kills the process.

use crate::procfs;
use crate::tracer::Inspector;
use retrace_core::{ClockOffset, MonoTime, SessionId};
use retrace_dump::{MemoryRange, Minidump, SystemInfo, ThreadRecord};
use tracing::info;

/// Stack bytes captured per thread
pub const CRASH_STACK_BYTES: usize = 16 * 1024;

/// Bytes captured around the fault address and at the heap start
pub const CRASH_MEMORY_BYTES: usize = 256;

/// Signals whose default action dumps core
pub const FATAL_SIGNALS: [i32; 7] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGSYS,
    libc::SIGTRAP,
];

/// Whether `signo` ends the process with a core dump by default
#[must_use]
pub fn is_fatal(signo: i32) -> bool {
    FATAL_SIGNALS.contains(&signo)
}

/// Details of the faulting stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Faulting thread
    pub tid: u32,
    /// Signal about to be delivered
    pub signo: i32,
    /// `si_addr`
    pub fault_addr: u64,
    /// Stop time
    pub at: MonoTime,
}

fn host_system() -> SystemInfo {
    SystemInfo {
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX)),
        uname: procfs::uname(),
    }
}

fn thread_record(inspector: &dyn Inspector, tid: u32) -> ThreadRecord {
    let sp = inspector.stack_pointer(tid).unwrap_or(0);
    ThreadRecord {
        tid,
        registers: inspector.registers(tid).unwrap_or_default(),
        stack_start: sp,
        stack: inspector
            .read_memory(sp, CRASH_STACK_BYTES)
            .unwrap_or_default(),
    }
}

/// Build a minidump from a stopped target
#[must_use]
pub fn snapshot(
    inspector: &dyn Inspector,
    session_id: SessionId,
    offset: ClockOffset,
    fault: Fault,
) -> Minidump {
    let mut dump = Minidump::new(
        session_id,
        offset.to_wall(fault.at),
        fault.tid,
        u32::try_from(fault.signo).unwrap_or(0),
    );
    dump.fault_addr = fault.fault_addr;
    dump.system = host_system();

    dump.threads.push(thread_record(inspector, fault.tid));
    for tid in inspector.threads() {
        if tid != fault.tid {
            dump.threads.push(thread_record(inspector, tid));
        }
    }
    dump.modules = inspector.modules();

    let half = (CRASH_MEMORY_BYTES / 2) as u64;
    let around = fault.fault_addr.saturating_sub(half);
    if fault.fault_addr != 0 {
        if let Some(bytes) = inspector.read_memory(around, CRASH_MEMORY_BYTES) {
            dump.memory.push(MemoryRange { start: around, bytes });
        }
    }
    if let Some(heap) = inspector.heap_start() {
        if let Some(bytes) = inspector.read_memory(heap, CRASH_MEMORY_BYTES) {
            dump.memory.push(MemoryRange { start: heap, bytes });
        }
    }
    info!(
        tid = fault.tid,
        signo = fault.signo,
        threads = dump.threads.len(),
        modules = dump.modules.len(),
        "Captured crash snapshot"
    );
    dump
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::ScriptedTracer;
    use retrace_core::WallTime;
    use retrace_dump::ModuleRecord;

    #[test]
    fn test_snapshot_puts_faulting_thread_first() {
        let tracer = ScriptedTracer::new(10, "/bin/demo")
            .thread(10, vec![1; 216], 0x7000)
            .thread(11, vec![2; 216], 0x8000)
            .memory(0x7000, vec![0xAA; 64])
            .memory(0x4000, vec![0xBB; 512])
            .heap(0x4000)
            .module(ModuleRecord {
                base: 0x1000,
                size: 0x1000,
                path: "/bin/demo".into(),
            });
        let offset = ClockOffset::from_wall(WallTime::from_unix_nanos(1_000));
        let fault = Fault {
            tid: 11,
            signo: libc::SIGSEGV,
            fault_addr: 0x4100,
            at: MonoTime::from_nanos(500),
        };
        let dump = snapshot(&tracer, SessionId::nil(), offset, fault);

        assert_eq!(dump.crash_time, WallTime::from_unix_nanos(1_500));
        assert_eq!(dump.threads[0].tid, 11);
        assert_eq!(dump.threads[1].stack.len(), 64);
        assert!(dump.threads[0].stack.is_empty());
        assert_eq!(dump.modules.len(), 1);
        assert_eq!(dump.memory.len(), 2);
        assert_eq!(dump.memory[0].start, 0x4100 - 128);
        assert_eq!(dump.signal, 11);
    }

    #[test]
    fn test_fatal_signals() {
        assert!(is_fatal(libc::SIGSEGV));
        assert!(!is_fatal(libc::SIGCHLD));
        assert!(!is_fatal(libc::SIGKILL));
    }
}
