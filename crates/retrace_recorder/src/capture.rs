//! Payload capture.
//!
//! One capture function per category, looked up by [`Category::slot`].
//! Category sections come first, then the context snapshots every event
//! carries when their ceilings allow: stack top, heap start and watched
//! globals.

use crate::sequencer::Captured;
use crate::tracer::Inspector;
use retrace_core::{CoreResult, MonoTime};
use retrace_filter::{CompiledFilter, WatchVar};
use retrace_log::{Category, Payload, Section};
use tracing::trace;

/// What a producer saw, before payload capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation<'a> {
    /// Event kind
    pub category: Category,
    /// Category-specific code
    pub code: u32,
    /// Originating thread
    pub tid: u32,
    /// Live traced threads
    pub thread_count: u16,
    /// Completion time
    pub at: MonoTime,
    /// Nanoseconds to resolve
    pub duration: u64,
    /// Return or status code
    pub result: i64,
    /// Category-specific raw data
    pub detail: Detail<'a>,
}

/// Raw data attached to an observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detail<'a> {
    /// Syscall argument registers
    Syscall {
        /// Arguments in call order
        args: [u64; 6],
    },
    /// Signal details
    Signal {
        /// Signal number
        signo: i32,
        /// `si_code`
        code: i32,
        /// Faulting address
        fault_addr: u64,
    },
    /// Message bytes from a preload interceptor
    Message(&'a [u8]),
}

/// Capture inputs shared by every category
pub struct CaptureContext<'a> {
    /// Ceilings and watch list
    pub filter: &'a CompiledFilter,
    /// Stopped target, absent for events that arrive from outside a stop
    pub inspector: Option<&'a dyn Inspector>,
    /// Threads started or exited since the last kept event
    pub threads_changed: bool,
}

type CaptureFn = fn(&CaptureContext<'_>, &Observation<'_>, &mut Payload);

const CAPTURE: [CaptureFn; 4] = [syscall_sections, signal_sections, message_sections, message_sections];

/// Buffer argument of a syscall
#[derive(Debug, Clone, Copy)]
enum Buffer {
    /// NUL-terminated string at argument `n`
    Str(usize),
    /// Buffer at argument `n`, length from argument `len`
    In(usize, usize),
    /// Buffer at argument `n` filled by the kernel, length from the result
    Out(usize),
}

fn buffers(nr: u32) -> &'static [Buffer] {
    use Buffer::{In, Out, Str};
    match nr {
        0 | 17 => &[Out(1)],              // read, pread64
        1 | 18 => &[In(1, 2)],            // write, pwrite64
        2 | 4 | 6 | 21 | 59 | 80 | 83 | 84 | 87 | 90 | 92 => &[Str(0)],
        82 | 86 | 88 => &[Str(0), Str(1)], // rename, link, symlink
        42 | 49 => &[In(1, 2)],           // connect, bind
        44 => &[In(1, 2)],                // sendto
        45 => &[Out(1)],                  // recvfrom
        89 => &[Str(0), Out(1)],          // readlink
        257 | 262 | 263 | 269 => &[Str(1)],
        _ => &[],
    }
}

fn syscall_sections(ctx: &CaptureContext<'_>, obs: &Observation<'_>, payload: &mut Payload) {
    let Detail::Syscall { args } = &obs.detail else {
        return;
    };
    let ceiling = ctx.filter.param_ceiling;
    if ceiling == 0 {
        return;
    }
    let words = args.len().min(ceiling / 8);
    if words > 0 {
        payload.push(Section::Args {
            words: args[..words].to_vec(),
        });
    }
    let Some(inspector) = ctx.inspector else {
        return;
    };
    for buffer in buffers(obs.code) {
        let (addr, bytes) = match *buffer {
            Buffer::Str(n) => (args[n], inspector.read_c_string(args[n], ceiling)),
            Buffer::In(n, len) => {
                let len = usize::try_from(args[len]).unwrap_or(usize::MAX).min(ceiling);
                (args[n], inspector.read_memory(args[n], len))
            }
            Buffer::Out(n) => {
                if obs.result <= 0 {
                    continue;
                }
                let len = usize::try_from(obs.result).unwrap_or(usize::MAX).min(ceiling);
                (args[n], inspector.read_memory(args[n], len))
            }
        };
        if addr == 0 {
            continue;
        }
        if let Some(bytes) = bytes {
            payload.push_bounded(Section::Memory { addr, bytes }, ceiling);
        }
    }
}

fn signal_sections(ctx: &CaptureContext<'_>, obs: &Observation<'_>, payload: &mut Payload) {
    let Detail::Signal {
        signo,
        code,
        fault_addr,
    } = obs.detail
    else {
        return;
    };
    payload.push(Section::SignalInfo {
        signo,
        code,
        fault_addr,
    });
    if let Some(inspector) = ctx.inspector {
        if let Some(bytes) = inspector.registers(obs.tid) {
            payload.push(Section::Registers { tid: obs.tid, bytes });
        }
        payload.push(Section::Threads {
            tids: inspector.threads(),
        });
    }
}

fn message_sections(ctx: &CaptureContext<'_>, obs: &Observation<'_>, payload: &mut Payload) {
    if let Detail::Message(bytes) = obs.detail {
        payload.push_bounded(
            Section::Message {
                bytes: bytes.to_vec(),
            },
            ctx.filter.param_ceiling,
        );
    }
}

// Signal capture already lists threads
fn census_section(ctx: &CaptureContext<'_>, payload: &mut Payload) {
    let Some(inspector) = ctx.inspector else {
        return;
    };
    if payload.iter().any(|s| matches!(s, Section::Threads { .. })) {
        return;
    }
    payload.push(Section::Threads {
        tids: inspector.threads(),
    });
}

fn read_global(inspector: &dyn Inspector, watch: &WatchVar) -> Option<Section> {
    let symbol = inspector.symbol(&watch.name)?;
    let addr = if watch.deref {
        let raw = inspector.read_memory(symbol, 8)?;
        u64::from_le_bytes(raw.get(..8)?.try_into().ok()?)
    } else {
        symbol
    };
    let bytes = inspector.read_memory(addr, watch.size as usize)?;
    Some(Section::Global {
        name: watch.to_string(),
        addr,
        bytes,
    })
}

fn context_sections(ctx: &CaptureContext<'_>, obs: &Observation<'_>, payload: &mut Payload) {
    let Some(inspector) = ctx.inspector else {
        return;
    };
    let filter = ctx.filter;
    if filter.stack_ceiling > 0 {
        if let Some(sp) = inspector.stack_pointer(obs.tid) {
            if let Some(bytes) = inspector.read_memory(sp, filter.stack_ceiling) {
                payload.push_bounded(
                    Section::Stack {
                        tid: obs.tid,
                        sp,
                        bytes,
                    },
                    filter.stack_ceiling,
                );
            }
        }
    }
    if filter.heap_ceiling > 0 {
        if let Some(addr) = inspector.heap_start() {
            if let Some(bytes) = inspector.read_memory(addr, filter.heap_ceiling) {
                payload.push_bounded(Section::Heap { addr, bytes }, filter.heap_ceiling);
            }
        }
    }
    for watch in &filter.watch {
        match read_global(inspector, watch) {
            Some(section) => payload.push(section),
            None => trace!(watch = %watch, "Watched global unreadable"),
        }
    }
}

/// Build the payload for an observation and package it for the sequencer
///
/// # Errors
///
/// Returns error if the payload cannot be encoded
pub fn capture(ctx: &CaptureContext<'_>, obs: &Observation<'_>) -> CoreResult<Captured> {
    let mut payload = Payload::new();
    CAPTURE[obs.category.slot()](ctx, obs, &mut payload);
    if ctx.threads_changed {
        census_section(ctx, &mut payload);
    }
    if obs.category != Category::X11 && obs.category != Category::DBus {
        context_sections(ctx, obs, &mut payload);
    }
    Ok(Captured {
        category: obs.category,
        code: obs.code,
        tid: obs.tid,
        thread_count: obs.thread_count,
        timestamp: obs.at,
        duration: obs.duration,
        result: obs.result,
        payload: payload.encode()?,
    })
}
