//! Tracing backends.
//!
//! A [`Backend`] turns a [`Target`] into a live [`Tracer`]. The tracer is
//! driven from a single thread: each call to [`Tracer::next_stop`] resumes
//! the target until something observable happens. While the target sits in
//! a stop, the [`Inspector`] half reads its memory and registers.

use crate::error::{AttachError, RecorderResult};
use retrace_core::{CancelToken, MonoClock, MonoTime};
use retrace_dump::ModuleRecord;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Launch an executable suspended and trace it from its first instruction
    Launch {
        /// Executable path
        program: PathBuf,
        /// Arguments, without argv\[0\]
        args: Vec<String>,
    },
    /// Attach to a running process
    Pid(u32),
}

impl Target {
    /// Launch target with arguments
    #[must_use]
    pub fn launch(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::Launch {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch { program, .. } => write!(f, "{}", program.display()),
            Self::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Interceptors a backend installs at attach
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracePlan {
    /// Stop on syscalls at all
    pub syscalls: bool,
    /// Syscall numbers worth a stop; `None` means every syscall
    pub syscall_set: Option<BTreeSet<u32>>,
    /// Report signal-delivery stops
    pub signals: bool,
    /// Function whose return opens the recording gate
    pub trigger: Option<String>,
    /// Extra environment for launched targets
    pub env: Vec<(String, String)>,
}

/// Something the target did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    /// A syscall returned
    Syscall {
        /// Calling thread
        tid: u32,
        /// Syscall number
        nr: u32,
        /// Argument registers in call order
        args: [u64; 6],
        /// Return value
        result: i64,
        /// Syscall entry
        entered_at: MonoTime,
        /// Syscall exit
        exited_at: MonoTime,
    },
    /// A signal is about to be delivered
    Signal {
        /// Receiving thread
        tid: u32,
        /// Signal number
        signo: i32,
        /// `si_code`
        code: i32,
        /// Faulting address when the signal carries one
        fault_addr: u64,
        /// Stop time
        at: MonoTime,
    },
    /// The trigger function returned
    TriggerReturned {
        /// Thread it returned on
        tid: u32,
        /// Return time
        at: MonoTime,
    },
    /// A new thread appeared
    ThreadStarted {
        /// New thread id
        tid: u32,
    },
    /// A thread went away
    ThreadExited {
        /// Thread id
        tid: u32,
    },
    /// The process exited normally
    Exited {
        /// Exit status
        code: i32,
    },
    /// The process was killed by a signal
    Killed {
        /// Terminating signal
        signo: i32,
    },
}

/// Read access to a stopped target
pub trait Inspector {
    /// Read `len` bytes at `addr`; short or failed reads return what is there
    fn read_memory(&self, addr: u64, len: usize) -> Option<Vec<u8>>;

    /// Read a NUL-terminated string of at most `max` bytes
    fn read_c_string(&self, addr: u64, max: usize) -> Option<Vec<u8>> {
        let mut bytes = self.read_memory(addr, max)?;
        if let Some(end) = bytes.iter().position(|b| *b == 0) {
            bytes.truncate(end);
        }
        Some(bytes)
    }

    /// Raw register block of a thread
    fn registers(&self, tid: u32) -> Option<Vec<u8>>;

    /// Stack pointer of a thread
    fn stack_pointer(&self, tid: u32) -> Option<u64>;

    /// Start of the heap mapping
    fn heap_start(&self) -> Option<u64>;

    /// Runtime address of a symbol in the executable
    fn symbol(&self, name: &str) -> Option<u64>;

    /// Live traced threads, ascending
    fn threads(&self) -> Vec<u32>;

    /// Loaded modules
    fn modules(&self) -> Vec<ModuleRecord>;
}

/// A live trace of one process
pub trait Tracer: Inspector + Send {
    /// Traced process id
    fn pid(&self) -> u32;

    /// Executable path
    fn target_path(&self) -> String;

    /// Resume until the next stop; `None` once the process is gone
    ///
    /// # Errors
    ///
    /// Returns error if the backend loses track of the target
    fn next_stop(&mut self, abort: &CancelToken) -> RecorderResult<Option<Stop>>;

    /// Kill the target and release it
    fn terminate(&mut self);

    /// Inspector view of this tracer
    fn inspector(&self) -> &dyn Inspector;
}

/// Creates tracers
pub trait Backend: Send + Sync + 'static {
    /// Launch or attach, then install the plan; stops are timestamped on `clock`
    ///
    /// # Errors
    ///
    /// Returns error if the target does not exist or cannot be traced
    fn attach(
        &self,
        target: &Target,
        plan: &TracePlan,
        clock: MonoClock,
    ) -> Result<Box<dyn Tracer>, AttachError>;

    /// Wake a tracer blocked in [`Tracer::next_stop`] from another thread
    fn interrupt(&self, _pid: u32) {}
}

/// Backend that replays a fixed list of stops
#[derive(Debug, Clone)]
pub struct ScriptedTracer {
    pid: u32,
    path: String,
    stops: VecDeque<Stop>,
    memory: BTreeMap<u64, Vec<u8>>,
    registers: BTreeMap<u32, Vec<u8>>,
    stack_pointers: BTreeMap<u32, u64>,
    heap: Option<u64>,
    symbols: BTreeMap<String, u64>,
    modules: Vec<ModuleRecord>,
    threads: BTreeSet<u32>,
    hold: bool,
    attach_delay: Duration,
    plan: TracePlan,
}

impl ScriptedTracer {
    /// Script for process `pid`
    #[must_use]
    pub fn new(pid: u32, path: impl Into<String>) -> Self {
        Self {
            pid,
            path: path.into(),
            stops: VecDeque::new(),
            memory: BTreeMap::new(),
            registers: BTreeMap::new(),
            stack_pointers: BTreeMap::new(),
            heap: None,
            symbols: BTreeMap::new(),
            modules: Vec::new(),
            threads: BTreeSet::from([pid]),
            hold: false,
            attach_delay: Duration::ZERO,
            plan: TracePlan::default(),
        }
    }

    /// Builder method: append a stop
    #[must_use]
    pub fn stop(mut self, stop: Stop) -> Self {
        self.stops.push_back(stop);
        self
    }

    /// Builder method: a syscall by `tid` taking 1µs and exiting at `at_ns`
    #[must_use]
    pub fn syscall(self, tid: u32, nr: u32, args: [u64; 6], result: i64, at_ns: u64) -> Self {
        self.stop(Stop::Syscall {
            tid,
            nr,
            args,
            result,
            entered_at: MonoTime::from_nanos(at_ns.saturating_sub(1_000)),
            exited_at: MonoTime::from_nanos(at_ns),
        })
    }

    /// Builder method: target memory
    #[must_use]
    pub fn memory(mut self, addr: u64, bytes: Vec<u8>) -> Self {
        self.memory.insert(addr, bytes);
        self
    }

    /// Builder method: thread registers and stack pointer
    #[must_use]
    pub fn thread(mut self, tid: u32, registers: Vec<u8>, sp: u64) -> Self {
        self.threads.insert(tid);
        self.registers.insert(tid, registers);
        self.stack_pointers.insert(tid, sp);
        self
    }

    /// Builder method: heap start
    #[must_use]
    pub fn heap(mut self, addr: u64) -> Self {
        self.heap = Some(addr);
        self
    }

    /// Builder method: symbol address
    #[must_use]
    pub fn symbol(mut self, name: impl Into<String>, addr: u64) -> Self {
        self.symbols.insert(name.into(), addr);
        self
    }

    /// Builder method: loaded module
    #[must_use]
    pub fn module(mut self, module: ModuleRecord) -> Self {
        self.modules.push(module);
        self
    }

    /// Builder method: block after the script until aborted instead of exiting
    #[must_use]
    pub fn hold(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Builder method: time spent attaching
    #[must_use]
    pub fn attach_delay(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    fn wanted(&self, stop: &Stop) -> bool {
        match stop {
            Stop::Syscall { nr, .. } => {
                self.plan.syscalls && self.plan.syscall_set.as_ref().is_none_or(|s| s.contains(nr))
            }
            Stop::Signal { .. } => self.plan.signals,
            Stop::TriggerReturned { .. } => self.plan.trigger.is_some(),
            _ => true,
        }
    }
}

impl Inspector for ScriptedTracer {
    fn read_memory(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let (base, bytes) = self.memory.range(..=addr).next_back()?;
        let start = usize::try_from(addr - base).ok()?;
        if start >= bytes.len() {
            return None;
        }
        let end = start.saturating_add(len).min(bytes.len());
        Some(bytes[start..end].to_vec())
    }

    fn registers(&self, tid: u32) -> Option<Vec<u8>> {
        self.registers.get(&tid).cloned()
    }

    fn stack_pointer(&self, tid: u32) -> Option<u64> {
        self.stack_pointers.get(&tid).copied()
    }

    fn heap_start(&self) -> Option<u64> {
        self.heap
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn threads(&self) -> Vec<u32> {
        self.threads.iter().copied().collect()
    }

    fn modules(&self) -> Vec<ModuleRecord> {
        self.modules.clone()
    }
}

impl Tracer for ScriptedTracer {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn target_path(&self) -> String {
        self.path.clone()
    }

    fn next_stop(&mut self, abort: &CancelToken) -> RecorderResult<Option<Stop>> {
        loop {
            if abort.is_cancelled() {
                return Ok(None);
            }
            let Some(stop) = self.stops.pop_front() else {
                if self.hold {
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                return Ok(None);
            };
            match &stop {
                Stop::ThreadStarted { tid } => {
                    self.threads.insert(*tid);
                }
                Stop::ThreadExited { tid } => {
                    self.threads.remove(tid);
                }
                _ => {}
            }
            if self.wanted(&stop) {
                return Ok(Some(stop));
            }
        }
    }

    fn terminate(&mut self) {
        self.stops.clear();
        self.hold = false;
    }

    fn inspector(&self) -> &dyn Inspector {
        self
    }
}

/// Hands out one prepared [`ScriptedTracer`]
#[derive(Debug)]
pub struct ScriptedBackend {
    script: parking_lot::Mutex<Option<ScriptedTracer>>,
}

impl ScriptedBackend {
    /// Backend serving `script` to the first attach
    #[must_use]
    pub fn new(script: ScriptedTracer) -> Self {
        Self {
            script: parking_lot::Mutex::new(Some(script)),
        }
    }
}

impl Backend for ScriptedBackend {
    fn attach(
        &self,
        target: &Target,
        plan: &TracePlan,
        _clock: MonoClock,
    ) -> Result<Box<dyn Tracer>, AttachError> {
        let mut script = self.script.lock().take().ok_or_else(|| AttachError::TargetNotFound {
            target: target.to_string(),
        })?;
        if !script.attach_delay.is_zero() {
            std::thread::sleep(script.attach_delay);
        }
        if let Some(trigger) = &plan.trigger {
            if Inspector::symbol(&script, trigger).is_none() {
                return Err(AttachError::TargetNotFound {
                    target: format!("{target} (no symbol {trigger})"),
                });
            }
        }
        script.plan = plan.clone();
        Ok(Box::new(script))
    }
}
