//! ptrace backend for Linux on x86_64.
//!
//! Every resume is deferred to the next [`Tracer::next_stop`] call so the
//! driver can inspect a thread while it is still stopped. The trigger uses
//! a pair of one-shot int3 breakpoints: first on the function entry, then
//! on the return address found at the top of the stack.

use crate::error::{AttachError, RecorderError, RecorderResult};
use crate::procfs;
use crate::symbols::SymbolTable;
use crate::tracer::{Backend, Inspector, Stop, Target, TracePlan, Tracer};
use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType, Event, Options};
use nix::sys::signal::{Signal, kill, raise};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execve, fork};
use parking_lot::Mutex;
use retrace_core::{CancelToken, MonoClock, MonoTime};
use retrace_dump::ModuleRecord;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

const INT3: i64 = 0xcc;

/// Launches or attaches with ptrace
#[derive(Debug, Default)]
pub struct PtraceBackend {
    launched: Mutex<HashSet<u32>>,
}

impl PtraceBackend {
    /// New backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for PtraceBackend {
    fn attach(
        &self,
        target: &Target,
        plan: &TracePlan,
        clock: MonoClock,
    ) -> Result<Box<dyn Tracer>, AttachError> {
        let tracer = match target {
            Target::Launch { program, args } => {
                let tracer = PtraceTracer::launch(program, args, plan, clock)?;
                self.launched.lock().insert(tracer.pid());
                tracer
            }
            Target::Pid(pid) => PtraceTracer::attach(*pid, plan, clock)?,
        };
        Ok(Box::new(tracer))
    }

    fn interrupt(&self, pid: u32) {
        let signal = if self.launched.lock().contains(&pid) {
            Signal::SIGKILL
        } else {
            Signal::SIGSTOP
        };
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}

#[derive(Debug, Clone, Copy)]
struct SyscallEntry {
    nr: u32,
    args: [u64; 6],
    at: MonoTime,
}

#[derive(Debug, Default)]
struct ThreadState {
    in_syscall: Option<SyscallEntry>,
}

#[derive(Debug, Clone, Copy)]
enum BreakpointKind {
    Entry,
    Return,
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    addr: u64,
    saved: i64,
    kind: BreakpointKind,
}

/// A process under ptrace
pub struct PtraceTracer {
    pid: Pid,
    path: PathBuf,
    clock: MonoClock,
    plan: TracePlan,
    launched: bool,
    threads: BTreeMap<i32, ThreadState>,
    fresh: HashSet<i32>,
    mem: Option<File>,
    symbols: SymbolTable,
    load_base: u64,
    breakpoint: Option<Breakpoint>,
    pending: VecDeque<Stop>,
    parked: Vec<(Pid, Option<Signal>)>,
}

fn denied(target: &str, err: Errno) -> AttachError {
    match err {
        Errno::ESRCH | Errno::ENOENT => AttachError::TargetNotFound {
            target: target.to_string(),
        },
        other => AttachError::Denied {
            target: target.to_string(),
            reason: other.desc().to_string(),
        },
    }
}

fn cstring(bytes: &[u8], target: &str) -> Result<CString, AttachError> {
    CString::new(bytes).map_err(|_| AttachError::TargetNotFound {
        target: format!("{target} (embedded NUL)"),
    })
}

fn options(launched: bool) -> Options {
    let base = Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEEXEC;
    if launched {
        base | Options::PTRACE_O_EXITKILL
    } else {
        base
    }
}

fn regs_bytes(regs: &libc::user_regs_struct) -> Vec<u8> {
    let words = [
        regs.r15, regs.r14, regs.r13, regs.r12, regs.rbp, regs.rbx, regs.r11, regs.r10,
        regs.r9, regs.r8, regs.rax, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.orig_rax,
        regs.rip, regs.cs, regs.eflags, regs.rsp, regs.ss, regs.fs_base, regs.gs_base,
        regs.ds, regs.es, regs.fs, regs.gs,
    ];
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

impl PtraceTracer {
    fn new(pid: Pid, path: PathBuf, plan: &TracePlan, clock: MonoClock, launched: bool) -> Self {
        let mem = File::open(format!("/proc/{pid}/mem")).ok();
        let symbols = SymbolTable::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, "No symbols for target");
            SymbolTable::default()
        });
        let load_base = procfs::read_maps(pid.as_raw() as u32)
            .ok()
            .and_then(|maps| procfs::load_base(&maps, &path))
            .unwrap_or(0);
        Self {
            pid,
            path,
            clock,
            plan: plan.clone(),
            launched,
            threads: BTreeMap::from([(pid.as_raw(), ThreadState::default())]),
            fresh: HashSet::new(),
            mem,
            symbols,
            load_base,
            breakpoint: None,
            pending: VecDeque::new(),
            parked: Vec::new(),
        }
    }

    /// Fork, stop the child before exec, then follow it through exec
    ///
    /// # Errors
    ///
    /// Returns error if the program is missing or cannot be traced
    pub fn launch(
        program: &std::path::Path,
        args: &[String],
        plan: &TracePlan,
        clock: MonoClock,
    ) -> Result<Self, AttachError> {
        let name = program.display().to_string();
        if !program.exists() {
            return Err(AttachError::TargetNotFound { target: name });
        }
        let prog = cstring(program.as_os_str().as_bytes(), &name)?;
        let mut argv = vec![prog.clone()];
        for arg in args {
            argv.push(cstring(arg.as_bytes(), &name)?);
        }
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(plan.env.iter().cloned());
        let envp = env
            .iter()
            .map(|(k, v)| cstring(format!("{k}={v}").as_bytes(), &name))
            .collect::<Result<Vec<_>, _>>()?;

        // SAFETY: the child only makes async-signal-safe calls before exec
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = ptrace::traceme();
                let _ = raise(Signal::SIGSTOP);
                let _ = execve(&prog, &argv, &envp);
                // SAFETY: exec failed; leave without running destructors
                unsafe { libc::_exit(127) }
            }
            Ok(ForkResult::Parent { child }) => Self::follow_exec(child, &name, plan, clock),
            Err(e) => Err(denied(&name, e)),
        }
    }

    fn follow_exec(
        child: Pid,
        name: &str,
        plan: &TracePlan,
        clock: MonoClock,
    ) -> Result<Self, AttachError> {
        match waitpid(child, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
            Ok(other) => {
                return Err(AttachError::Denied {
                    target: name.to_string(),
                    reason: format!("unexpected first stop {other:?}"),
                });
            }
            Err(e) => return Err(denied(name, e)),
        }
        ptrace::setoptions(child, options(true)).map_err(|e| denied(name, e))?;
        ptrace::cont(child, None).map_err(|e| denied(name, e))?;
        loop {
            match waitpid(child, None) {
                Ok(WaitStatus::PtraceEvent(_, _, event)) if event == Event::PTRACE_EVENT_EXEC as i32 => {
                    break;
                }
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(..)) => {
                    return Err(AttachError::TargetNotFound {
                        target: format!("{name} (exec failed)"),
                    });
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    ptrace::cont(child, Some(sig)).map_err(|e| denied(name, e))?;
                }
                Ok(_) => {
                    ptrace::cont(child, None).map_err(|e| denied(name, e))?;
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(denied(name, e)),
            }
        }
        let path = procfs::exe_path(child.as_raw() as u32).unwrap_or_else(|| PathBuf::from(name));
        let mut tracer = Self::new(child, path, plan, clock, true);
        tracer.arm_trigger();
        tracer.parked.push((child, None));
        info!(pid = child.as_raw(), target = name, "Launched target");
        Ok(tracer)
    }

    /// Attach to every thread of a running process
    ///
    /// # Errors
    ///
    /// Returns error if the process is gone or tracing is not permitted
    pub fn attach(pid: u32, plan: &TracePlan, clock: MonoClock) -> Result<Self, AttachError> {
        let name = format!("pid {pid}");
        let path = procfs::exe_path(pid).ok_or_else(|| AttachError::TargetNotFound {
            target: name.clone(),
        })?;
        let main = Pid::from_raw(pid as i32);
        let mut tracer = Self::new(main, path, plan, clock, false);
        for tid in procfs::thread_ids(pid) {
            let tid = Pid::from_raw(tid as i32);
            if let Err(e) = ptrace::attach(tid) {
                if tid == main {
                    return Err(denied(&name, e));
                }
                debug!(tid = tid.as_raw(), error = %e, "Thread vanished during attach");
                continue;
            }
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(..)) => {}
                Ok(other) => debug!(tid = tid.as_raw(), status = ?other, "Unexpected attach stop"),
                Err(e) => return Err(denied(&name, e)),
            }
            ptrace::setoptions(tid, options(false)).map_err(|e| denied(&name, e))?;
            tracer.threads.entry(tid.as_raw()).or_default();
            tracer.parked.push((tid, None));
        }
        tracer.arm_trigger();
        info!(pid, threads = tracer.threads.len(), "Attached to target");
        Ok(tracer)
    }

    fn insert_breakpoint(&self, addr: u64, kind: BreakpointKind) -> Option<Breakpoint> {
        let at = addr as AddressType;
        let saved = ptrace::read(self.pid, at).ok()?;
        ptrace::write(self.pid, at, (saved & !0xff) | INT3).ok()?;
        trace!(addr, ?kind, "Breakpoint inserted");
        Some(Breakpoint { addr, saved, kind })
    }

    fn arm_trigger(&mut self) {
        let Some(name) = self.plan.trigger.clone() else {
            return;
        };
        match self.symbols.runtime_address(&name, self.load_base) {
            Some(addr) => self.breakpoint = self.insert_breakpoint(addr, BreakpointKind::Entry),
            None => warn!(function = %name, "Trigger function not found, nothing will be recorded"),
        }
    }

    /// Handle a SIGTRAP that may be ours; true if it was a breakpoint hit
    fn on_trap(&mut self, tid: Pid) -> bool {
        let Some(bp) = self.breakpoint else {
            return false;
        };
        let Ok(mut regs) = ptrace::getregs(tid) else {
            return false;
        };
        if regs.rip.wrapping_sub(1) != bp.addr {
            return false;
        }
        let _ = ptrace::write(self.pid, bp.addr as AddressType, bp.saved);
        regs.rip = bp.addr;
        let _ = ptrace::setregs(tid, regs);
        self.breakpoint = None;
        match bp.kind {
            BreakpointKind::Entry => {
                let ret = ptrace::read(tid, regs.rsp as AddressType).ok();
                self.breakpoint =
                    ret.and_then(|ret| self.insert_breakpoint(ret as u64, BreakpointKind::Return));
            }
            BreakpointKind::Return => {
                self.pending.push_back(Stop::TriggerReturned {
                    tid: tid.as_raw() as u32,
                    at: self.clock.now(),
                });
            }
        }
        true
    }

    fn on_syscall(&mut self, tid: Pid) {
        let Ok(regs) = ptrace::getregs(tid) else {
            return;
        };
        let now = self.clock.now();
        let state = self.threads.entry(tid.as_raw()).or_default();
        match state.in_syscall.take() {
            None => {
                state.in_syscall = Some(SyscallEntry {
                    nr: regs.orig_rax as u32,
                    args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
                    at: now,
                });
            }
            Some(entry) => {
                let wanted = self.plan.syscalls
                    && self
                        .plan
                        .syscall_set
                        .as_ref()
                        .is_none_or(|s| s.contains(&entry.nr));
                if wanted {
                    self.pending.push_back(Stop::Syscall {
                        tid: tid.as_raw() as u32,
                        nr: entry.nr,
                        args: entry.args,
                        result: regs.rax as i64,
                        entered_at: entry.at,
                        exited_at: now,
                    });
                }
            }
        }
    }

    fn on_signal(&mut self, tid: Pid, sig: Signal) -> Option<Signal> {
        if sig == Signal::SIGSTOP && self.fresh.remove(&tid.as_raw()) {
            return None;
        }
        if sig == Signal::SIGTRAP && self.on_trap(tid) {
            return None;
        }
        if self.plan.signals {
            let (code, fault_addr) = match ptrace::getsiginfo(tid) {
                // SAFETY: si_addr is read only for the fault signals that fill it
                Ok(info) if matches!(sig, Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE) => {
                    (info.si_code, unsafe { info.si_addr() } as u64)
                }
                Ok(info) => (info.si_code, 0),
                Err(_) => (0, 0),
            };
            self.pending.push_back(Stop::Signal {
                tid: tid.as_raw() as u32,
                signo: sig as i32,
                code,
                fault_addr,
                at: self.clock.now(),
            });
        }
        Some(sig)
    }

    fn resume(&self, tid: Pid, sig: Option<Signal>) {
        let result = if self.plan.syscalls {
            ptrace::syscall(tid, sig)
        } else {
            ptrace::cont(tid, sig)
        };
        if let Err(e) = result {
            trace!(tid = tid.as_raw(), error = %e, "Resume failed");
        }
    }

    fn thread_gone(&mut self, tid: Pid, stop: Stop) {
        self.threads.remove(&tid.as_raw());
        if tid == self.pid {
            self.pending.push_back(stop);
        } else {
            self.pending.push_back(Stop::ThreadExited {
                tid: tid.as_raw() as u32,
            });
        }
    }
}

impl Inspector for PtraceTracer {
    fn read_memory(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mem = self.mem.as_ref()?;
        let mut buf = vec![0u8; len];
        let n = mem.read_at(&mut buf, addr).ok()?;
        if n == 0 {
            return None;
        }
        buf.truncate(n);
        Some(buf)
    }

    fn registers(&self, tid: u32) -> Option<Vec<u8>> {
        ptrace::getregs(Pid::from_raw(tid as i32))
            .ok()
            .map(|r| regs_bytes(&r))
    }

    fn stack_pointer(&self, tid: u32) -> Option<u64> {
        ptrace::getregs(Pid::from_raw(tid as i32)).ok().map(|r| r.rsp)
    }

    fn heap_start(&self) -> Option<u64> {
        procfs::read_maps(self.pid.as_raw() as u32)
            .ok()
            .and_then(|maps| procfs::heap_start(&maps))
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.runtime_address(name, self.load_base)
    }

    fn threads(&self) -> Vec<u32> {
        self.threads.keys().map(|t| *t as u32).collect()
    }

    fn modules(&self) -> Vec<ModuleRecord> {
        procfs::read_maps(self.pid.as_raw() as u32)
            .map(|maps| procfs::modules(&maps))
            .unwrap_or_default()
    }
}

impl Tracer for PtraceTracer {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn target_path(&self) -> String {
        self.path.display().to_string()
    }

    fn next_stop(&mut self, abort: &CancelToken) -> RecorderResult<Option<Stop>> {
        loop {
            if let Some(stop) = self.pending.pop_front() {
                return Ok(Some(stop));
            }
            if self.threads.is_empty() || abort.is_cancelled() {
                return Ok(None);
            }
            for (tid, sig) in std::mem::take(&mut self.parked) {
                self.resume(tid, sig);
            }

            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.threads.clear();
                    return Ok(None);
                }
                Err(e) => return Err(RecorderError::tracer(format!("waitpid: {e}"))),
            };
            match status {
                WaitStatus::PtraceSyscall(tid) => {
                    self.on_syscall(tid);
                    self.parked.push((tid, None));
                }
                WaitStatus::PtraceEvent(tid, _, event) => {
                    if event == Event::PTRACE_EVENT_CLONE as i32 {
                        if let Ok(new) = ptrace::getevent(tid) {
                            let new = new as i32;
                            if self.threads.insert(new, ThreadState::default()).is_none() {
                                self.fresh.insert(new);
                            }
                            self.pending.push_back(Stop::ThreadStarted { tid: new as u32 });
                        }
                    }
                    self.parked.push((tid, None));
                }
                WaitStatus::Stopped(tid, sig) => {
                    if !self.threads.contains_key(&tid.as_raw()) {
                        // new thread's first stop arrived before the clone event
                        self.threads.insert(tid.as_raw(), ThreadState::default());
                        self.parked.push((tid, None));
                        continue;
                    }
                    if abort.is_cancelled() {
                        self.parked.push((tid, None));
                        continue;
                    }
                    let deliver = self.on_signal(tid, sig);
                    self.parked.push((tid, deliver));
                }
                WaitStatus::Exited(tid, code) => self.thread_gone(tid, Stop::Exited { code }),
                WaitStatus::Signaled(tid, sig, _) => {
                    self.thread_gone(tid, Stop::Killed { signo: sig as i32 });
                }
                _ => {}
            }
        }
    }

    fn terminate(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        if self.launched {
            let _ = kill(self.pid, Signal::SIGKILL);
            loop {
                match waitpid(None, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _))
                        if tid == self.pid =>
                    {
                        break;
                    }
                    Err(Errno::EINTR) | Ok(_) => {}
                    Err(_) => break,
                }
            }
        } else {
            if let Some(bp) = self.breakpoint.take() {
                let _ = ptrace::write(self.pid, bp.addr as AddressType, bp.saved);
            }
            for tid in self.threads.keys() {
                let _ = ptrace::detach(Pid::from_raw(*tid), Some(Signal::SIGCONT));
            }
        }
        self.threads.clear();
        debug!(pid = self.pid.as_raw(), "Tracer released target");
    }

    fn inspector(&self) -> &dyn Inspector {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regs_bytes_layout() {
        // SAFETY: user_regs_struct is plain integers
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.r15 = 1;
        regs.rsp = 0x7ffd_0000;
        let bytes = regs_bytes(&regs);
        assert_eq!(bytes.len(), 27 * 8);
        assert_eq!(bytes[0], 1);
        assert_eq!(u64::from_le_bytes(bytes[19 * 8..20 * 8].try_into().unwrap()), 0x7ffd_0000);
    }

    #[test]
    fn test_launch_missing_program() {
        let err = PtraceTracer::launch(
            std::path::Path::new("/nonexistent/retrace-target"),
            &[],
            &TracePlan::default(),
            MonoClock::start(),
        )
        .err();
        assert!(matches!(err, Some(AttachError::TargetNotFound { .. })));
    }
}
