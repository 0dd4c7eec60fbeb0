//! Naming tables for event codes.
//!
//! x86_64 Linux numbering. Unknown codes render as `<kind>_<code>`.

use crate::event::Category;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Syscall classification used by allow-lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyscallGroup {
    /// Takes or returns a file descriptor
    Desc,
    /// Takes a path
    File,
    /// Address space management
    Memory,
    /// Process lifecycle
    Process,
    /// Signal handling
    Signal,
    /// System V IPC
    Ipc,
    /// Sockets
    Network,
    /// Calls normally served by the vDSO
    Vdso,
}

const DESC: u8 = 1 << 0;
const FILE: u8 = 1 << 1;
const MEMORY: u8 = 1 << 2;
const PROCESS: u8 = 1 << 3;
const SIGNAL: u8 = 1 << 4;
const IPC: u8 = 1 << 5;
const NETWORK: u8 = 1 << 6;
const VDSO: u8 = 1 << 7;

impl SyscallGroup {
    /// Every group
    pub const ALL: [SyscallGroup; 8] = [
        Self::Desc,
        Self::File,
        Self::Memory,
        Self::Process,
        Self::Signal,
        Self::Ipc,
        Self::Network,
        Self::Vdso,
    ];

    /// Bit in the group mask
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Desc => DESC,
            Self::File => FILE,
            Self::Memory => MEMORY,
            Self::Process => PROCESS,
            Self::Signal => SIGNAL,
            Self::Ipc => IPC,
            Self::Network => NETWORK,
            Self::Vdso => VDSO,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Desc => "desc",
            Self::File => "file",
            Self::Memory => "memory",
            Self::Process => "process",
            Self::Signal => "signal",
            Self::Ipc => "ipc",
            Self::Network => "network",
            Self::Vdso => "vdso",
        }
    }

    /// Parse a lowercase name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.name() == name)
    }

    /// Whether syscall `nr` belongs to the group
    #[must_use]
    pub fn contains(self, nr: u32) -> bool {
        syscall_groups(nr) & self.bit() != 0
    }

    /// Every known syscall number in the group
    pub fn members(self) -> impl Iterator<Item = u32> {
        SYSCALLS
            .iter()
            .filter(move |(_, _, groups)| groups & self.bit() != 0)
            .map(|(nr, _, _)| *nr)
    }
}

impl fmt::Display for SyscallGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const SYSCALLS: &[(u32, &str, u8)] = &[
    (0, "read", DESC),
    (1, "write", DESC),
    (2, "open", DESC | FILE),
    (3, "close", DESC),
    (4, "stat", FILE),
    (5, "fstat", DESC),
    (6, "lstat", FILE),
    (7, "poll", DESC),
    (8, "lseek", DESC),
    (9, "mmap", DESC | MEMORY),
    (10, "mprotect", MEMORY),
    (11, "munmap", MEMORY),
    (12, "brk", MEMORY),
    (13, "rt_sigaction", SIGNAL),
    (14, "rt_sigprocmask", SIGNAL),
    (15, "rt_sigreturn", SIGNAL),
    (16, "ioctl", DESC),
    (17, "pread64", DESC),
    (18, "pwrite64", DESC),
    (19, "readv", DESC),
    (20, "writev", DESC),
    (21, "access", FILE),
    (22, "pipe", DESC),
    (23, "select", DESC),
    (24, "sched_yield", 0),
    (25, "mremap", MEMORY),
    (26, "msync", MEMORY),
    (27, "mincore", MEMORY),
    (28, "madvise", MEMORY),
    (29, "shmget", IPC),
    (30, "shmat", IPC | MEMORY),
    (31, "shmctl", IPC),
    (32, "dup", DESC),
    (33, "dup2", DESC),
    (34, "pause", SIGNAL),
    (35, "nanosleep", 0),
    (36, "getitimer", 0),
    (37, "alarm", 0),
    (38, "setitimer", 0),
    (39, "getpid", 0),
    (40, "sendfile", DESC | NETWORK),
    (41, "socket", NETWORK),
    (42, "connect", NETWORK),
    (43, "accept", NETWORK),
    (44, "sendto", NETWORK),
    (45, "recvfrom", NETWORK),
    (46, "sendmsg", NETWORK),
    (47, "recvmsg", NETWORK),
    (48, "shutdown", NETWORK),
    (49, "bind", NETWORK),
    (50, "listen", NETWORK),
    (51, "getsockname", NETWORK),
    (52, "getpeername", NETWORK),
    (53, "socketpair", NETWORK),
    (54, "setsockopt", NETWORK),
    (55, "getsockopt", NETWORK),
    (56, "clone", PROCESS),
    (57, "fork", PROCESS),
    (58, "vfork", PROCESS),
    (59, "execve", FILE | PROCESS),
    (60, "exit", PROCESS),
    (61, "wait4", PROCESS),
    (62, "kill", SIGNAL | PROCESS),
    (63, "uname", 0),
    (64, "semget", IPC),
    (65, "semop", IPC),
    (66, "semctl", IPC),
    (67, "shmdt", IPC | MEMORY),
    (68, "msgget", IPC),
    (69, "msgsnd", IPC),
    (70, "msgrcv", IPC),
    (71, "msgctl", IPC),
    (72, "fcntl", DESC),
    (73, "flock", DESC),
    (74, "fsync", DESC),
    (75, "fdatasync", DESC),
    (76, "truncate", FILE),
    (77, "ftruncate", DESC),
    (78, "getdents", DESC),
    (79, "getcwd", FILE),
    (80, "chdir", FILE),
    (81, "fchdir", DESC),
    (82, "rename", FILE),
    (83, "mkdir", FILE),
    (84, "rmdir", FILE),
    (85, "creat", DESC | FILE),
    (86, "link", FILE),
    (87, "unlink", FILE),
    (88, "symlink", FILE),
    (89, "readlink", FILE),
    (90, "chmod", FILE),
    (91, "fchmod", DESC),
    (92, "chown", FILE),
    (93, "fchown", DESC),
    (94, "lchown", FILE),
    (95, "umask", 0),
    (96, "gettimeofday", VDSO),
    (97, "getrlimit", 0),
    (98, "getrusage", 0),
    (99, "sysinfo", 0),
    (100, "times", 0),
    (101, "ptrace", PROCESS),
    (102, "getuid", 0),
    (104, "getgid", 0),
    (105, "setuid", 0),
    (106, "setgid", 0),
    (107, "geteuid", 0),
    (108, "getegid", 0),
    (109, "setpgid", 0),
    (110, "getppid", 0),
    (111, "getpgrp", 0),
    (112, "setsid", 0),
    (127, "rt_sigpending", SIGNAL),
    (128, "rt_sigtimedwait", SIGNAL),
    (129, "rt_sigqueueinfo", SIGNAL),
    (130, "rt_sigsuspend", SIGNAL),
    (131, "sigaltstack", SIGNAL),
    (132, "utime", FILE),
    (133, "mknod", FILE),
    (137, "statfs", FILE),
    (138, "fstatfs", DESC),
    (157, "prctl", 0),
    (158, "arch_prctl", PROCESS),
    (161, "chroot", FILE),
    (162, "sync", 0),
    (165, "mount", FILE),
    (166, "umount2", FILE),
    (186, "gettid", 0),
    (200, "tkill", SIGNAL),
    (201, "time", VDSO),
    (202, "futex", 0),
    (213, "epoll_create", DESC),
    (217, "getdents64", DESC),
    (218, "set_tid_address", 0),
    (228, "clock_gettime", VDSO),
    (230, "clock_nanosleep", 0),
    (231, "exit_group", PROCESS),
    (232, "epoll_wait", DESC),
    (233, "epoll_ctl", DESC),
    (234, "tgkill", SIGNAL),
    (247, "waitid", PROCESS),
    (257, "openat", DESC | FILE),
    (258, "mkdirat", DESC | FILE),
    (262, "newfstatat", DESC | FILE),
    (263, "unlinkat", DESC | FILE),
    (264, "renameat", DESC | FILE),
    (267, "readlinkat", DESC | FILE),
    (269, "faccessat", DESC | FILE),
    (270, "pselect6", DESC),
    (271, "ppoll", DESC),
    (273, "set_robust_list", 0),
    (281, "epoll_pwait", DESC),
    (288, "accept4", NETWORK),
    (290, "eventfd2", DESC),
    (291, "epoll_create1", DESC),
    (292, "dup3", DESC),
    (293, "pipe2", DESC),
    (302, "prlimit64", 0),
    (309, "getcpu", VDSO),
    (318, "getrandom", 0),
    (319, "memfd_create", DESC),
    (322, "execveat", DESC | FILE | PROCESS),
    (332, "statx", DESC | FILE),
    (334, "rseq", 0),
    (435, "clone3", PROCESS),
    (439, "faccessat2", DESC | FILE),
];

fn lookup(nr: u32) -> Option<&'static (u32, &'static str, u8)> {
    SYSCALLS
        .binary_search_by_key(&nr, |(n, _, _)| *n)
        .ok()
        .map(|i| &SYSCALLS[i])
}

/// Group mask for a syscall number; zero when unknown or ungrouped
#[must_use]
pub fn syscall_groups(nr: u32) -> u8 {
    lookup(nr).map_or(0, |(_, _, g)| *g)
}

/// Syscall name
#[must_use]
pub fn syscall_name(nr: u32) -> Option<&'static str> {
    lookup(nr).map(|(_, name, _)| *name)
}

/// Syscall number by name
#[must_use]
pub fn syscall_number(name: &str) -> Option<u32> {
    SYSCALLS.iter().find(|(_, n, _)| *n == name).map(|(nr, _, _)| *nr)
}

const SIGNALS: [&str; 31] = [
    "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE", "SIGKILL",
    "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT", "SIGCHLD",
    "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU", "SIGXFSZ",
    "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS",
];

/// Signal name for numbers 1..=31
#[must_use]
pub fn signal_name(signo: u32) -> Option<&'static str> {
    let slot = usize::try_from(signo).ok()?.checked_sub(1)?;
    SIGNALS.get(slot).copied()
}

/// Signal number by name, with or without the `SIG` prefix
#[must_use]
pub fn signal_number(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
    SIGNALS
        .iter()
        .position(|s| *s == full)
        .and_then(|i| u32::try_from(i + 1).ok())
}

/// errno name for a positive error number
#[must_use]
pub fn errno_name(errno: i64) -> Option<&'static str> {
    Some(match errno {
        1 => "EPERM",
        2 => "ENOENT",
        3 => "ESRCH",
        4 => "EINTR",
        5 => "EIO",
        6 => "ENXIO",
        7 => "E2BIG",
        8 => "ENOEXEC",
        9 => "EBADF",
        10 => "ECHILD",
        11 => "EAGAIN",
        12 => "ENOMEM",
        13 => "EACCES",
        14 => "EFAULT",
        15 => "ENOTBLK",
        16 => "EBUSY",
        17 => "EEXIST",
        18 => "EXDEV",
        19 => "ENODEV",
        20 => "ENOTDIR",
        21 => "EISDIR",
        22 => "EINVAL",
        23 => "ENFILE",
        24 => "EMFILE",
        25 => "ENOTTY",
        26 => "ETXTBSY",
        27 => "EFBIG",
        28 => "ENOSPC",
        29 => "ESPIPE",
        30 => "EROFS",
        31 => "EMLINK",
        32 => "EPIPE",
        33 => "EDOM",
        34 => "ERANGE",
        35 => "EDEADLK",
        36 => "ENAMETOOLONG",
        37 => "ENOLCK",
        38 => "ENOSYS",
        39 => "ENOTEMPTY",
        40 => "ELOOP",
        88 => "ENOTSOCK",
        95 => "EOPNOTSUPP",
        98 => "EADDRINUSE",
        101 => "ENETUNREACH",
        104 => "ECONNRESET",
        105 => "ENOBUFS",
        106 => "EISCONN",
        107 => "ENOTCONN",
        110 => "ETIMEDOUT",
        111 => "ECONNREFUSED",
        113 => "EHOSTUNREACH",
        114 => "EALREADY",
        115 => "EINPROGRESS",
        512 => "ERESTARTSYS",
        513 => "ERESTARTNOINTR",
        514 => "ERESTARTNOHAND",
        516 => "ERESTART_RESTARTBLOCK",
        _ => return None,
    })
}

/// X11 core event name
#[must_use]
pub fn x11_name(kind: u32) -> Option<&'static str> {
    const NAMES: [&str; 34] = [
        "KeyPress",
        "KeyRelease",
        "ButtonPress",
        "ButtonRelease",
        "MotionNotify",
        "EnterNotify",
        "LeaveNotify",
        "FocusIn",
        "FocusOut",
        "KeymapNotify",
        "Expose",
        "GraphicsExpose",
        "NoExpose",
        "VisibilityNotify",
        "CreateNotify",
        "DestroyNotify",
        "UnmapNotify",
        "MapNotify",
        "MapRequest",
        "ReparentNotify",
        "ConfigureNotify",
        "ConfigureRequest",
        "GravityNotify",
        "ResizeRequest",
        "CirculateNotify",
        "CirculateRequest",
        "PropertyNotify",
        "SelectionClear",
        "SelectionRequest",
        "SelectionNotify",
        "ColormapNotify",
        "ClientMessage",
        "MappingNotify",
        "GenericEvent",
    ];
    let slot = usize::try_from(kind).ok()?.checked_sub(2)?;
    NAMES.get(slot).copied()
}

/// D-Bus message type name
#[must_use]
pub fn dbus_name(kind: u32) -> Option<&'static str> {
    match kind {
        1 => Some("method_call"),
        2 => Some("method_return"),
        3 => Some("error"),
        4 => Some("signal"),
        _ => None,
    }
}

/// Human name for an event code in its category
#[must_use]
pub fn event_name(category: Category, code: u32) -> Cow<'static, str> {
    let known = match category {
        Category::Syscall => syscall_name(code),
        Category::Signal => signal_name(code),
        Category::X11 => x11_name(code),
        Category::DBus => dbus_name(code),
    };
    match known {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("{category}_{code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sorted() {
        assert!(SYSCALLS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_syscall_lookup() {
        assert_eq!(syscall_name(0), Some("read"));
        assert_eq!(syscall_name(257), Some("openat"));
        assert_eq!(syscall_name(9999), None);
        assert_eq!(syscall_number("exit_group"), Some(231));
    }

    #[test]
    fn test_groups() {
        assert!(SyscallGroup::Network.contains(42));
        assert!(SyscallGroup::File.contains(2));
        assert!(SyscallGroup::Desc.contains(2));
        assert!(!SyscallGroup::Memory.contains(0));
        assert!(SyscallGroup::Vdso.members().any(|nr| nr == 228));
        assert_eq!(SyscallGroup::parse("ipc"), Some(SyscallGroup::Ipc));
        assert_eq!(SyscallGroup::parse("bogus"), None);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(15), Some("SIGTERM"));
        assert_eq!(signal_name(17), Some("SIGCHLD"));
        assert_eq!(signal_name(18), Some("SIGCONT"));
        assert_eq!(signal_name(0), None);
        assert_eq!(signal_name(32), None);
        assert_eq!(signal_number("segv"), Some(11));
        assert_eq!(signal_number("SIGKILL"), Some(9));
    }

    #[test]
    fn test_errno_names() {
        assert_eq!(errno_name(2), Some("ENOENT"));
        assert_eq!(errno_name(110), Some("ETIMEDOUT"));
        assert_eq!(errno_name(-2), None);
    }

    #[test]
    fn test_x11_and_dbus_names() {
        assert_eq!(x11_name(2), Some("KeyPress"));
        assert_eq!(x11_name(9), Some("FocusIn"));
        assert_eq!(x11_name(19), Some("MapNotify"));
        assert_eq!(x11_name(1), None);
        assert_eq!(dbus_name(4), Some("signal"));
    }

    #[test]
    fn test_event_name_fallback() {
        assert_eq!(event_name(Category::Syscall, 1), "write");
        assert_eq!(event_name(Category::DBus, 9), "dbus_9");
    }
}
