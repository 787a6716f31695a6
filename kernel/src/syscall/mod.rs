//! System-call entry
//!
//! One static table maps stable numbers to handlers. Dispatch is total:
//! any number either invokes its entry or reports ENOSYS — out-of-range
//! and not-yet-implemented entries included — without touching memory.
//! Results travel back as a `(value, error)` pair; the error slot also
//! lands in the calling thread's errno.

mod futex;
mod memory;
mod process;
mod system;
mod vfs;

use core::sync::atomic::Ordering;

use crate::arch::{self, Context};
use crate::error::Errno;

/// What a syscall hands back to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResult {
    pub value: usize,
    pub error: usize,
}

impl SyscallResult {
    pub const fn ok(value: usize) -> Self {
        Self { value, error: 0 }
    }

    pub const fn err(errno: Errno) -> Self {
        Self {
            value: usize::MAX,
            error: errno.as_usize(),
        }
    }
}

impl From<Result<usize, Errno>> for SyscallResult {
    fn from(result: Result<usize, Errno>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(errno) => Self::err(errno),
        }
    }
}

pub type SyscallFn = fn(usize, usize, usize, usize, usize, usize) -> SyscallResult;

pub struct SyscallEntry {
    pub func: Option<SyscallFn>,
    pub name: &'static str,
}

const fn ent(name: &'static str, func: SyscallFn) -> SyscallEntry {
    SyscallEntry {
        func: Some(func),
        name,
    }
}

const fn stub(name: &'static str) -> SyscallEntry {
    SyscallEntry { func: None, name }
}

/// The system-call table. Index is the stable syscall number.
pub static SYSCALL_TABLE: [SyscallEntry; 80] = [
    /* 0 */ ent("exit", process::sys_exit),
    /* 1 */ ent("uname", system::sys_uname),
    /* 2 */ stub("savetls"),
    /* 3 */ ent("archctl", system::sys_archctl),
    /* 4 */ stub("shutdown"),
    /* 5 */ stub("reboot"),
    /* 6 */ ent("readtimer", system::sys_readtimer),
    /* 7 */ ent("sigprocmask", process::sys_sigprocmask),
    /* 8 */ stub("sigsuspend"),
    /* 9 */ ent("sigpending", process::sys_sigpending),
    /* 10 */ ent("sigaction", process::sys_sigaction),
    /* 11 */ stub("sigtimedwait"),
    /* 12 */ ent("mmap", memory::sys_mmap),
    /* 13 */ ent("munmap", memory::sys_munmap),
    /* 14 */ ent("mprotect", memory::sys_mprotect),
    /* 15 */ ent("execve", process::sys_execve),
    /* 16 */ ent("fork", process::sys_fork),
    /* 17 */ ent("kill", process::sys_kill),
    /* 18 */ ent("gettid", process::sys_gettid),
    /* 19 */ ent("getpid", process::sys_getpid),
    /* 20 */ ent("getppid", process::sys_getppid),
    /* 21 */ ent("waitpid", process::sys_waitpid),
    /* 22 */ ent("read", vfs::sys_read),
    /* 23 */ ent("write", vfs::sys_write),
    /* 24 */ ent("seek", vfs::sys_seek),
    /* 25 */ ent("ioctl", vfs::sys_ioctl),
    /* 26 */ ent("openat", vfs::sys_openat),
    /* 27 */ ent("close", vfs::sys_close),
    /* 28 */ ent("stat", vfs::sys_stat),
    /* 29 */ ent("fstat", vfs::sys_fstat),
    /* 30 */ ent("faccessat", vfs::sys_faccessat),
    /* 31 */ ent("fcntl", vfs::sys_fcntl),
    /* 32 */ ent("readdir", vfs::sys_readdir),
    /* 33 */ ent("getcwd", vfs::sys_getcwd),
    /* 34 */ ent("chdir", vfs::sys_chdir),
    /* 35 */ ent("fchdir", vfs::sys_fchdir),
    /* 36 */ ent("mkdirat", vfs::sys_mkdirat),
    /* 37 */ ent("rmdirat", vfs::sys_rmdirat),
    /* 38 */ stub("rename"),
    /* 39 */ stub("chmodat"),
    /* 40 */ stub("chownat"),
    /* 41 */ stub("linkat"),
    /* 42 */ ent("unlinkat", vfs::sys_unlinkat),
    /* 43 */ stub("readlinkat"),
    /* 44 */ stub("setuid"),
    /* 45 */ ent("getuid", system::sys_getuid),
    /* 46 */ stub("setgid"),
    /* 47 */ ent("getgid", system::sys_getuid),
    /* 48 */ ent("geteuid", system::sys_getuid),
    /* 49 */ ent("getegid", system::sys_getuid),
    /* 50 */ stub("getpgid"),
    /* 51 */ stub("setpgid"),
    /* 52 */ ent("umask", vfs::sys_umask),
    /* 53 */ stub("poll"),
    /* 54 */ stub("pipe"),
    /* 55 */ stub("chroot"),
    /* 56 */ stub("mount"),
    /* 57 */ stub("unmount"),
    /* 58 */ stub("swapon"),
    /* 59 */ stub("swapoff"),
    /* 60 */ ent("futex_wait", futex::sys_futex_wait),
    /* 61 */ ent("futex_wake", futex::sys_futex_wake),
    /* 62 */ stub("socket"),
    /* 63 */ stub("socketpair"),
    /* 64 */ stub("bind"),
    /* 65 */ stub("connect"),
    /* 66 */ stub("accept"),
    /* 67 */ stub("listen"),
    /* 68 */ stub("getpeername"),
    /* 69 */ stub("getsockname"),
    /* 70 */ stub("getsockopt"),
    /* 71 */ stub("setsockopt"),
    /* 72 */ stub("recvmsg"),
    /* 73 */ stub("sendmsg"),
    /* 74 */ stub("sethostname"),
    /* 75 */ stub("sched_setaffinity"),
    /* 76 */ stub("sched_getaffinity"),
    /* 77 */ ent("mremap", memory::sys_mremap),
    /* 78 */ ent("isatty", vfs::sys_isatty),
    /* 79 */ stub("sigreturn"),
];

/// Dispatch by number. Total over all inputs.
pub fn dispatch(num: usize, args: [usize; 6]) -> SyscallResult {
    let Some(entry) = SYSCALL_TABLE.get(num) else {
        log::warn!("syscall: number {} is out of bounds", num);
        return SyscallResult::err(Errno::ENOSYS);
    };
    let Some(func) = entry.func else {
        log::warn!("syscall: \"{}\" ({}) is not implemented", entry.name, num);
        return SyscallResult::err(Errno::ENOSYS);
    };

    let result = func(args[0], args[1], args[2], args[3], args[4], args[5]);
    if result.error != 0 {
        // errno mirrors the error slot.
        if let Some(mut thread) = crate::process::thread::current() {
            // SAFETY: this CPU owns its current thread.
            unsafe { thread.as_mut().errno = result.error as i32 };
        }
    }
    result
}

/// Trap-level entry, registered on the syscall vector. Records the
/// calling thread's context and user stack, dispatches, and writes the
/// result registers back into the frame.
pub fn syscall_interrupt(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
    let cpu = arch::cpu::current();
    if let Some(mut thread) = cpu.current_thread() {
        // SAFETY: this CPU owns its current thread; the frame is live.
        unsafe {
            let t = thread.as_mut();
            t.context = *ctx;
            t.user_stack = cpu.user_stack.load(Ordering::Acquire);
        }
    }

    // SAFETY: the frame is live for the duration of the trap.
    let (num, args) = unsafe { (*ctx).syscall_args() };
    let result = dispatch(num, args);
    // SAFETY: as above.
    unsafe { (*ctx).set_syscall_result(result.value, result.error) };
    ctx
}

/// Claim the syscall vector on `cpu_id`.
pub fn init(cpu_id: usize) {
    if let Err(err) = crate::irq::register_handler(cpu_id, arch::INT_SYSCALL, syscall_interrupt, 0)
    {
        log::error!("syscall: cannot claim the syscall vector: {}", err);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_number_reports_enosys() {
        let result = dispatch(SYSCALL_TABLE.len() + 100, [0; 6]);
        assert_eq!(result.error, Errno::ENOSYS.as_usize());
    }

    #[test]
    fn unimplemented_entry_reports_enosys() {
        // savetls (2) is a known stub.
        let result = dispatch(2, [0; 6]);
        assert_eq!(result.error, Errno::ENOSYS.as_usize());
    }

    #[test]
    fn every_number_dispatches_or_reports_enosys() {
        let _env = crate::mm::testing::env();
        // Totality: walking the entire table with null arguments must
        // never touch memory it should not; handlers see null user
        // pointers and report errors instead. A few syscalls (exit,
        // fork, execve) need a current thread and are skipped here.
        for num in 0..SYSCALL_TABLE.len() {
            if matches!(num, 0 | 15 | 16 | 17) {
                continue;
            }
            let _ = dispatch(num, [0; 6]);
        }
    }

    #[test]
    fn table_numbers_are_stable() {
        assert_eq!(SYSCALL_TABLE[0].name, "exit");
        assert_eq!(SYSCALL_TABLE[12].name, "mmap");
        assert_eq!(SYSCALL_TABLE[15].name, "execve");
        assert_eq!(SYSCALL_TABLE[16].name, "fork");
        assert_eq!(SYSCALL_TABLE[26].name, "openat");
        assert_eq!(SYSCALL_TABLE[30].name, "faccessat");
        assert_eq!(SYSCALL_TABLE[36].name, "mkdirat");
        assert_eq!(SYSCALL_TABLE[60].name, "futex_wait");
    }
}
