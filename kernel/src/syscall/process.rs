//! Process system calls

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, sync::Arc, vec::Vec};

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use super::SyscallResult;
use crate::error::Errno;
use crate::mm::page_map::PageMap;
use crate::mm::{usercopy, VirtAddr};
use crate::process::{self, thread, ProcessState};

/// Longest argv/envp vector `execve` accepts.
const ARG_MAX_ENTRIES: usize = 512;
/// Longest single argument string.
const ARG_MAX_STRLEN: usize = 4096;

pub(super) fn current_process() -> Result<NonNull<process::Process>, Errno> {
    process::current().ok_or(Errno::ESRCH)
}

pub(super) fn current_user_map() -> Result<Arc<PageMap>, Errno> {
    let process = current_process()?;
    // SAFETY: the current process is live.
    let proc_ref = unsafe { process.as_ref() };
    let space = proc_ref.address_space.lock();
    space.user_map().cloned().ok_or(Errno::EFAULT)
}

pub fn sys_exit(code: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    match current_process() {
        Ok(process) => {
            process::kill(process, code as i32);
            SyscallResult::ok(0)
        }
        Err(errno) => SyscallResult::err(errno),
    }
}

pub fn sys_fork(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        let thread_ptr = thread::current().ok_or(Errno::ESRCH)?;
        // SAFETY: the current thread is live; its context was saved by the
        // trap entry before dispatch.
        let invoking = unsafe { thread_ptr.as_ref() };
        process::fork(process, invoking).map_err(Errno::from)
    })();
    result.into()
}

/// Read a NULL-terminated vector of user string pointers.
fn read_string_vec(map: &PageMap, base: usize) -> Result<Vec<String>, Errno> {
    let mut strings = Vec::new();
    if base == 0 {
        return Ok(strings);
    }
    for index in 0..ARG_MAX_ENTRIES {
        let mut raw = [0u8; 8];
        usercopy::copy_from_user(
            map,
            VirtAddr::new(base as u64 + (index * 8) as u64),
            &mut raw,
        )?;
        let pointer = u64::from_ne_bytes(raw);
        if pointer == 0 {
            return Ok(strings);
        }
        strings.push(usercopy::string_from_user(
            map,
            VirtAddr::new(pointer),
            ARG_MAX_STRLEN,
        )?);
    }
    Err(Errno::ERANGE)
}

pub fn sys_execve(
    path_ptr: usize,
    argv_ptr: usize,
    envp_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let map = current_user_map()?;
        let path = usercopy::string_from_user(&map, VirtAddr::new(path_ptr as u64), 4096)?;
        let argv = read_string_vec(&map, argv_ptr)?;
        let envp = read_string_vec(&map, envp_ptr)?;
        process::exec::execve(&path, &argv, &envp)?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_kill(pid: usize, signal: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let Some(victim) = process::by_pid(pid) else {
        return SyscallResult::err(Errno::ESRCH);
    };
    // SAFETY: by_pid returns live (or hanged, not yet reaped) processes.
    if unsafe { victim.as_ref() }.state() == ProcessState::Dead {
        return SyscallResult::err(Errno::ESRCH);
    }
    process::kill(victim, 128 + signal as i32);
    SyscallResult::ok(0)
}

pub fn sys_getpid(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    match current_process() {
        // SAFETY: live process.
        Ok(process) => SyscallResult::ok(unsafe { process.as_ref() }.pid),
        Err(errno) => SyscallResult::err(errno),
    }
}

pub fn sys_gettid(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    match thread::current() {
        // SAFETY: live thread.
        Some(t) => SyscallResult::ok(unsafe { t.as_ref() }.tid),
        None => SyscallResult::err(Errno::ESRCH),
    }
}

pub fn sys_getppid(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    match current_process() {
        Ok(process) => {
            // SAFETY: live process.
            let parent = unsafe { process.as_ref() }.parent.lock().unwrap_or(0);
            SyscallResult::ok(parent)
        }
        Err(errno) => SyscallResult::err(errno),
    }
}

/// Collect a dead child's return code. Does not block: EAGAIN while the
/// child is still running, ECHILD when there is nothing to wait for.
pub fn sys_waitpid(
    pid: usize,
    status_ptr: usize,
    _flags: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        let children: Vec<process::Pid> = proc_ref.children.lock().clone();
        if children.is_empty() {
            return Err(Errno::ECHILD);
        }

        let wanted: Vec<process::Pid> = if pid == usize::MAX {
            children
        } else if children.contains(&pid) {
            alloc::vec![pid]
        } else {
            return Err(Errno::ECHILD);
        };

        for child_pid in wanted {
            let Some(child) = process::by_pid(child_pid) else {
                continue;
            };
            // SAFETY: not reaped while its parent has not collected it.
            let child_ref = unsafe { child.as_ref() };
            if child_ref.state() == ProcessState::Dead
                && !child_ref.waited.load(Ordering::Acquire)
            {
                let code = child_ref.return_code.load(Ordering::Acquire);
                if status_ptr != 0 {
                    let map = current_user_map()?;
                    usercopy::copy_to_user(
                        &map,
                        VirtAddr::new(status_ptr as u64),
                        &code.to_ne_bytes(),
                    )?;
                }
                child_ref.waited.store(true, Ordering::Release);
                return Ok(child_pid);
            }
        }
        Err(Errno::EAGAIN)
    })();
    result.into()
}

pub fn sys_sigprocmask(
    how: usize,
    set_ptr: usize,
    old_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    const SIG_BLOCK: usize = 0;
    const SIG_UNBLOCK: usize = 1;
    const SIG_SETMASK: usize = 2;

    let result = (|| {
        let mut thread_ptr = thread::current().ok_or(Errno::ESRCH)?;
        // SAFETY: this CPU owns its current thread.
        let t = unsafe { thread_ptr.as_mut() };

        if old_ptr != 0 {
            let map = current_user_map()?;
            usercopy::copy_to_user(
                &map,
                VirtAddr::new(old_ptr as u64),
                &t.sigmask.to_ne_bytes(),
            )?;
        }
        if set_ptr != 0 {
            let map = current_user_map()?;
            let mut raw = [0u8; 8];
            usercopy::copy_from_user(&map, VirtAddr::new(set_ptr as u64), &mut raw)?;
            let set = u64::from_ne_bytes(raw);
            t.sigmask = match how {
                SIG_BLOCK => t.sigmask | set,
                SIG_UNBLOCK => t.sigmask & !set,
                SIG_SETMASK => set,
                _ => return Err(Errno::EINVAL),
            };
        }
        Ok(0)
    })();
    result.into()
}

pub fn sys_sigpending(
    set_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        // Nothing queues signals yet; the pending set is empty.
        let map = current_user_map()?;
        usercopy::copy_to_user(&map, VirtAddr::new(set_ptr as u64), &0u64.to_ne_bytes())?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_sigaction(
    signal: usize,
    action_ptr: usize,
    old_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        if signal >= 64 {
            return Err(Errno::EINVAL);
        }
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        let map = current_user_map()?;

        if old_ptr != 0 {
            let current = proc_ref.sigactions.lock()[signal];
            usercopy::copy_to_user(&map, VirtAddr::new(old_ptr as u64), &current.to_ne_bytes())?;
        }
        if action_ptr != 0 {
            let mut raw = [0u8; 8];
            usercopy::copy_from_user(&map, VirtAddr::new(action_ptr as u64), &mut raw)?;
            proc_ref.sigactions.lock()[signal] = u64::from_ne_bytes(raw);
        }
        Ok(0)
    })();
    result.into()
}
