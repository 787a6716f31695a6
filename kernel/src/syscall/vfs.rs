//! VFS system calls
//!
//! All of these go through the node/handle contract; none of them knows
//! what a filesystem is. User buffers are only touched through the
//! usercopy primitives.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, sync::Arc, vec};

use core::sync::atomic::Ordering;

use super::process::{current_process, current_user_map};
use super::SyscallResult;
use crate::error::Errno;
use crate::fs::{self, handle::TCGETS, VfsNode};
use crate::mm::{usercopy, VirtAddr};
use crate::process::fd::FileDescriptor;

/// Openat's "relative to the cwd" sentinel.
const AT_FDCWD: usize = usize::MAX - 99; // -100

const SEEK_SET: usize = 0;
const SEEK_CUR: usize = 1;
const SEEK_END: usize = 2;

const F_DUPFD: usize = 0;
const F_GETFL: usize = 3;
const F_SETFL: usize = 4;

/// Largest single read/write the kernel will buffer.
const IO_MAX: usize = 1 << 20;

fn read_user_path(path_ptr: usize) -> Result<String, Errno> {
    let map = current_user_map()?;
    usercopy::string_from_user(&map, VirtAddr::new(path_ptr as u64), 4096)
}

/// Resolve the directory a `*at` call is relative to.
fn resolve_at_base(dirfd: usize) -> Result<Arc<VfsNode>, Errno> {
    let process = current_process()?;
    // SAFETY: live process.
    let proc_ref = unsafe { process.as_ref() };
    if dirfd == AT_FDCWD {
        return Ok(proc_ref.working_dir.lock().clone());
    }
    let desc = proc_ref.files.get(dirfd)?;
    if !desc.node.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok(desc.node.clone())
}

pub fn sys_openat(
    dirfd: usize,
    path_ptr: usize,
    flags: usize,
    _mode: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let base = resolve_at_base(dirfd)?;
        let node = fs::lookup(&base, &path)?;
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        proc_ref
            .files
            .install(FileDescriptor::new(node, flags as u32), 0)
    })();
    result.into()
}

pub fn sys_close(fd: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        unsafe { process.as_ref() }.files.close(fd)?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_read(
    fd: usize,
    buf_ptr: usize,
    length: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        let ops = desc.node.ops.as_ref().ok_or(Errno::EISDIR)?;

        let length = length.min(IO_MAX);
        let mut buffer = vec![0u8; length];
        let offset = desc.offset.load(Ordering::Acquire);
        let read = ops.read(offset, &mut buffer)?;
        if read > 0 {
            let map = current_user_map()?;
            usercopy::copy_to_user(&map, VirtAddr::new(buf_ptr as u64), &buffer[..read])?;
        }
        desc.offset.fetch_add(read as u64, Ordering::AcqRel);
        Ok(read)
    })();
    result.into()
}

pub fn sys_write(
    fd: usize,
    buf_ptr: usize,
    length: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        let ops = desc.node.ops.as_ref().ok_or(Errno::EISDIR)?;

        let length = length.min(IO_MAX);
        let mut buffer = vec![0u8; length];
        if length > 0 {
            let map = current_user_map()?;
            usercopy::copy_from_user(&map, VirtAddr::new(buf_ptr as u64), &mut buffer)?;
        }
        let offset = desc.offset.load(Ordering::Acquire);
        let written = ops.write(offset, &buffer)?;
        desc.offset.fetch_add(written as u64, Ordering::AcqRel);
        Ok(written)
    })();
    result.into()
}

pub fn sys_seek(
    fd: usize,
    offset: usize,
    whence: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        let offset = offset as i64;
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => desc.offset.load(Ordering::Acquire) as i64,
            SEEK_END => desc.node.stat().st_size as i64,
            _ => return Err(Errno::EINVAL),
        };
        let target = base + offset;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        desc.offset.store(target as u64, Ordering::Release);
        Ok(target as usize)
    })();
    result.into()
}

pub fn sys_ioctl(
    fd: usize,
    request: usize,
    arg: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        let ops = desc.node.ops.as_ref().ok_or(Errno::ENOTTY)?;
        ops.ioctl(request, arg)
    })();
    result.into()
}

fn stat_to_user(node: &Arc<VfsNode>, out_ptr: usize) -> Result<usize, Errno> {
    let stat = node.stat();
    // SAFETY: Stat is repr(C) plain data.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &stat as *const _ as *const u8,
            core::mem::size_of::<fs::Stat>(),
        )
    };
    let map = current_user_map()?;
    usercopy::copy_to_user(&map, VirtAddr::new(out_ptr as u64), bytes)?;
    Ok(0)
}

pub fn sys_stat(
    path_ptr: usize,
    out_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let base = resolve_at_base(AT_FDCWD)?;
        let node = fs::lookup(&base, &path)?;
        stat_to_user(&node, out_ptr)
    })();
    result.into()
}

pub fn sys_fstat(
    fd: usize,
    out_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        stat_to_user(&desc.node, out_ptr)
    })();
    result.into()
}

pub fn sys_faccessat(
    dirfd: usize,
    path_ptr: usize,
    _amode: usize,
    _flags: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let base = resolve_at_base(dirfd)?;
        fs::lookup(&base, &path)?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_fcntl(
    fd: usize,
    command: usize,
    arg: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        let desc = proc_ref.files.get(fd)?;
        match command {
            F_DUPFD => proc_ref.files.install(desc, arg),
            F_GETFL => Ok(desc.flags.load(Ordering::Acquire) as usize),
            F_SETFL => {
                desc.flags.store(arg as u32, Ordering::Release);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    })();
    result.into()
}

/// Write the child names of a directory fd as consecutive nul-terminated
/// strings. The descriptor offset indexes the next child.
pub fn sys_readdir(
    fd: usize,
    buf_ptr: usize,
    length: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        if !desc.node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let names = desc.node.child_names();
        let mut out: alloc::vec::Vec<u8> = alloc::vec::Vec::new();
        let mut index = desc.offset.load(Ordering::Acquire) as usize;
        while index < names.len() {
            let name = names[index].as_bytes();
            if out.len() + name.len() + 1 > length {
                break;
            }
            out.extend_from_slice(name);
            out.push(0);
            index += 1;
        }
        desc.offset.store(index as u64, Ordering::Release);
        if !out.is_empty() {
            let map = current_user_map()?;
            usercopy::copy_to_user(&map, VirtAddr::new(buf_ptr as u64), &out)?;
        }
        Ok(out.len())
    })();
    result.into()
}

pub fn sys_getcwd(
    buf_ptr: usize,
    length: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let cwd = unsafe { process.as_ref() }.working_dir.lock().clone();
        let path = fs::path_of(&cwd);
        if path.len() + 1 > length {
            return Err(Errno::ERANGE);
        }
        let map = current_user_map()?;
        let mut bytes = alloc::vec::Vec::with_capacity(path.len() + 1);
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
        usercopy::copy_to_user(&map, VirtAddr::new(buf_ptr as u64), &bytes)?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_chdir(path_ptr: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        let base = proc_ref.working_dir.lock().clone();
        let node = fs::lookup(&base, &path)?;
        if !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        *proc_ref.working_dir.lock() = node;
        Ok(0)
    })();
    result.into()
}

pub fn sys_fchdir(fd: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };
        let desc = proc_ref.files.get(fd)?;
        if !desc.node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        *proc_ref.working_dir.lock() = desc.node.clone();
        Ok(0)
    })();
    result.into()
}

pub fn sys_mkdirat(
    dirfd: usize,
    path_ptr: usize,
    _mode: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let base = resolve_at_base(dirfd)?;
        let (parent, name) = split_parent(&base, &path)?;
        fs::create_dir(&parent, name)?;
        Ok(0)
    })();
    result.into()
}

pub fn sys_rmdirat(
    dirfd: usize,
    path_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    remove_common(dirfd, path_ptr, true)
}

pub fn sys_unlinkat(
    dirfd: usize,
    path_ptr: usize,
    _flags: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    remove_common(dirfd, path_ptr, false)
}

fn remove_common(dirfd: usize, path_ptr: usize, want_dir: bool) -> SyscallResult {
    let result = (|| {
        let path = read_user_path(path_ptr)?;
        let base = resolve_at_base(dirfd)?;
        let (parent, name) = split_parent(&base, &path)?;
        let node = parent.lookup_child(name).ok_or(Errno::ENOENT)?;
        if want_dir && !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !want_dir && node.is_dir() {
            return Err(Errno::EISDIR);
        }
        fs::remove_node(&parent, name)?;
        Ok(0)
    })();
    result.into()
}

/// Split `path` into its parent node and final component.
fn split_parent<'p>(
    base: &Arc<VfsNode>,
    path: &'p str,
) -> Result<(Arc<VfsNode>, &'p str), Errno> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Errno::EINVAL);
    }
    match trimmed.rfind('/') {
        Some(pos) => {
            let (dir, name) = trimmed.split_at(pos);
            let dir = if dir.is_empty() { "/" } else { dir };
            Ok((fs::lookup(base, dir)?, &name[1..]))
        }
        None => Ok((base.clone(), trimmed)),
    }
}

pub fn sys_umask(mask: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let previous = unsafe { process.as_ref() }
            .umask
            .swap(mask as u32 & 0o777, Ordering::AcqRel);
        Ok(previous as usize)
    })();
    result.into()
}

pub fn sys_isatty(fd: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let process = current_process()?;
        // SAFETY: live process.
        let desc = unsafe { process.as_ref() }.fd_to_ptr(fd)?;
        let ops = desc.node.ops.as_ref().ok_or(Errno::ENOTTY)?;
        match ops.ioctl(TCGETS, 0) {
            Ok(_) => Ok(1),
            Err(_) => Err(Errno::ENOTTY),
        }
    })();
    result.into()
}
