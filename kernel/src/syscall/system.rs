//! System information syscalls

use super::process::current_user_map;
use super::SyscallResult;
use crate::error::Errno;
use crate::mm::{usercopy, VirtAddr};

/// POSIX utsname: five fixed 65-byte fields.
#[repr(C)]
struct UtsName {
    sysname: [u8; 65],
    nodename: [u8; 65],
    release: [u8; 65],
    version: [u8; 65],
    machine: [u8; 65],
}

fn fill(field: &mut [u8; 65], value: &str) {
    let take = value.len().min(64);
    field[..take].copy_from_slice(&value.as_bytes()[..take]);
}

pub fn sys_uname(out_ptr: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    let result = (|| {
        let mut uts = UtsName {
            sysname: [0; 65],
            nodename: [0; 65],
            release: [0; 65],
            version: [0; 65],
            machine: [0; 65],
        };
        fill(&mut uts.sysname, "Obsidian");
        fill(&mut uts.nodename, "obsidian");
        fill(&mut uts.release, env!("CARGO_PKG_VERSION"));
        fill(&mut uts.version, "monolith");
        #[cfg(target_arch = "x86_64")]
        fill(&mut uts.machine, "x86_64");
        #[cfg(target_arch = "riscv64")]
        fill(&mut uts.machine, "riscv64");
        #[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
        fill(&mut uts.machine, "unknown");

        // SAFETY: UtsName is repr(C) plain bytes.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &uts as *const _ as *const u8,
                core::mem::size_of::<UtsName>(),
            )
        };
        let map = current_user_map()?;
        usercopy::copy_to_user(&map, VirtAddr::new(out_ptr as u64), bytes)?;
        Ok(0)
    })();
    result.into()
}

/// Architecture-specific thread controls (TLS base registers on x86_64).
pub fn sys_archctl(
    operation: usize,
    arg: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    const ARCHCTL_SET_FS: usize = 1;
    const ARCHCTL_GET_FS: usize = 2;
    const ARCHCTL_SET_GS: usize = 3;

    let result = (|| {
        #[cfg(target_arch = "x86_64")]
        {
            let mut thread_ptr = crate::process::thread::current().ok_or(Errno::ESRCH)?;
            // SAFETY: this CPU owns its current thread.
            let t = unsafe { thread_ptr.as_mut() };
            match operation {
                ARCHCTL_SET_FS => {
                    t.extra.fs_base = arg as u64;
                    crate::arch::thread_extra_restore(&t.extra);
                    Ok(0)
                }
                ARCHCTL_GET_FS => Ok(t.extra.fs_base as usize),
                ARCHCTL_SET_GS => {
                    t.extra.gs_base = arg as u64;
                    crate::arch::thread_extra_restore(&t.extra);
                    Ok(0)
                }
                _ => Err(Errno::EINVAL),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (operation, arg);
            Err(Errno::ENOSYS)
        }
    })();
    result.into()
}

pub fn sys_readtimer(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    SyscallResult::ok(crate::drivers::clock::now_ns() as usize)
}

/// uid/gid family: single-user system, everything is root.
pub fn sys_getuid(_: usize, _: usize, _: usize, _: usize, _: usize, _: usize) -> SyscallResult {
    SyscallResult::ok(0)
}
