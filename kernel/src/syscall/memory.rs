//! Memory system calls
//!
//! Mappings are eager: `mmap` allocates and maps every page up front, and
//! `munmap` returns the frames. Addresses come from the per-process
//! mapping watermark unless MAP_FIXED pins them.

use core::sync::atomic::Ordering;

use super::process::{current_process, current_user_map};
use super::SyscallResult;
use crate::error::Errno;
use crate::mm::page_map::{VmFlags, VmLevel, VmProt};
use crate::mm::{align_up, phys, PhysAddr, VirtAddr, PAGE_SIZE};

const PROT_READ: usize = 1;
const PROT_WRITE: usize = 2;
const PROT_EXEC: usize = 4;

const MAP_FIXED: usize = 0x10;

fn prot_from_user(prot: usize) -> VmProt {
    let mut vm_prot = VmProt::empty();
    if prot & PROT_READ != 0 {
        vm_prot |= VmProt::READ;
    }
    if prot & PROT_WRITE != 0 {
        vm_prot |= VmProt::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        vm_prot |= VmProt::EXEC;
    }
    vm_prot
}

pub fn sys_mmap(
    hint: usize,
    length: usize,
    prot: usize,
    flags: usize,
    _fd: usize,
    _offset: usize,
) -> SyscallResult {
    let result = (|| {
        if length == 0 {
            return Err(Errno::EINVAL);
        }
        let process = current_process()?;
        let map = current_user_map()?;
        // SAFETY: live process.
        let proc_ref = unsafe { process.as_ref() };

        let length = align_up(length, PAGE_SIZE);
        let pages = length / PAGE_SIZE;

        let base = if flags & MAP_FIXED != 0 && hint != 0 {
            crate::mm::align_down(hint, PAGE_SIZE)
        } else {
            proc_ref
                .map_base
                .fetch_add(length as u64, Ordering::SeqCst) as usize
        };
        let base_va = VirtAddr::new(base as u64);
        if !base_va.is_user() {
            return Err(Errno::EINVAL);
        }

        let vm_prot = prot_from_user(prot);
        for page in 0..pages {
            let frame = phys::alloc_zeroed(1).map_err(Errno::from)?;
            let va = VirtAddr::new(base_va.as_u64() + (page * PAGE_SIZE) as u64);
            // Replace whatever was there for MAP_FIXED.
            let _ = map.unmap(va);
            if map.map(frame, va, vm_prot, VmFlags::USER, VmLevel::Small).is_err() {
                phys::free(frame, 1);
                return Err(Errno::ENOMEM);
            }
        }
        Ok(base)
    })();
    result.into()
}

pub fn sys_munmap(
    addr: usize,
    length: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        if length == 0 || addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let map = current_user_map()?;
        let pages = align_up(length, PAGE_SIZE) / PAGE_SIZE;
        for page in 0..pages {
            let va = VirtAddr::new((addr + page * PAGE_SIZE) as u64);
            if let Some(pa) = map.translate(va) {
                if map.unmap(va).is_ok() {
                    phys::free(
                        PhysAddr::new(pa.as_u64() & !(PAGE_SIZE as u64 - 1)),
                        1,
                    );
                }
            }
        }
        Ok(0)
    })();
    result.into()
}

pub fn sys_mprotect(
    addr: usize,
    length: usize,
    prot: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        if length == 0 || addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let map = current_user_map()?;
        let vm_prot = prot_from_user(prot);
        let pages = align_up(length, PAGE_SIZE) / PAGE_SIZE;
        for page in 0..pages {
            let va = VirtAddr::new((addr + page * PAGE_SIZE) as u64);
            map.protect(va, vm_prot).map_err(|_| Errno::ENOMEM)?;
        }
        Ok(0)
    })();
    result.into()
}

/// Grow or shrink a mapping. Growing relocates to a fresh range and
/// copies the page contents; shrinking trims the tail in place.
pub fn sys_mremap(
    old_addr: usize,
    old_length: usize,
    new_length: usize,
    _flags: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        if old_length == 0 || new_length == 0 || old_addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let old_pages = align_up(old_length, PAGE_SIZE) / PAGE_SIZE;
        let new_pages = align_up(new_length, PAGE_SIZE) / PAGE_SIZE;

        if new_pages <= old_pages {
            if new_pages < old_pages {
                let tail = old_addr + new_pages * PAGE_SIZE;
                let trimmed = (old_pages - new_pages) * PAGE_SIZE;
                let trim = sys_munmap(tail, trimmed, 0, 0, 0, 0);
                if trim.error != 0 {
                    return Err(Errno::EINVAL);
                }
            }
            return Ok(old_addr);
        }

        let map = current_user_map()?;
        let mapped = sys_mmap(0, new_pages * PAGE_SIZE, PROT_READ | PROT_WRITE, 0, 0, 0);
        if mapped.error != 0 {
            return Err(Errno::ENOMEM);
        }
        let new_addr = mapped.value;

        for page in 0..old_pages {
            let src = map
                .translate(VirtAddr::new((old_addr + page * PAGE_SIZE) as u64))
                .ok_or(Errno::EFAULT)?;
            let dst = map
                .translate(VirtAddr::new((new_addr + page * PAGE_SIZE) as u64))
                .ok_or(Errno::EFAULT)?;
            // SAFETY: both frames were just resolved through the direct
            // map and do not overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), PAGE_SIZE);
            }
        }
        let unmapped = sys_munmap(old_addr, old_pages * PAGE_SIZE, 0, 0, 0, 0);
        if unmapped.error != 0 {
            return Err(Errno::EINVAL);
        }
        Ok(new_addr)
    })();
    result.into()
}
