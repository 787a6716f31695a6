//! execve
//!
//! Replaces the calling thread's process image in place: a new page map,
//! the ELF (and optional interpreter) loaded into it, a fresh user stack
//! carrying the argv/envp image, and the thread's saved context reset to
//! the new entry point. The pid, descriptor table and process identity
//! survive.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, sync::Arc, vec::Vec};

use core::sync::atomic::Ordering;

use super::{thread, AddressSpace};
use crate::arch::Context;
use crate::elf::types::{AT_BASE, AT_ENTRY, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM};
use crate::elf::ElfInfo;
use crate::error::Errno;
use crate::mm::page_map::PageMap;
use crate::mm::{
    align_down, PhysAddr, VirtAddr, USER_INTERP_BASE, USER_MAP_BASE, USER_STACK_SIZE,
    USER_STACK_TOP,
};

/// Execute `path` in the current process. On success the calling thread's
/// saved context enters the new image at the next reschedule; on failure
/// the old image is untouched.
pub fn execve(path: &str, argv: &[String], envp: &[String]) -> Result<(), Errno> {
    crate::sched::pause();

    let Some(mut thread_ptr) = thread::current() else {
        return Err(Errno::ESRCH);
    };
    // SAFETY: the current thread and its process are live; interrupts are
    // off, so nothing else mutates them on this CPU.
    let thread_ref = unsafe { thread_ptr.as_mut() };
    let process = thread_ref.process();

    // Resolve the image. Anything that is not a readable file is ENOEXEC.
    let cwd = process.working_dir.lock().clone();
    let node = crate::fs::lookup(&cwd, path).map_err(|_| Errno::ENOENT)?;
    let ops = node.ops.clone().ok_or(Errno::ENOEXEC)?;

    // Build the replacement address space completely before touching the
    // process. A failed load only costs us the new map.
    let map = Arc::new(PageMap::new().map_err(Errno::from)?);
    let info = crate::elf::load(&map, ops.as_ref(), 0).map_err(|_| Errno::ENOEXEC)?;
    // With an interpreter the thread enters the interpreter; the auxv
    // tells it where the main image lives.
    let (entry, interp_base) = match info.interpreter {
        Some(ref interp) => {
            let interp_node = crate::fs::lookup(&crate::fs::root(), interp)
                .map_err(|_| Errno::ENOENT)?;
            let interp_ops = interp_node.ops.clone().ok_or(Errno::ENOEXEC)?;
            let interp_info = crate::elf::load(&map, interp_ops.as_ref(), USER_INTERP_BASE)
                .map_err(|_| Errno::ENOEXEC)?;
            (interp_info.entry, Some(USER_INTERP_BASE))
        }
        None => (info.entry, None),
    };

    // Point of no return: install the new image.
    *process.address_space.lock() = AddressSpace::User(map.clone());
    process.map_base.store(USER_MAP_BASE, Ordering::Release);
    process.stack_top.store(USER_STACK_TOP, Ordering::Release);
    if let Some(parent_dir) = node.parent() {
        *process.working_dir.lock() = parent_dir;
    }
    process.set_state(super::ProcessState::Ready);

    // Fresh user stack with the initial argument image.
    let (stack_top, stack_phys) =
        thread::map_user_stack(thread_ref.process).map_err(Errno::from)?;
    let stack_pointer =
        build_initial_stack(stack_phys, stack_top, argv, envp, &info, interp_base)?;

    // The thread restarts at the new entry with a clean register file.
    thread_ref.context = Context::new_user(VirtAddr::new(entry), stack_pointer);
    thread_ref.extra = Default::default();
    thread_ref.user_stack = stack_pointer.as_u64();
    thread_ref.stack_phys = Some(stack_phys);
    thread_ref.is_user = true;
    // The next switch must resume this context, not write the trap frame
    // of the execve syscall over it.
    thread_ref.fresh_context = true;

    let cpu = crate::arch::cpu::current();
    cpu.user_stack.store(stack_pointer.as_u64(), Ordering::Release);

    map.set_active();
    crate::sched::invoke();
    Ok(())
}

/// Lay out the initial user stack.
///
/// Ascending from the returned stack pointer: argc, argv pointers, NULL,
/// envp pointers, NULL, then the auxv (AT_PHDR/AT_PHENT/AT_PHNUM/
/// AT_ENTRY, AT_BASE when an interpreter is loaded) closed by the
/// AT_NULL pair. Images without a program-header address get the bare
/// terminator. The argv/envp string bytes live above that, just under
/// the stack top, and the pointer area starts 16-byte aligned.
fn build_initial_stack(
    stack_phys: PhysAddr,
    stack_top: VirtAddr,
    argv: &[String],
    envp: &[String],
    info: &ElfInfo,
    interp_base: Option<u64>,
) -> Result<VirtAddr, Errno> {
    let stack_bottom = stack_top.as_u64() - USER_STACK_SIZE as u64;
    let base = stack_phys.as_ptr();
    let mut pos = USER_STACK_SIZE;

    let mut write_string = |pos: &mut usize, s: &String| -> u64 {
        let len = s.len() + 1;
        *pos -= len;
        // SAFETY: pos stays within the freshly allocated stack block.
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), base.add(*pos), s.len());
            base.add(*pos + s.len()).write(0);
        }
        stack_bottom + *pos as u64
    };

    let mut envp_addrs: Vec<u64> = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        envp_addrs.push(write_string(&mut pos, s));
    }
    envp_addrs.reverse();

    let mut argv_addrs: Vec<u64> = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        argv_addrs.push(write_string(&mut pos, s));
    }
    argv_addrs.reverse();

    // Word-granular area, 16-byte aligned.
    pos = align_down(pos, 16);
    if pos < 256 {
        // The argument image alone overflowed the stack.
        return Err(Errno::ENOMEM);
    }

    let mut push = |pos: &mut usize, value: u64| {
        *pos -= 8;
        // SAFETY: as in write_string.
        unsafe {
            (base.add(*pos) as *mut u64).write(value);
        }
    };

    // auxv. The interpreter bootstraps from these; without a recorded
    // program-header address there is nothing to describe and only the
    // terminator goes down.
    let mut auxv: Vec<(u64, u64)> = Vec::new();
    if info.phdr_vaddr != 0 {
        auxv.push((AT_PHDR, info.phdr_vaddr));
        auxv.push((AT_PHENT, info.phentsize as u64));
        auxv.push((AT_PHNUM, info.phnum as u64));
        auxv.push((AT_ENTRY, info.entry));
        if let Some(interp_base) = interp_base {
            auxv.push((AT_BASE, interp_base));
        }
    }
    // Terminator pair lies deepest; each entry is (type, value) in
    // ascending memory order.
    push(&mut pos, 0);
    push(&mut pos, AT_NULL);
    for &(auxv_type, auxv_value) in auxv.iter().rev() {
        push(&mut pos, auxv_value);
        push(&mut pos, auxv_type);
    }

    push(&mut pos, 0); // envp NULL
    for &addr in envp_addrs.iter().rev() {
        push(&mut pos, addr);
    }
    push(&mut pos, 0); // argv NULL
    for &addr in argv_addrs.iter().rev() {
        push(&mut pos, addr);
    }
    push(&mut pos, argv.len() as u64); // argc

    Ok(VirtAddr::new(stack_bottom + pos as u64))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use alloc::string::ToString;

    use super::*;
    use crate::mm::{phys, testing, PAGE_SIZE};

    #[test]
    fn initial_stack_matches_sysv_image() {
        let _env = testing::env();
        let pages = USER_STACK_SIZE / PAGE_SIZE;
        let stack_phys = phys::alloc(pages).expect("stack frames");
        let stack_top = VirtAddr::new(crate::mm::USER_STACK_TOP);

        let argv = ["hello".to_string()];
        let envp: [String; 0] = [];
        // A minimal image with no recorded program-header address gets
        // the bare AT_NULL terminator.
        let sp = build_initial_stack(
            stack_phys,
            stack_top,
            &argv,
            &envp,
            &ElfInfo::default(),
            None,
        )
        .expect("stack image");

        // Read the words back through physical memory.
        let offset = (sp.as_u64() - (stack_top.as_u64() - USER_STACK_SIZE as u64)) as usize;
        let words = unsafe {
            core::slice::from_raw_parts(stack_phys.as_ptr().add(offset) as *const u64, 6)
        };
        assert_eq!(words[0], 1, "argc");
        assert_eq!(words[2], 0, "argv terminator");
        assert_eq!(words[3], 0, "envp terminator");
        assert_eq!(words[4], 0, "auxv AT_NULL (type)");
        assert_eq!(words[5], 0, "auxv AT_NULL (value)");

        // argv[0] points at the string "hello\0" inside the stack.
        let argv0 = words[1];
        assert!(argv0 > sp.as_u64() && argv0 < stack_top.as_u64());
        let str_off = (argv0 - (stack_top.as_u64() - USER_STACK_SIZE as u64)) as usize;
        let bytes =
            unsafe { core::slice::from_raw_parts(stack_phys.as_ptr().add(str_off), 6) };
        assert_eq!(bytes, b"hello\0");

        // Six words below the aligned string base keep sp 16-byte aligned.
        assert_eq!(sp.as_u64() % 16, 0);
        phys::free(stack_phys, pages);
    }

    #[test]
    fn auxv_describes_image_for_the_interpreter() {
        let _env = testing::env();
        let pages = USER_STACK_SIZE / PAGE_SIZE;
        let stack_phys = phys::alloc(pages).expect("stack frames");
        let stack_top = VirtAddr::new(crate::mm::USER_STACK_TOP);

        let info = ElfInfo {
            entry: 0x40_1000,
            phdr_vaddr: 0x40_0040,
            phentsize: 56,
            phnum: 7,
            interpreter: Some("/lib/ld.so".to_string()),
        };
        let sp = build_initial_stack(
            stack_phys,
            stack_top,
            &[],
            &[],
            &info,
            Some(USER_INTERP_BASE),
        )
        .expect("stack image");

        let offset = (sp.as_u64() - (stack_top.as_u64() - USER_STACK_SIZE as u64)) as usize;
        let words = unsafe {
            core::slice::from_raw_parts(stack_phys.as_ptr().add(offset) as *const u64, 15)
        };
        assert_eq!(words[0], 0, "argc");
        assert_eq!(words[1], 0, "argv terminator");
        assert_eq!(words[2], 0, "envp terminator");
        // (type, value) pairs in ascending order, AT_NULL last.
        assert_eq!(&words[3..5], &[AT_PHDR, 0x40_0040]);
        assert_eq!(&words[5..7], &[AT_PHENT, 56]);
        assert_eq!(&words[7..9], &[AT_PHNUM, 7]);
        assert_eq!(&words[9..11], &[AT_ENTRY, 0x40_1000]);
        assert_eq!(&words[11..13], &[AT_BASE, USER_INTERP_BASE]);
        assert_eq!(&words[13..15], &[AT_NULL, 0]);

        phys::free(stack_phys, pages);
    }
}
