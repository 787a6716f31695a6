//! Cross-subsystem scenarios
//!
//! Hosted renditions of the boot-to-userland flow: a user process built
//! from a real (hand-assembled) ELF, driven through the syscall dispatch
//! layer, with the scheduler and reaper doing the bookkeeping. The arch
//! layer is inert on the host, so "running" a thread means inspecting the
//! contexts and address spaces the kernel prepared.

#![cfg(all(test, not(target_os = "none")))]

extern crate alloc;
extern crate std;

use alloc::string::ToString;
use alloc::vec::Vec;

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::arch::cpu;
use crate::boot::BootFile;
use crate::drivers::console;
use crate::elf::test_image;
use crate::elf::types::EM_HOST;
use crate::error::Errno;
use crate::mm::{testing, VirtAddr};
use crate::process::{self, thread::Thread, ProcessState};
use crate::syscall::{self, SyscallResult};

const SYS_EXIT: usize = 0;
const SYS_FORK: usize = 16;
const SYS_WRITE: usize = 23;

/// Boot enough of the system for userland: VFS with `/init`, console,
/// and the process built from it. Returns the process and its thread.
fn boot_userland(path: &'static str, payload: &[u8]) -> (NonNull<process::Process>, NonNull<Thread>) {
    let image = test_image::single_load_image(EM_HOST, payload, 64);
    crate::fs::init(&[BootFile { data: image, path }]);
    console::init();

    let proc_ptr = process::create_elf("init", None, path).expect("userland process");
    // SAFETY: just created, single thread.
    let thread_ptr = unsafe { proc_ptr.as_ref().threads.lock()[0] };
    cpu::current().set_current_thread(thread_ptr.as_ptr());
    (proc_ptr, thread_ptr)
}

fn clear_current() {
    cpu::current().set_current_thread(core::ptr::null_mut());
}

fn run(num: usize, args: [usize; 6]) -> SyscallResult {
    syscall::dispatch(num, args)
}

#[test]
fn boot_to_userland_writes_and_exits() {
    let _env = testing::env();
    // The payload carries the bytes the program would pass to write().
    let (proc_ptr, _thread) = boot_userland("/init-write", b"hi");
    // SAFETY: live process.
    let pid = unsafe { proc_ptr.as_ref() }.pid;

    // write(1, "hi", 2): the string lives at the image's load address.
    let before = console::captured_output().len();
    let result = run(SYS_WRITE, [1, 0x1000, 2, 0, 0, 0]);
    assert_eq!(result.error, 0);
    assert_eq!(result.value, 2);
    let captured = console::captured_output();
    assert_eq!(&captured[before..], b"hi");

    // exit(0): the process goes Dead and is reaped within one pass once
    // collected.
    let result = run(SYS_EXIT, [0, 0, 0, 0, 0, 0]);
    assert_eq!(result.error, 0);
    // SAFETY: dead but not reaped (no parent has waited yet; init-level
    // processes are orphans and reap immediately).
    assert_eq!(unsafe { proc_ptr.as_ref() }.state(), ProcessState::Dead);
    assert_eq!(unsafe { proc_ptr.as_ref() }.return_code.load(Ordering::Acquire), 0);

    crate::sched::reap();
    assert!(process::by_pid(pid).is_none(), "reaped within one pass");
    clear_current();
}

#[test]
fn execve_preserves_pid_and_builds_stack() {
    let _env = testing::env();
    let (proc_ptr, thread_ptr) = boot_userland("/init-exec", b"first image");

    // Publish the replacement image.
    let hello = test_image::single_load_image(EM_HOST, b"hello machine code", 0);
    crate::fs::init(&[BootFile {
        data: hello,
        path: "/bin/hello",
    }]);

    // SAFETY: live process/thread.
    let pid_before = unsafe { proc_ptr.as_ref() }.pid;
    let root_before = unsafe { proc_ptr.as_ref() }.page_map_root();

    process::exec::execve("/bin/hello", &["hello".to_string()], &[]).expect("execve");

    let proc_ref = unsafe { proc_ptr.as_ref() };
    assert_eq!(proc_ref.pid, pid_before, "pid survives execve");
    assert_ne!(proc_ref.page_map_root(), root_before, "page map replaced");

    // The thread restarts at the new image's entry point.
    let thread_ref = unsafe { thread_ptr.as_ref() };
    assert!(thread_ref.fresh_context);
    #[cfg(target_arch = "x86_64")]
    assert_eq!(thread_ref.context.rip, 0x1000);

    // Initial stack image: {argc, argv[0], 0, 0}, then the AT_NULL pair.
    let stack_phys = thread_ref.stack_phys.expect("fresh user stack");
    let sp = thread_ref.user_stack;
    let stack_bottom = crate::mm::USER_STACK_TOP - crate::mm::USER_STACK_SIZE as u64;
    let offset = (sp - stack_bottom) as usize;
    let words = unsafe {
        core::slice::from_raw_parts(stack_phys.as_ptr().add(offset) as *const u64, 6)
    };
    assert_eq!(words[0], 1, "argc");
    assert_ne!(words[1], 0, "argv[0]");
    assert_eq!(words[2], 0, "argv terminator");
    assert_eq!(words[3], 0, "envp terminator");
    assert_eq!(words[4], 0);
    assert_eq!(words[5], 0);

    // The new map translates the stack pointer and the entry page.
    let space = proc_ref.address_space.lock();
    let map = space.page_map();
    assert!(map.translate(VirtAddr::new(sp)).is_some());
    assert!(map.translate(VirtAddr::new(0x1000)).is_some());
    drop(space);

    clear_current();
}

#[test]
fn fork_returns_child_pid_and_isolates_memory() {
    let _env = testing::env();
    let (proc_ptr, thread_ptr) = boot_userland("/init-fork", b"fork me");
    // SAFETY: live process.
    let parent_pid = unsafe { proc_ptr.as_ref() }.pid;

    let result = run(SYS_FORK, [0; 6]);
    assert_eq!(result.error, 0);
    let child_pid = result.value;
    assert_ne!(child_pid, parent_pid);

    let child = process::by_pid(child_pid).expect("child exists");
    // SAFETY: live child.
    let child_ref = unsafe { child.as_ref() };
    assert_eq!(*child_ref.parent.lock(), Some(parent_pid));
    assert_ne!(
        child_ref.page_map_root(),
        unsafe { proc_ptr.as_ref() }.page_map_root()
    );

    // The child's sole thread resumes with a zero syscall result.
    let child_thread = child_ref.threads.lock()[0];
    // SAFETY: live thread.
    let child_ctx = unsafe { &child_thread.as_ref().context };
    #[cfg(target_arch = "x86_64")]
    assert_eq!(child_ctx.rax, 0);

    // Writes land in different frames: the same VA maps differently.
    let parent_space = unsafe { proc_ptr.as_ref() }.address_space.lock();
    let parent_pa = parent_space
        .page_map()
        .translate(VirtAddr::new(0x1000))
        .expect("parent mapping");
    drop(parent_space);
    let child_space = child_ref.address_space.lock();
    let child_pa = child_space
        .page_map()
        .translate(VirtAddr::new(0x1000))
        .expect("child mapping");
    drop(child_space);
    assert_ne!(parent_pa, child_pa);

    unsafe { parent_pa.as_ptr().write(0x11) };
    unsafe { child_pa.as_ptr().write(0x22) };
    assert_eq!(unsafe { parent_pa.as_ptr().read() }, 0x11);
    assert_eq!(unsafe { child_pa.as_ptr().read() }, 0x22);

    clear_current();
}

#[test]
fn unhandled_user_trap_kills_only_that_process() {
    let _env = testing::env();
    // The bystander doubles as the victim's parent, which also keeps the
    // dead victim observable until it is waited on.
    let (bystander, _bystander_thread) = boot_userland("/init-fault", b"doomed");
    let victim =
        process::create_elf("victim", Some(bystander), "/init-fault").expect("second process");
    // SAFETY: just created, single thread.
    let victim_thread = unsafe { victim.as_ref().threads.lock()[0] };
    cpu::current().set_current_thread(victim_thread.as_ptr());
    // SAFETY: live processes.
    let victim_pid = unsafe { victim.as_ref() }.pid;
    let bystander_pid = unsafe { bystander.as_ref() }.pid;

    // A trap with no registered handler arrives from user mode.
    let mut ctx = unsafe { victim_thread.as_ref() }.context;
    assert!(ctx.from_user());
    let resumed = crate::irq::int_handler(0xEE, &mut ctx);

    assert_eq!(unsafe { victim.as_ref() }.state(), ProcessState::Dead);
    assert_eq!(
        unsafe { bystander.as_ref() }.state(),
        ProcessState::Ready,
        "pid {} unaffected by pid {}'s fault",
        bystander_pid,
        victim_pid
    );

    // The dispatcher handed back some runnable context (host: possibly
    // the one we passed in when nothing else was claimable).
    assert!(!resumed.is_null());
    // Undo whatever selection bookkeeping happened.
    if let Some(picked) = cpu::current().current_thread() {
        // SAFETY: the thread was claimed by reschedule just now.
        unsafe {
            picked.as_ptr().as_mut().unwrap().state =
                crate::process::thread::ThreadState::Ready;
        }
        unsafe { picked.as_ref() }.release_claim();
    }
    clear_current();
}

#[test]
fn mmap_rejects_zero_length_and_returns_frames_on_unmap() {
    let _env = testing::env();
    let (_proc, _thread) = boot_userland("/init-mmap", b"mm");

    const SYS_MMAP: usize = 12;
    const SYS_MUNMAP: usize = 13;

    // mmap(len = 0) is MAP_FAILED with EINVAL.
    let result = run(SYS_MMAP, [0, 0, 3, 0, 0, 0]);
    assert_eq!(result.error, Errno::EINVAL.as_usize());

    // Warm up the watermark region so the page-table frames for it are
    // already allocated and the delta below is leaves only.
    let warmup = run(SYS_MMAP, [0, 4096, 3, 0, 0, 0]);
    assert_eq!(warmup.error, 0);

    // A real mapping takes frames; unmapping gives them back.
    let free_before = crate::mm::phys::free_page_count();
    let mapped = run(SYS_MMAP, [0, 4 * 4096, 3, 0, 0, 0]);
    assert_eq!(mapped.error, 0);
    assert_eq!(crate::mm::phys::free_page_count(), free_before - 4);

    let unmapped = run(SYS_MUNMAP, [mapped.value, 4 * 4096, 0, 0, 0, 0]);
    assert_eq!(unmapped.error, 0);
    assert_eq!(crate::mm::phys::free_page_count(), free_before);

    clear_current();
}

#[test]
fn write_through_bad_pointer_faults_without_side_effects() {
    let _env = testing::env();
    let (_proc, thread_ptr) = boot_userland("/init-badptr", b"payload");

    // An address the process never mapped.
    let bad_pointer = 0x5F00_0000usize;
    let before: Vec<u8> = console::captured_output();
    let result = run(SYS_WRITE, [1, bad_pointer, 10, 0, 0, 0]);
    assert_eq!(result.error, Errno::EFAULT.as_usize());
    assert_eq!(console::captured_output(), before, "no bytes written");
    // errno mirrors the failure on the calling thread.
    // SAFETY: live thread.
    assert_eq!(unsafe { thread_ptr.as_ref() }.errno, Errno::EFAULT.as_i32());

    clear_current();
}
