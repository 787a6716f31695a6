//! Threads
//!
//! A thread owns its kernel stack and saved CPU context; the owning
//! process is a weak back-reference. Threads live on exactly one of the
//! scheduler's intrusive lists (ready, hanging, sleeping); while Running,
//! the saved context is stale and the truth is in the registers until the
//! next trap writes it back.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{boxed::Box, vec};

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::Process;
use crate::arch::{Context, ThreadExtra};
use crate::error::KernelResult;
use crate::mm::page_map::{VmFlags, VmLevel, VmProt};
use crate::mm::{phys, PhysAddr, VirtAddr, KERNEL_STACK_SIZE, PAGE_SIZE, USER_STACK_SIZE};
use crate::sched::list::ListNode;

static TID_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing on some CPU.
    Running,
    /// Ready to be picked up.
    Ready,
    /// Waiting for a wake deadline.
    Sleeping,
    /// Waiting for an event (futex, blocking syscall).
    Waiting,
}

pub struct Thread {
    pub tid: usize,
    /// Ownership claim: held by the CPU running the thread or by whoever
    /// is mutating it (reaper vs. selector).
    claim: AtomicBool,
    pub state: ThreadState,
    /// Saved register state; authoritative only when state != Running.
    pub context: Context,
    /// FS/GS bases and FPU image (arch-specific).
    pub extra: ThreadExtra,
    /// Saved user stack pointer.
    pub user_stack: u64,
    /// Physical base of the initially allocated user stack, if any.
    pub stack_phys: Option<PhysAddr>,
    /// Exclusively owned kernel stack storage.
    kernel_stack: Box<[u8]>,
    /// Thread-local errno.
    pub errno: i32,
    /// The saved context was rebuilt (execve) and must not be overwritten
    /// by the next context-switch writeback.
    pub fresh_context: bool,
    /// Absolute wake time for Sleeping threads.
    pub wake_deadline_ns: u64,
    pub is_user: bool,
    /// Owning process (weak: the process tree owns processes, not us).
    pub process: NonNull<Process>,
    /// Intrusive link for the scheduler lists.
    next: Option<NonNull<Thread>>,
    /// Blocked-signal mask.
    pub sigmask: u64,
}

// SAFETY: threads are handed between CPUs by pointer; all mutation happens
// under the claim flag or the scheduler list locks.
unsafe impl Send for Thread {}

impl ListNode for Thread {
    fn next_link(&self) -> Option<NonNull<Self>> {
        self.next
    }
    fn set_next_link(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }
}

impl Thread {
    /// Top of the kernel stack (stacks grow down).
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::new(self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64)
    }

    /// Try to take the ownership claim.
    pub fn try_claim(&self) -> bool {
        self.claim
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the ownership claim.
    pub fn release_claim(&self) {
        self.claim.store(false, Ordering::Release);
    }

    /// The owning process.
    pub fn process(&self) -> &Process {
        // SAFETY: a process outlives its threads; threads are unlinked and
        // reaped before the process is destroyed.
        unsafe { self.process.as_ref() }
    }
}

/// Create a thread in `process` entering at `entry`, register it with the
/// scheduler, and return it.
pub fn create(
    mut process: NonNull<Process>,
    entry: VirtAddr,
    is_user: bool,
) -> KernelResult<NonNull<Thread>> {
    let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let kernel_top = VirtAddr::new(kernel_stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64);

    let (context, user_stack, stack_phys) = if is_user {
        let (stack_top, stack_phys) = map_user_stack(process)?;
        (
            Context::new_user(entry, stack_top),
            stack_top.as_u64(),
            Some(stack_phys),
        )
    } else {
        (
            Context::new_kernel(entry, kernel_top),
            kernel_top.as_u64(),
            None,
        )
    };

    let thread = Box::new(Thread {
        tid: TID_COUNTER.fetch_add(1, Ordering::Relaxed),
        claim: AtomicBool::new(false),
        state: ThreadState::Ready,
        context,
        extra: ThreadExtra::default(),
        user_stack,
        stack_phys,
        kernel_stack,
        errno: 0,
        fresh_context: false,
        wake_deadline_ns: 0,
        is_user,
        process,
        next: None,
        sigmask: 0,
    });
    let thread = NonNull::from(Box::leak(thread));

    // SAFETY: the process is live; we register the new thread with it.
    unsafe {
        process.as_mut().threads.lock().push(thread);
    }
    crate::sched::enqueue_ready(thread);
    Ok(thread)
}

/// Allocate and map a fresh user stack below the process's stack-top
/// watermark. Returns the initial stack pointer and the physical base.
pub fn map_user_stack(process: NonNull<Process>) -> KernelResult<(VirtAddr, PhysAddr)> {
    // SAFETY: the process is live for the duration of the call.
    let process = unsafe { process.as_ref() };
    let pages = USER_STACK_SIZE / PAGE_SIZE;
    let stack_phys = phys::alloc(pages)?;

    let stack_top = VirtAddr::new(process.stack_top.load(Ordering::Acquire));
    let stack_bottom = VirtAddr::new(stack_top.as_u64() - USER_STACK_SIZE as u64);
    {
        let space = process.address_space.lock();
        let map = space.page_map();
        for page in 0..pages {
            map.map(
                PhysAddr::new(stack_phys.as_u64() + (page * PAGE_SIZE) as u64),
                VirtAddr::new(stack_bottom.as_u64() + (page * PAGE_SIZE) as u64),
                VmProt::READ | VmProt::WRITE,
                VmFlags::USER,
                VmLevel::Small,
            )?;
        }
    }
    process
        .stack_top
        .store(stack_bottom.as_u64(), Ordering::Release);
    Ok((stack_top, stack_phys))
}

/// Copy `source`'s execution state into a new thread of `child`. The
/// child resumes at the instruction after the fork trap with a zero
/// syscall result.
pub fn fork_from(
    mut child: NonNull<Process>,
    source: &Thread,
) -> KernelResult<NonNull<Thread>> {
    let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();

    let mut context = source.context;
    context.set_syscall_result(0, 0);

    let thread = Box::new(Thread {
        tid: TID_COUNTER.fetch_add(1, Ordering::Relaxed),
        claim: AtomicBool::new(false),
        state: ThreadState::Ready,
        context,
        extra: source.extra.clone(),
        user_stack: source.user_stack,
        // The forked address space owns copies of the stack frames.
        stack_phys: None,
        kernel_stack,
        errno: 0,
        fresh_context: false,
        wake_deadline_ns: 0,
        is_user: source.is_user,
        process: child,
        next: None,
        sigmask: source.sigmask,
    });
    let thread = NonNull::from(Box::leak(thread));

    // SAFETY: the child process is live and being assembled.
    unsafe {
        child.as_mut().threads.lock().push(thread);
    }
    crate::sched::enqueue_ready(thread);
    Ok(thread)
}

/// Free a reaped thread. Kernel stack and FPU image go with the box; user
/// stack frames belong to the address space.
pub fn destroy(thread: NonNull<Thread>) {
    // SAFETY: the reaper holds the only reference; the thread is off all
    // lists and its process no longer knows it.
    unsafe { drop(Box::from_raw(thread.as_ptr())) };
}

/// The thread executing on this CPU.
pub fn current() -> Option<NonNull<Thread>> {
    crate::arch::cpu::current().current_thread()
}

/// Set errno on the current thread, if there is one.
pub fn set_errno(errno: crate::error::Errno) {
    if let Some(mut thread) = current() {
        // SAFETY: the current thread is owned by this CPU.
        unsafe { thread.as_mut().errno = errno.as_i32() };
    }
}

/// Put the current thread to sleep for at least `nanoseconds`.
pub fn sleep(nanoseconds: u64) {
    let deadline = crate::drivers::clock::now_ns() + nanoseconds;
    if let Some(thread) = current() {
        crate::sched::sleep_until(thread, deadline);
    }
}
