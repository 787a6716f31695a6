//! Scheduler
//!
//! Round-robin over a global ready list: each CPU's dispatch loop is
//! driven by the timer interrupt, picks the first claimable Ready thread
//! after the one it just ran, and jumps into its saved context. Dead
//! threads and processes hang on reaper lists and are freed exactly once
//! by whichever CPU wins the reaper lock on its next pass. There is no
//! work stealing; any CPU may pick any ready thread, serialized by the
//! per-thread claim.

pub mod list;

use list::ListNode;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::arch::{self, cpu, Context};
use crate::process::thread::{self, Thread, ThreadState};
use crate::process::{self, Process, ProcessState};
use list::IntrusiveList;

static THREADS: Mutex<IntrusiveList<Thread>> = Mutex::new(IntrusiveList::new());
static HANGING_THREADS: Mutex<IntrusiveList<Thread>> = Mutex::new(IntrusiveList::new());
static SLEEPING_THREADS: Mutex<IntrusiveList<Thread>> = Mutex::new(IntrusiveList::new());

static PROCESSES: Mutex<IntrusiveList<Process>> = Mutex::new(IntrusiveList::new());
static HANGING_PROCESSES: Mutex<IntrusiveList<Process>> = Mutex::new(IntrusiveList::new());

/// Whoever wins this does the reaping on this pass.
static REAPER_LOCK: AtomicBool = AtomicBool::new(false);

/// Run `f` with interrupts off so list locks can never be re-entered from
/// an interrupt on the same CPU.
fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = arch::interrupts_disable();
    let result = f();
    if was_enabled {
        arch::interrupts_enable();
    }
    result
}

/// Bring up the scheduler: timer vector on the boot CPU and the kernel
/// process (pid 0) hosting the idle thread.
pub fn init() {
    let cpu_id = arch::current_cpu_id();
    if let Err(err) = crate::irq::register_handler(cpu_id, arch::INT_TIMER, timer_interrupt, 0) {
        log::error!("sched: cannot claim the timer vector: {}", err);
    }
    match process::create(
        "kernel",
        ProcessState::Ready,
        crate::mm::VirtAddr::new(idle_main as usize as u64),
        false,
        None,
    ) {
        Ok(_) => log::info!("sched: kernel process ready"),
        Err(err) => log::error!("sched: cannot create the kernel process: {}", err),
    }
}

/// The kernel process's idle loop.
fn idle_main() -> ! {
    loop {
        arch::halt_until_interrupt();
    }
}

/// Disable preemption until the next `invoke`/interrupt return.
pub fn pause() {
    arch::interrupts_disable();
}

/// Voluntarily enter the scheduler.
pub fn invoke() {
    arch::interrupts_enable();
    arch::trigger_schedule();
}

/// Put a thread on the ready list.
pub fn enqueue_ready(thread_ptr: NonNull<Thread>) {
    with_interrupts_disabled(|| {
        // SAFETY: the thread is live and not on any other list.
        unsafe { THREADS.lock().push_back(thread_ptr) };
    });
}

/// Move a thread to the reaper.
pub fn hang_thread(thread_ptr: NonNull<Thread>) {
    with_interrupts_disabled(|| {
        // SAFETY: the thread is live; membership transfers atomically
        // under the list locks.
        unsafe {
            THREADS.lock().remove(thread_ptr);
            SLEEPING_THREADS.lock().remove(thread_ptr);
            HANGING_THREADS.lock().push_back(thread_ptr);
        }
    });
}

/// Track a new process.
pub fn register_process(process_ptr: NonNull<Process>) {
    with_interrupts_disabled(|| {
        // SAFETY: the process is live and unlisted.
        unsafe { PROCESSES.lock().push_back(process_ptr) };
    });
}

/// Move a dead process to the reaper.
pub fn hang_process(process_ptr: NonNull<Process>) {
    with_interrupts_disabled(|| {
        // SAFETY: the process is live; membership transfers under locks.
        unsafe {
            PROCESSES.lock().remove(process_ptr);
            HANGING_PROCESSES.lock().push_back(process_ptr);
        }
    });
}

/// Find a process by pid among the live and the not-yet-reaped.
pub fn find_process(pid: process::Pid) -> Option<NonNull<Process>> {
    with_interrupts_disabled(|| {
        let mut found = None;
        // SAFETY: members of these lists are live.
        PROCESSES.lock().for_each(|p| {
            if unsafe { p.as_ref() }.pid == pid {
                found = Some(p);
            }
        });
        if found.is_none() {
            HANGING_PROCESSES.lock().for_each(|p| {
                if unsafe { p.as_ref() }.pid == pid {
                    found = Some(p);
                }
            });
        }
        found
    })
}

/// Find a thread by tid on the ready list.
pub fn find_thread(tid: usize) -> Option<NonNull<Thread>> {
    with_interrupts_disabled(|| {
        let mut found = None;
        // SAFETY: members are live.
        THREADS.lock().for_each(|t| {
            if unsafe { t.as_ref() }.tid == tid {
                found = Some(t);
            }
        });
        found
    })
}

/// Park the thread until `deadline_ns`, then reschedule.
pub fn sleep_until(mut thread_ptr: NonNull<Thread>, deadline_ns: u64) {
    with_interrupts_disabled(|| {
        // SAFETY: the thread is live; we own the transition under locks.
        unsafe {
            let t = thread_ptr.as_mut();
            t.wake_deadline_ns = deadline_ns;
            t.state = ThreadState::Sleeping;
            THREADS.lock().remove(thread_ptr);
            SLEEPING_THREADS.lock().push_back(thread_ptr);
        }
    });
    invoke();
}

/// Move a Waiting thread (futex, blocked syscall) back to Ready.
pub fn wake_thread(mut thread_ptr: NonNull<Thread>) {
    with_interrupts_disabled(|| {
        // SAFETY: as above.
        unsafe {
            let t = thread_ptr.as_mut();
            t.state = ThreadState::Ready;
            SLEEPING_THREADS.lock().remove(thread_ptr);
            THREADS.lock().push_back(thread_ptr);
        }
    });
}

/// Re-enqueue sleepers whose deadline has passed.
fn wake_expired(now_ns: u64) {
    let mut expired: [Option<NonNull<Thread>>; 16] = [None; 16];
    let mut count = 0;
    {
        let sleeping = SLEEPING_THREADS.lock();
        sleeping.for_each(|t| {
            // SAFETY: members are live.
            if count < expired.len() && unsafe { t.as_ref() }.wake_deadline_ns <= now_ns {
                expired[count] = Some(t);
                count += 1;
            }
        });
    }
    for slot in expired.iter().take(count) {
        if let Some(mut t) = *slot {
            // SAFETY: still live; transition under locks.
            unsafe {
                SLEEPING_THREADS.lock().remove(t);
                t.as_mut().state = ThreadState::Ready;
                THREADS.lock().push_back(t);
            }
        }
    }
}

/// Free hanging threads and reapable processes. Runs at most once per
/// pass per CPU; the lock makes double-frees structurally impossible.
pub fn reap() {
    if REAPER_LOCK
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    while let Some(thread_ptr) = HANGING_THREADS.lock().pop_front() {
        thread::destroy(thread_ptr);
    }

    // A dead process lingers until its parent collected the return code
    // (or there is no live parent left to care).
    let mut reapable: [Option<NonNull<Process>>; 16] = [None; 16];
    let mut count = 0;
    HANGING_PROCESSES.lock().for_each(|p| {
        // SAFETY: members are live until destroyed below.
        let proc_ref = unsafe { p.as_ref() };
        let collected = proc_ref.waited.load(Ordering::Acquire);
        let orphaned = match *proc_ref.parent.lock() {
            None => true,
            Some(parent_pid) => find_live(parent_pid).is_none(),
        };
        if (collected || orphaned) && count < reapable.len() {
            reapable[count] = Some(p);
            count += 1;
        }
    });
    for slot in reapable.iter().take(count) {
        if let Some(p) = *slot {
            // SAFETY: chosen above; removal transfers ownership to us.
            unsafe { HANGING_PROCESSES.lock().remove(p) };
            process::destroy(p);
        }
    }

    REAPER_LOCK.store(false, Ordering::Release);
}

fn find_live(pid: process::Pid) -> Option<NonNull<Process>> {
    let mut found = None;
    PROCESSES.lock().for_each(|p| {
        // SAFETY: members are live.
        if unsafe { p.as_ref() }.pid == pid {
            found = Some(p);
        }
    });
    found
}

/// Pick the next runnable thread: linear scan starting after `previous`,
/// wrapping to the head. The first Ready thread whose claim we win is it.
fn select_next(previous: Option<NonNull<Thread>>) -> Option<NonNull<Thread>> {
    let threads = THREADS.lock();

    let try_pick = |candidate: NonNull<Thread>| -> bool {
        // SAFETY: members are live.
        let t = unsafe { candidate.as_ref() };
        t.state == ThreadState::Ready && t.try_claim()
    };

    // From the previous thread's successor to the end.
    let start = previous.and_then(|p| {
        // SAFETY: the previous thread is live (it just ran here).
        unsafe { p.as_ref() }.next_link()
    });
    let mut cursor = start;
    while let Some(candidate) = cursor {
        if try_pick(candidate) {
            return Some(candidate);
        }
        // SAFETY: members are live.
        cursor = unsafe { candidate.as_ref() }.next_link();
    }
    // Wrap: from the head up to and including the previous thread.
    let mut cursor = threads.head();
    while let Some(candidate) = cursor {
        if cursor == start {
            break;
        }
        if try_pick(candidate) {
            return Some(candidate);
        }
        // SAFETY: members are live.
        cursor = unsafe { candidate.as_ref() }.next_link();
    }
    None
}

/// Timer interrupt: wake sleepers, then reschedule.
pub fn timer_interrupt(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
    wake_expired(crate::drivers::clock::now_ns());
    reschedule(ctx)
}

/// The context switch. Writes the trap frame back into the outgoing
/// thread, selects a successor, loads its address space and kernel
/// stack, and returns the context the low-level stub should resume.
pub fn reschedule(ctx: *mut Context) -> *mut Context {
    arch::interrupts_disable();
    let cpu = cpu::current();

    reap();

    let outgoing = cpu.current_thread();
    if let Some(mut outgoing_ptr) = outgoing {
        // SAFETY: this CPU owns the outgoing thread's claim.
        let t = unsafe { outgoing_ptr.as_mut() };
        if t.fresh_context {
            // execve rebuilt the saved context; the trap frame belongs to
            // the dead image.
            t.fresh_context = false;
        } else {
            // SAFETY: `ctx` is the live trap frame for this thread.
            t.context = unsafe { *ctx };
            arch::thread_extra_save(&mut t.extra);
            t.user_stack = cpu.user_stack.load(Ordering::Acquire);
        }
        if t.state == ThreadState::Running {
            t.state = ThreadState::Ready;
        }
        t.release_claim();
    }

    let Some(mut incoming_ptr) = select_next(outgoing) else {
        // Nothing to run: idle until the next interrupt brings work.
        cpu.set_current_thread(core::ptr::null_mut());
        arch::eoi();
        #[cfg(target_os = "none")]
        loop {
            arch::halt_until_interrupt();
        }
        #[cfg(not(target_os = "none"))]
        return ctx;
    };

    // SAFETY: we won the incoming thread's claim in select_next.
    let incoming = unsafe { incoming_ptr.as_mut() };
    cpu.set_current_thread(incoming_ptr.as_ptr());
    arch::set_kernel_stack(cpu.id, incoming.kernel_stack_top().as_u64());
    cpu.user_stack.store(incoming.user_stack, Ordering::Release);
    arch::thread_extra_restore(&incoming.extra);
    incoming.state = ThreadState::Running;

    // Load the address space, skipping the reload if it is already live.
    let root = incoming.process().page_map_root();
    if arch::page_table_root() != root {
        incoming.process().address_space.lock().page_map().set_active();
    }

    arch::eoi();
    &mut incoming.context as *mut Context
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{testing, VirtAddr};

    fn spawn_kernel_thread() -> NonNull<Thread> {
        let process = process::create(
            "sched-test",
            ProcessState::Ready,
            VirtAddr::new(idle_main as usize as u64),
            false,
            None,
        )
        .expect("kernel process");
        // SAFETY: just created; single thread.
        unsafe { process.as_ref().threads.lock()[0] }
    }

    #[test]
    fn thread_lives_on_exactly_one_list() {
        let _env = testing::env();
        let t = spawn_kernel_thread();
        let proc_ptr = unsafe { t.as_ref() }.process;
        unsafe {
            assert!(THREADS.lock().contains(t));
            assert!(!HANGING_THREADS.lock().contains(t));
            assert!(!SLEEPING_THREADS.lock().contains(t));
        }

        process::kill(proc_ptr, 0);
        unsafe {
            assert!(!THREADS.lock().contains(t));
            assert!(HANGING_THREADS.lock().contains(t));
        }

        unsafe { proc_ptr.as_ref() }.waited.store(true, Ordering::Release);
        reap();
        // Freed exactly once; both reaper lists drained of it.
        unsafe {
            assert!(!HANGING_THREADS.lock().contains(t));
        }
        reap();
    }

    #[test]
    fn sleeping_thread_wakes_after_deadline() {
        let _env = testing::env();
        let t = spawn_kernel_thread();
        let now = crate::drivers::clock::now_ns();
        sleep_until(t, now + 1_000_000);
        unsafe {
            assert!(SLEEPING_THREADS.lock().contains(t));
            assert_eq!(t.as_ref().state, ThreadState::Sleeping);
        }

        // Not yet due.
        wake_expired(now);
        unsafe { assert!(SLEEPING_THREADS.lock().contains(t)) };

        // Past the deadline.
        wake_expired(now + 2_000_000);
        unsafe {
            assert!(THREADS.lock().contains(t));
            assert_eq!(t.as_ref().state, ThreadState::Ready);
        }
        // Cleanup.
        let proc_ptr = unsafe { t.as_ref() }.process;
        process::kill(proc_ptr, 0);
        unsafe { proc_ptr.as_ref() }.waited.store(true, Ordering::Release);
        reap();
    }

    #[test]
    fn selection_skips_non_ready_threads() {
        let _env = testing::env();
        let a = spawn_kernel_thread();
        let b = spawn_kernel_thread();
        unsafe {
            a.as_ptr().as_mut().unwrap().state = ThreadState::Waiting;
        }
        let picked = select_next(None).expect("one claimable thread");
        // `a` is Waiting, so the scan lands on `b` (or a later ready
        // thread, never `a`).
        assert_ne!(picked, a);
        unsafe { picked.as_ref().release_claim() };
        let _ = b;
    }

    #[test]
    fn dead_process_reaped_once_parent_collects() {
        let _env = testing::env();
        let process = process::create(
            "reap-me",
            ProcessState::Ready,
            VirtAddr::new(idle_main as usize as u64),
            false,
            None,
        )
        .expect("process");
        let pid = unsafe { process.as_ref() }.pid;

        process::kill(process, -1);
        assert!(find_process(pid).is_some(), "dead but not reaped yet");
        assert_eq!(
            unsafe { process.as_ref() }.state(),
            ProcessState::Dead
        );

        // No parent: the next reaper pass frees it.
        reap();
        assert!(find_process(pid).is_none());
    }
}
