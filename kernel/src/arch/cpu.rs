//! Per-CPU descriptors
//!
//! One fixed-size table of CPU descriptors; each core finds its own entry
//! through an architecture trick (GS base on x86_64, `tp` on riscv64)
//! behind the `current()` accessor. The IRQ vector table lives here:
//! registration is check-and-publish so two drivers can never race for
//! the same slot.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use spin::Mutex;

use super::Context;
use crate::process::thread::Thread;

/// Upper bound on supported cores.
pub const MAX_CPUS: usize = 16;

/// Number of interrupt vectors per CPU.
pub const NUM_VECTORS: usize = 256;

/// An interrupt handler and its registration context. The handler may
/// return a different context pointer to switch threads on return.
pub type IrqHandlerFn = fn(usize, *mut Context, usize) -> *mut Context;

/// A published handler slot.
#[derive(Clone, Copy)]
pub struct IrqSlot {
    pub handler: IrqHandlerFn,
    pub data: usize,
}

/// Per-core state.
///
/// Layout is part of the x86_64 syscall entry contract: the asm reads
/// `id` at GS:0, `kernel_stack` at GS:24 and `user_stack` at GS:32.
#[repr(C)]
pub struct Cpu {
    /// Logical id; must stay the first field (the x86_64 `current()`
    /// accessor reads it through GS:0).
    pub id: usize,
    /// Whether this core has been brought up.
    pub online: AtomicBool,
    /// Thread currently executing on this core.
    pub thread: AtomicPtr<Thread>,
    /// Kernel stack for the running thread (mirrored into the TSS).
    pub kernel_stack: AtomicU64,
    /// Saved user stack pointer of the running thread.
    pub user_stack: AtomicU64,
    /// IRQ vector table.
    pub irq_handlers: Mutex<[Option<IrqSlot>; NUM_VECTORS]>,
}

impl Cpu {
    const fn new(id: usize) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            thread: AtomicPtr::new(core::ptr::null_mut()),
            kernel_stack: AtomicU64::new(0),
            user_stack: AtomicU64::new(0),
            irq_handlers: Mutex::new([None; NUM_VECTORS]),
        }
    }

    /// Thread currently running on this CPU, if any.
    pub fn current_thread(&self) -> Option<core::ptr::NonNull<Thread>> {
        core::ptr::NonNull::new(self.thread.load(Ordering::Acquire))
    }

    pub fn set_current_thread(&self, thread: *mut Thread) {
        self.thread.store(thread, Ordering::Release);
    }
}

const fn build_cpus() -> [Cpu; MAX_CPUS] {
    let mut cpus = [const { Cpu::new(0) }; MAX_CPUS];
    let mut i = 0;
    while i < MAX_CPUS {
        cpus[i].id = i;
        i += 1;
    }
    cpus
}

/// The CPU descriptor table.
pub static CPUS: [Cpu; MAX_CPUS] = build_cpus();

/// Descriptor of the executing CPU.
pub fn current() -> &'static Cpu {
    &CPUS[super::current_cpu_id()]
}

/// Descriptor by logical id.
pub fn by_id(id: usize) -> Option<&'static Cpu> {
    CPUS.get(id)
}

/// Cores that have checked in.
pub fn online_count() -> usize {
    CPUS.iter()
        .filter(|cpu| cpu.online.load(Ordering::Relaxed))
        .count()
}
