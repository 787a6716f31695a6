//! Obsidian kernel library
//!
//! A monolithic, multi-architecture kernel: process isolation, a
//! preemptive round-robin scheduler, eager virtual memory, an ELF
//! loader, dynamic kernel modules and a POSIX-style syscall surface.
//! x86_64 is the reference port, riscv64 the stub port.
//!
//! The library builds for hosted targets as well; there the arch layer
//! collapses to no-ops and the unit tests drive the real allocator,
//! page walker, loader and scheduler against a memory arena.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal uses the kernel heap; hosted builds (unit tests) delegate to
// the system allocator so test code can allocate normally.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;

#[cfg(all(test, not(target_os = "none")))]
mod integration_tests;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod mm;
pub mod module;
pub mod panic;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;

// Re-exports for the binary and for tests.
pub use boot::{BootFile, BootInfo, PhysMemory, PhysMemoryUsage};
pub use error::{Errno, KernelError, KernelResult};

/// Heap allocation failure in the kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
