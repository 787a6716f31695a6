//! Exception policy
//!
//! Page faults, invalid opcodes and breakpoints. The rule is uniform:
//! kernel-mode faults are fatal, user-mode faults terminate the offending
//! process and reschedule (no demand paging yet, so a user page fault is
//! always a bad access). Breakpoints only dump registers.

use super::{KILLED_SIGILL, KILLED_SIGSEGV};
use crate::arch::{self, Context};

/// Exception vector numbers of the host architecture.
#[cfg(target_arch = "x86_64")]
mod vectors {
    pub const BREAKPOINT: usize = 3;
    pub const INVALID_OPCODE: usize = 6;
    pub const PAGE_FAULT: usize = 14;
}

#[cfg(target_arch = "riscv64")]
mod vectors {
    pub const BREAKPOINT: usize = 3;
    pub const INVALID_OPCODE: usize = 2;
    pub const PAGE_FAULT: usize = 13;
}

/// Claim the exception vectors on `cpu_id`.
pub fn install(cpu_id: usize) {
    let entries = [
        (vectors::BREAKPOINT, breakpoint as crate::arch::cpu::IrqHandlerFn),
        (vectors::INVALID_OPCODE, invalid_opcode as _),
        (vectors::PAGE_FAULT, page_fault as _),
    ];
    for (vector, handler) in entries {
        if let Err(err) = super::register_handler(cpu_id, vector, handler, 0) {
            log::error!("irq: exception vector {} unavailable: {}", vector, err);
        }
    }
}

fn breakpoint(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
    // SAFETY: the dispatcher hands us a live frame.
    let frame = unsafe { &*ctx };
    log::info!("irq: breakpoint");
    arch::dump_registers(frame);
    ctx
}

fn invalid_opcode(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
    // SAFETY: as above.
    let frame = unsafe { &*ctx };
    if !frame.from_user() {
        arch::dump_registers(frame);
        panic!("invalid opcode in kernel mode at {:#x}", instruction_pointer(frame));
    }
    if let Some(process) = crate::process::current() {
        // SAFETY: live process.
        let pid = unsafe { process.as_ref() }.pid;
        log::error!("irq: pid {} executed an invalid opcode, terminating", pid);
        crate::process::kill(process, KILLED_SIGILL);
    }
    crate::sched::reschedule(ctx)
}

fn page_fault(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
    // SAFETY: as above.
    let frame = unsafe { &*ctx };
    let fault_addr = arch::fault_address();

    #[cfg(target_arch = "x86_64")]
    {
        let error = frame.error;
        log::error!(
            "irq: page fault at {} ({}, {} access{}{})",
            fault_addr,
            if error & 1 != 0 {
                "protection violation"
            } else {
                "page not present"
            },
            if error & 2 != 0 { "write" } else { "read" },
            if error & 4 != 0 { ", from user" } else { ", from kernel" },
            if error & 16 != 0 { ", instruction fetch" } else { "" },
        );
    }
    #[cfg(target_arch = "riscv64")]
    log::error!("irq: page fault at {}", fault_addr);

    if !frame.from_user() {
        arch::dump_registers(frame);
        panic!("page fault in kernel mode while accessing {}", fault_addr);
    }

    // User faults terminate the process: mappings are eager, so there is
    // nothing to demand-fault in.
    if let Some(process) = crate::process::current() {
        // SAFETY: live process.
        let pid = unsafe { process.as_ref() }.pid;
        crate::process::kill(process, KILLED_SIGSEGV);
        log::error!("irq: pid {} terminated with SIGSEGV", pid);
    }
    crate::sched::reschedule(ctx)
}

fn instruction_pointer(frame: &Context) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        frame.rip
    }
    #[cfg(target_arch = "riscv64")]
    {
        frame.sepc
    }
}
