//! Interrupt dispatch
//!
//! One ISR entry for all vectors. If a handler is registered for the
//! vector on this CPU it runs and may hand back a different context (the
//! scheduler's context switch works exactly this way). An unhandled trap
//! from user mode kills the offending process; an unhandled trap in
//! kernel mode is a kernel bug and panics with a register dump.

pub mod exceptions;

use crate::arch::cpu::{self, IrqSlot, IrqHandlerFn, NUM_VECTORS};
use crate::arch::{self, Context};
use crate::error::{KernelError, KernelResult};

/// Exit code of a process killed by an unhandled trap (128 + SIGILL).
pub const KILLED_SIGILL: i32 = 132;
/// Exit code of a process killed by a bad memory access (128 + SIGSEGV).
pub const KILLED_SIGSEGV: i32 = 139;

/// Common trap dispatch, called by the low-level entry stubs with
/// interrupts disabled. Returns the context to resume into.
pub extern "C" fn int_handler(isr: usize, ctx: *mut Context) -> *mut Context {
    let cpu = cpu::current();

    let slot = {
        let handlers = cpu.irq_handlers.lock();
        handlers.get(isr).copied().flatten()
    };
    if let Some(slot) = slot {
        return (slot.handler)(isr, ctx, slot.data);
    }

    // SAFETY: the stub hands us a live frame.
    let frame = unsafe { &*ctx };
    if frame.from_user() {
        if let Some(process) = crate::process::current() {
            // SAFETY: current() returns a live process.
            let pid = unsafe { process.as_ref() }.pid;
            log::error!(
                "irq: unhandled interrupt {} from user program, terminating pid {}",
                isr,
                pid
            );
            arch::dump_registers(frame);
            crate::process::kill(process, KILLED_SIGILL);
            return crate::sched::reschedule(ctx);
        }
    }

    // Kernel-mode fault with no handler: nothing to recover.
    arch::dump_registers(frame);
    panic!("unhandled interrupt {} in kernel mode", isr);
}

/// Publish a handler for `vector` on `cpu`. Fails if the slot is taken,
/// so registration races surface instead of silently clobbering.
pub fn register_handler(
    cpu_id: usize,
    vector: usize,
    handler: IrqHandlerFn,
    data: usize,
) -> KernelResult<()> {
    arch::interrupts_disable();
    let cpu = cpu::by_id(cpu_id).ok_or(KernelError::InvalidArgument { name: "cpu" })?;
    if vector >= NUM_VECTORS {
        return Err(KernelError::InvalidArgument { name: "vector" });
    }
    let mut handlers = cpu.irq_handlers.lock();
    if handlers[vector].is_some() {
        return Err(KernelError::AlreadyExists {
            resource: "interrupt vector",
        });
    }
    handlers[vector] = Some(IrqSlot { handler, data });
    log::debug!("irq: vector {} on cpu {} registered", vector, cpu_id);
    Ok(())
}

/// Find the first free driver vector on any CPU and register there.
pub fn allocate_handler(handler: IrqHandlerFn, data: usize) -> KernelResult<(usize, usize)> {
    for cpu in cpu::CPUS.iter() {
        let free = {
            let handlers = cpu.irq_handlers.lock();
            (arch::IRQ_BASE..NUM_VECTORS).find(|&v| handlers[v].is_none())
        };
        if let Some(vector) = free {
            register_handler(cpu.id, vector, handler, data)?;
            return Ok((cpu.id, vector));
        }
    }
    Err(KernelError::ResourceExhausted {
        resource: "interrupt vectors",
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn nop_handler(_isr: usize, ctx: *mut Context, _data: usize) -> *mut Context {
        ctx
    }

    #[test]
    fn double_registration_is_rejected() {
        let vector = NUM_VECTORS - 2;
        register_handler(1, vector, nop_handler, 0).expect("first registration");
        assert!(matches!(
            register_handler(1, vector, nop_handler, 0),
            Err(KernelError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn allocation_picks_free_vectors() {
        let (cpu_a, vec_a) = allocate_handler(nop_handler, 1).expect("first");
        let (cpu_b, vec_b) = allocate_handler(nop_handler, 2).expect("second");
        assert!((cpu_a, vec_a) != (cpu_b, vec_b));
        assert!(vec_a >= arch::IRQ_BASE && vec_b >= arch::IRQ_BASE);
    }

    #[test]
    fn out_of_range_vector_is_rejected() {
        assert!(register_handler(0, NUM_VECTORS, nop_handler, 0).is_err());
        assert!(register_handler(cpu::MAX_CPUS + 1, 10, nop_handler, 0).is_err());
    }
}
