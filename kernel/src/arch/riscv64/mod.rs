//! riscv64 stub port
//!
//! Keeps the porting surface honest on the second architecture: the trap
//! frame, satp/TLB control and interrupt toggles are real, while trap
//! entry plumbing and SBI timer programming are still to grow. The
//! cross-platform kernel builds and schedules against exactly this
//! surface.

pub mod context;

pub use context::{Context, FpuState, ThreadExtra};

use core::sync::atomic::Ordering;

use crate::mm::{PhysAddr, VirtAddr};

/// Supervisor software interrupt doubles as the scheduler vector.
pub const INT_TIMER: usize = 1;
/// `ecall` from U-mode.
pub const INT_SYSCALL: usize = 8;
/// First vector available to drivers (external interrupts via PLIC).
pub const IRQ_BASE: usize = 16;

/// satp mode field for Sv48.
const SATP_MODE_SV48: u64 = 9 << 60;

pub fn init_cpu(cpu_id: usize, kernel_stack_top: u64) {
    let cpu = &super::cpu::CPUS[cpu_id];
    cpu.kernel_stack.store(kernel_stack_top, Ordering::Release);
    #[cfg(target_os = "none")]
    // SAFETY: tp is ours to use in supervisor mode; it carries the CPU id.
    unsafe {
        core::arch::asm!("mv tp, {}", in(reg) cpu_id, options(nostack));
    }
    cpu.online.store(true, Ordering::Release);
}

pub fn current_cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        let id: usize;
        // SAFETY: tp was loaded with the CPU id during init_cpu.
        unsafe {
            core::arch::asm!("mv {}, tp", out(reg) id, options(nostack, readonly));
        }
        id
    }
    #[cfg(not(target_os = "none"))]
    0
}

#[inline]
pub fn flush_tlb(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: sfence.vma only performs TLB maintenance.
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) virt.as_u64(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

pub fn set_page_table_root(root: PhysAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: `root` names a valid top-level table built by the VM layer.
    unsafe {
        let satp = SATP_MODE_SV48 | (root.as_u64() >> 12);
        riscv::register::satp::write(satp as usize);
        core::arch::asm!("sfence.vma zero, zero", options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

pub fn page_table_root() -> PhysAddr {
    #[cfg(target_os = "none")]
    {
        let satp = riscv::register::satp::read().bits() as u64;
        PhysAddr::new((satp & 0x0FFF_FFFF_FFFF) << 12)
    }
    #[cfg(not(target_os = "none"))]
    PhysAddr::new(0)
}

pub fn interrupts_disable() -> bool {
    #[cfg(target_os = "none")]
    {
        let was_enabled = riscv::register::sstatus::read().sie();
        // SAFETY: clearing SIE only masks supervisor interrupts.
        unsafe { riscv::register::sstatus::clear_sie() };
        was_enabled
    }
    #[cfg(not(target_os = "none"))]
    false
}

pub fn interrupts_enable() {
    #[cfg(target_os = "none")]
    // SAFETY: setting SIE only unmasks supervisor interrupts.
    unsafe {
        riscv::register::sstatus::set_sie()
    };
}

pub fn halt_until_interrupt() {
    #[cfg(target_os = "none")]
    {
        interrupts_enable();
        riscv::asm::wfi();
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

pub fn trigger_schedule() {
    #[cfg(target_os = "none")]
    // SAFETY: setting SSIP pends the supervisor software interrupt, which
    // the trap path routes into the scheduler vector.
    unsafe {
        core::arch::asm!("csrsi sip, 2", options(nostack));
    }
}

/// Arm the scheduler tick. The stub port leans on the SBI timer once the
/// trap plumbing lands; until then the software interrupt path is the
/// only scheduler entry.
pub fn arm_timer() {}

pub fn eoi() {
    // Supervisor software/timer interrupts are acknowledged by clearing
    // the pending bit; external interrupt completion is the PLIC
    // driver's job once that exists.
    #[cfg(target_os = "none")]
    // SAFETY: clearing SSIP only retires the pending software interrupt.
    unsafe {
        core::arch::asm!("csrci sip, 2", options(nostack));
    }
}

#[inline]
pub fn user_access_begin() {
    #[cfg(target_os = "none")]
    // SAFETY: SUM lets supervisor code reach user pages inside the
    // usercopy brackets.
    unsafe {
        riscv::register::sstatus::set_sum()
    };
}

#[inline]
pub fn user_access_end() {
    #[cfg(target_os = "none")]
    // SAFETY: clearing SUM re-arms the protection.
    unsafe {
        riscv::register::sstatus::clear_sum()
    };
}

pub fn fpu_save(state: &mut FpuState) {
    let _ = state;
}

pub fn fpu_restore(state: &FpuState) {
    let _ = state;
}

pub fn thread_extra_save(extra: &mut ThreadExtra) {
    fpu_save(&mut extra.fpu);
}

pub fn thread_extra_restore(extra: &ThreadExtra) {
    fpu_restore(&extra.fpu);
}

pub fn set_kernel_stack(cpu_id: usize, stack_top: u64) {
    super::cpu::CPUS[cpu_id]
        .kernel_stack
        .store(stack_top, Ordering::Release);
}

pub fn dump_registers(ctx: &Context) {
    log::error!("sepc={:#018x} sstatus={:#x}", ctx.sepc, ctx.sstatus);
    for (i, chunk) in ctx.regs.chunks(4).enumerate() {
        let mut line = heapless_line();
        for (j, reg) in chunk.iter().enumerate() {
            use core::fmt::Write;
            let _ = write!(line, "x{:<2}={:#018x} ", i * 4 + j + 1, reg);
        }
        log::error!("{}", line.as_str());
    }
}

struct Line {
    buf: [u8; 128],
    len: usize,
}

impl Line {
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Write for Line {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let take = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn heapless_line() -> Line {
    Line {
        buf: [0; 128],
        len: 0,
    }
}

pub fn fault_address() -> VirtAddr {
    #[cfg(target_os = "none")]
    {
        VirtAddr::new(riscv::register::stval::read() as u64)
    }
    #[cfg(not(target_os = "none"))]
    VirtAddr::new(0)
}
