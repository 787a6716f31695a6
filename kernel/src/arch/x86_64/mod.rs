//! x86_64 port
//!
//! The complete reference port: GDT/TSS, IDT with a single dispatch path,
//! `syscall` MSR setup, LAPIC EOI, SMAP bracketing, FS/GS base handling
//! and FXSAVE state. Every function the cross-platform code calls also
//! has a hosted fallback so the unit tests run on a plain Linux target.

pub mod context;
pub mod gdt;
pub mod idt;

use core::sync::atomic::{AtomicBool, Ordering};

pub use context::{Context, FpuState, ThreadExtra};

use crate::mm::{PhysAddr, VirtAddr};

/// Software interrupt vector the scheduler runs on.
pub const INT_TIMER: usize = 0x30;
/// Legacy syscall vector.
pub const INT_SYSCALL: usize = 0x80;

/// First vector available to drivers.
pub const IRQ_BASE: usize = 0x40;

/// Whether SMAP is available and enabled.
static HAS_SMAP: AtomicBool = AtomicBool::new(false);

/// Early per-CPU bring-up: segmentation, trap entry, per-CPU base.
#[cfg(target_os = "none")]
pub fn init_cpu(cpu_id: usize, kernel_stack_top: u64) {
    use x86_64::registers::control::{Cr4, Cr4Flags};
    use x86_64::registers::model_specific::GsBase;

    gdt::init(cpu_id, kernel_stack_top);
    idt::init();

    // The per-CPU descriptor is found through GS.
    let cpu = &super::cpu::CPUS[cpu_id];
    cpu.kernel_stack.store(kernel_stack_top, Ordering::Release);
    GsBase::write(x86_64::VirtAddr::new(cpu as *const _ as u64));
    cpu.online.store(true, Ordering::Release);

    // SMAP: keep user pages unreachable outside the usercopy brackets.
    let cpuid = unsafe { core::arch::x86_64::__cpuid_count(7, 0) };
    if cpuid.ebx & (1 << 20) != 0 {
        unsafe {
            Cr4::update(|flags| flags.insert(Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION));
        }
        HAS_SMAP.store(true, Ordering::Release);
    }
}

#[cfg(not(target_os = "none"))]
pub fn init_cpu(cpu_id: usize, kernel_stack_top: u64) {
    let cpu = &super::cpu::CPUS[cpu_id];
    cpu.kernel_stack.store(kernel_stack_top, Ordering::Release);
    cpu.online.store(true, Ordering::Release);
}

/// Logical id of the executing CPU.
#[cfg(target_os = "none")]
pub fn current_cpu_id() -> usize {
    // Cpu.id is the first field; GS base points at the descriptor.
    let id: usize;
    // SAFETY: GS base is set to this CPU's descriptor during init_cpu.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) id, options(nostack, readonly));
    }
    id
}

#[cfg(not(target_os = "none"))]
pub fn current_cpu_id() -> usize {
    0
}

/// Invalidate the TLB entry covering `virt`.
#[inline]
pub fn flush_tlb(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg has no side effects beyond TLB maintenance.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Switch the active translation root.
pub fn set_page_table_root(root: PhysAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: `root` names a valid top-level table built by the VM layer.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

/// Active translation root.
pub fn page_table_root() -> PhysAddr {
    #[cfg(target_os = "none")]
    {
        let root: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) root, options(nostack, readonly));
        }
        PhysAddr::new(root & 0x000F_FFFF_FFFF_F000)
    }
    #[cfg(not(target_os = "none"))]
    PhysAddr::new(0)
}

/// Disable interrupts, reporting whether they were enabled.
pub fn interrupts_disable() -> bool {
    #[cfg(target_os = "none")]
    {
        let rflags: u64;
        // SAFETY: pushfq/cli are always valid in ring 0.
        unsafe {
            core::arch::asm!("pushfq; pop {}; cli", out(reg) rflags);
        }
        rflags & 0x200 != 0
    }
    #[cfg(not(target_os = "none"))]
    false
}

/// Re-enable interrupts.
pub fn interrupts_enable() {
    #[cfg(target_os = "none")]
    // SAFETY: sti is always valid in ring 0.
    unsafe {
        core::arch::asm!("sti", options(nostack));
    }
}

/// Idle until the next interrupt.
pub fn halt_until_interrupt() {
    #[cfg(target_os = "none")]
    // SAFETY: hlt resumes on the next interrupt.
    unsafe {
        core::arch::asm!("sti; hlt", options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Raise the scheduler's software interrupt.
pub fn trigger_schedule() {
    #[cfg(target_os = "none")]
    // SAFETY: the timer vector is installed before the scheduler runs.
    unsafe {
        core::arch::asm!("int 0x30", options(nostack));
    }
}

/// Program the LAPIC timer to fire the scheduler vector periodically.
pub fn arm_timer() {
    #[cfg(target_os = "none")]
    {
        const LAPIC_BASE: usize = 0xFEE0_0000;
        const LVT_TIMER: usize = 0x320;
        const DIVIDE_CONFIG: usize = 0x3E0;
        const INITIAL_COUNT: usize = 0x380;
        const TIMER_PERIODIC: u32 = 1 << 17;

        // SAFETY: the LAPIC register block is device memory under the
        // direct map; these are the architectural timer registers.
        unsafe {
            let base = crate::mm::phys::phys_base().add(LAPIC_BASE);
            (base.add(DIVIDE_CONFIG) as *mut u32).write_volatile(0b1011); // divide by 1
            (base.add(LVT_TIMER) as *mut u32)
                .write_volatile(INT_TIMER as u32 | TIMER_PERIODIC);
            (base.add(INITIAL_COUNT) as *mut u32).write_volatile(10_000_000);
        }
    }
}

/// Acknowledge the current interrupt at the LAPIC.
pub fn eoi() {
    #[cfg(target_os = "none")]
    {
        const LAPIC_EOI: usize = 0xFEE0_00B0;
        // SAFETY: the LAPIC registers are reachable through the direct
        // map; writing 0 to EOI is the architectural acknowledge.
        unsafe {
            let reg = crate::mm::phys::phys_base().add(LAPIC_EOI) as *mut u32;
            reg.write_volatile(0);
        }
    }
}

/// Open the SMAP window for user accesses.
#[inline]
pub fn user_access_begin() {
    #[cfg(target_os = "none")]
    if HAS_SMAP.load(Ordering::Acquire) {
        // SAFETY: stac only toggles EFLAGS.AC.
        unsafe { core::arch::asm!("stac", options(nostack)) };
    }
}

/// Close the SMAP window.
#[inline]
pub fn user_access_end() {
    #[cfg(target_os = "none")]
    if HAS_SMAP.load(Ordering::Acquire) {
        // SAFETY: clac only toggles EFLAGS.AC.
        unsafe { core::arch::asm!("clac", options(nostack)) };
    }
}

/// Save the calling CPU's FPU state into `state`.
pub fn fpu_save(state: &mut FpuState) {
    #[cfg(target_os = "none")]
    // SAFETY: the buffer is 512 bytes and 16-byte aligned by type.
    unsafe {
        core::arch::asm!("fxsave64 [{}]", in(reg) state.0.as_mut_ptr(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Load `state` into the FPU.
pub fn fpu_restore(state: &FpuState) {
    #[cfg(target_os = "none")]
    // SAFETY: the buffer was produced by fpu_save (or zeroed, which is a
    // valid init image after fninit semantics).
    unsafe {
        core::arch::asm!("fxrstor64 [{}]", in(reg) state.0.as_ptr(), options(nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Capture the outgoing thread's FS/GS bases.
pub fn thread_extra_save(extra: &mut ThreadExtra) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, KernelGsBase};
        extra.fs_base = FsBase::read().as_u64();
        // While in the kernel, the user GS base is parked in KernelGsBase.
        extra.gs_base = KernelGsBase::read().as_u64();
    }
    fpu_save(&mut extra.fpu);
}

/// Install the incoming thread's FS/GS bases.
pub fn thread_extra_restore(extra: &ThreadExtra) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, KernelGsBase};
        FsBase::write(x86_64::VirtAddr::new(extra.fs_base));
        KernelGsBase::write(x86_64::VirtAddr::new(extra.gs_base));
    }
    fpu_restore(&extra.fpu);
}

/// Update the ring-0 stack used on the next trap from user mode.
pub fn set_kernel_stack(cpu_id: usize, stack_top: u64) {
    #[cfg(target_os = "none")]
    gdt::set_kernel_stack(cpu_id, stack_top);
    super::cpu::CPUS[cpu_id]
        .kernel_stack
        .store(stack_top, Ordering::Release);
}

/// Dump a trap frame to the log for panics and kills.
pub fn dump_registers(ctx: &Context) {
    log::error!(
        "rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x} ss={:#06x}",
        ctx.rip,
        ctx.cs,
        ctx.rflags,
        ctx.rsp,
        ctx.ss
    );
    log::error!(
        "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        ctx.rax,
        ctx.rbx,
        ctx.rcx,
        ctx.rdx
    );
    log::error!(
        "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
        ctx.rsi,
        ctx.rdi,
        ctx.rbp,
        ctx.r8
    );
    log::error!(
        "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
        ctx.r9,
        ctx.r10,
        ctx.r11,
        ctx.r12
    );
    log::error!(
        "r13={:#018x} r14={:#018x} r15={:#018x} isr={} err={:#x}",
        ctx.r13,
        ctx.r14,
        ctx.r15,
        ctx.isr,
        ctx.error
    );
}

/// Faulting address of the most recent page fault.
pub fn fault_address() -> VirtAddr {
    #[cfg(target_os = "none")]
    {
        let cr2: u64;
        // SAFETY: reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nostack, readonly));
        }
        VirtAddr::new(cr2)
    }
    #[cfg(not(target_os = "none"))]
    VirtAddr::new(0)
}
