//! Bare-metal kernel entry
//!
//! The boot protocol shim (Limine-style) builds a `BootInfo` and jumps
//! here with a pointer to it. The early sequence is fixed: serial +
//! logging, physical memory, the kernel page map, the heap, then the CPU
//! tables — after that everything else runs as init-graph nodes.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use obsidian_kernel::{arch, boot, irq, mm, sched, serial, syscall, BootInfo};

#[cfg(target_os = "none")]
const BOOT_STACK_SIZE: usize = 64 * 1024;

/// Stack for the boot CPU until the scheduler takes over.
#[cfg(target_os = "none")]
static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

/// Entry from the boot shim. `boot` lives in bootloader-reclaimable
/// memory and must be consumed before user processes start.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(boot: &'static mut BootInfo<'static>) -> ! {
    serial::init();
    obsidian_kernel::print::init();
    log::info!("obsidian {} booting", env!("CARGO_PKG_VERSION"));
    log::info!("cmdline: {}", boot.cmdline);

    // Physical memory first; everything else allocates through it.
    let phys_base = boot.hhdm_offset as *mut u8;
    mm::phys::init(phys_base, boot.memory_map);

    let highest = boot
        .memory_map
        .iter()
        .map(|region| region.address + region.length)
        .max()
        .unwrap_or(0);
    mm::page_map::init_kernel_map(highest);
    mm::page_map::remap_kernel_segments(boot.kernel_phys, boot.kernel_virt);
    mm::page_map::kernel_map().set_active();

    mm::heap::init();

    // CPU tables, trap entry, exception policy, syscall vector.
    let cpu_id = boot.boot_cpu;
    // SAFETY: the boot stack is only used by this CPU during bring-up.
    let stack_top =
        unsafe { core::ptr::addr_of!(BOOT_STACK) as usize as u64 } + BOOT_STACK_SIZE as u64;
    arch::init_cpu(cpu_id, stack_top);
    irq::exceptions::install(cpu_id);
    syscall::init(cpu_id);

    // The rest of the system comes up through the init graph.
    boot::kernel_init(boot);

    // Hand the timer to the scheduler and become the idle loop; the
    // first tick switches into whatever is ready (pid 1's thread, if
    // `/init` loaded).
    arch::arm_timer();
    log::info!(
        "boot complete, {} cpu(s), {} pages free",
        arch::cpu::online_count(),
        mm::phys::free_page_count()
    );
    sched::invoke();
    loop {
        arch::halt_until_interrupt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    obsidian_kernel::panic::panic_common(info)
}

// Hosted builds of the workspace still compile this crate; give them an
// empty main so `cargo check` on the default target works.
#[cfg(not(target_os = "none"))]
fn main() {}
