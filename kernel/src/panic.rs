//! Panic path
//!
//! A kernel panic force-unlocks the console, dumps the location and a
//! best-effort stack trace resolved against the kernel symbol table, and
//! halts all forward progress on this CPU.

/// Walk the frame-pointer chain and log return addresses with symbol
/// names where the symbol table knows them.
pub fn backtrace() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut frame: *const u64;
        // SAFETY: reading rbp is side-effect free; the walk below only
        // dereferences plausible kernel-half frame pointers.
        unsafe {
            core::arch::asm!("mov {}, rbp", out(reg) frame, options(nostack, readonly));
        }
        crate::println!("backtrace:");
        for depth in 0..32 {
            if frame.is_null() || (frame as u64) < crate::mm::HHDM_BASE {
                break;
            }
            // SAFETY: bounds-checked against the kernel half above.
            let (next, return_addr) = unsafe { (*frame as *const u64, *frame.add(1)) };
            if return_addr == 0 {
                break;
            }
            match crate::module::find_symbol(return_addr) {
                Some((name, info)) => crate::println!(
                    "  #{:02} {:#018x} {}+{:#x}",
                    depth,
                    return_addr,
                    name,
                    return_addr - info.value
                ),
                None => crate::println!("  #{:02} {:#018x} <unknown>", depth, return_addr),
            }
            frame = next;
        }
    }
}

/// Common panic body shared by the binary's panic handler.
#[cfg(target_os = "none")]
pub fn panic_common(info: &core::panic::PanicInfo) -> ! {
    crate::arch::interrupts_disable();
    // The panic may have happened with the console lock held.
    // SAFETY: no other CPU makes progress we care about anymore.
    unsafe { crate::serial::CONSOLE.force_unlock() };

    crate::println!("\n==== KERNEL PANIC ====");
    crate::println!("{}", info);
    backtrace();
    crate::println!("======================");

    loop {
        crate::arch::halt_until_interrupt();
    }
}
