//! Boot interface
//!
//! The boot protocol shim (Limine-style) hands the kernel one `BootInfo`
//! describing memory, loaded files and firmware tables. Everything after
//! the early memory bring-up runs as nodes of an init graph so the
//! initialization order is declared, not implied.

pub mod cmdline;
pub mod initgraph;

#[cfg(feature = "alloc")]
extern crate alloc;

use crate::mm::{PhysAddr, VirtAddr};

/// How a physical region may be used.
///
/// Canonical set; the allocator only consumes `Free`, the rest is
/// metadata for diagnostics and reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysMemoryUsage {
    /// Usable RAM.
    Free,
    /// Firmware-reserved, never touched.
    Reserved,
    /// Reclaimable once boot services are done.
    Reclaimable,
    /// Backing the kernel image.
    Kernel,
    /// Backing bootloader structures.
    Bootloader,
    /// Anything the protocol could not classify.
    Unknown,
}

/// One physical memory map entry.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemory {
    pub address: u64,
    pub length: u64,
    pub usage: PhysMemoryUsage,
}

/// A file the bootloader loaded for us.
#[derive(Debug, Clone, Copy)]
pub struct BootFile {
    pub data: &'static [u8],
    pub path: &'static str,
}

/// Per-CPU identity as reported by the boot protocol.
#[derive(Debug, Clone, Copy)]
pub struct BootCpu {
    /// Logical index.
    pub id: usize,
    /// LAPIC id on x86_64, hart id on riscv64.
    pub hw_id: usize,
}

/// Everything the boot protocol tells us.
pub struct BootInfo<'a> {
    /// Kernel command line.
    pub cmdline: &'a str,
    /// Physical memory map. Mutable: the frame allocator steals its
    /// bitmap from the first fitting free region.
    pub memory_map: &'a mut [PhysMemory],
    /// Physical load address of the kernel image.
    pub kernel_phys: PhysAddr,
    /// Virtual base the kernel runs at.
    pub kernel_virt: VirtAddr,
    /// Offset of the direct physical mapping.
    pub hhdm_offset: u64,
    /// Files loaded alongside the kernel.
    pub files: &'a [BootFile],
    /// ACPI RSDP, if the firmware has one.
    pub rsdp: Option<PhysAddr>,
    /// Flattened device tree, if the firmware has one.
    pub fdt: Option<PhysAddr>,
    /// Detected CPUs.
    pub cpus: &'a [BootCpu],
    /// Index of the CPU we booted on.
    pub boot_cpu: usize,
}

/// Initialize the common kernel systems.
///
/// Callable once the early sequence has run: serial + logging,
/// `phys::init`, `page_map::init_kernel_map`, `heap::init`, and the
/// architecture bring-up. Subsystem failures are logged and skipped; the
/// failing subsystem's services are simply unavailable.
#[cfg(feature = "alloc")]
pub fn kernel_init(boot: &BootInfo) {
    use initgraph::{InitGraph, InitNode};

    cmdline::init(boot.cmdline);

    let mut graph = InitGraph::new();
    graph.register(InitNode::new("vfs", &[], |boot| {
        crate::fs::init(boot.files);
        Ok(())
    }));
    graph.register(InitNode::new("console", &["vfs"], |_| {
        crate::drivers::console::init();
        Ok(())
    }));
    graph.register(InitNode::new("pci", &[], |_| {
        crate::drivers::pci::init();
        Ok(())
    }));
    graph.register(InitNode::new("clock", &[], |_| {
        crate::drivers::clock::init();
        Ok(())
    }));
    graph.register(InitNode::new("scheduler", &["vfs"], |_| {
        crate::sched::init();
        Ok(())
    }));
    graph.register(InitNode::new("modules", &["vfs", "scheduler"], |boot| {
        crate::module::init(boot)?;
        Ok(())
    }));
    graph.register(InitNode::new(
        "userland",
        &["modules", "console"],
        |_| {
            crate::process::spawn_init("/init")?;
            Ok(())
        },
    ));
    graph.execute(boot);
}
