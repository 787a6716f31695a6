//! GDT and TSS setup
//!
//! One GDT per CPU with the selector layout the context code and the
//! syscall MSRs expect: kernel code/data at 0x08/0x10, user data/code at
//! 0x2B/0x33, TSS after that. The TSS carries the kernel stack the CPU
//! switches to on a ring transition; the scheduler updates it on every
//! context switch.

#![cfg(target_os = "none")]

use spin::Mutex;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr as X64VirtAddr};

use super::super::cpu::MAX_CPUS;

struct CpuTables {
    gdt: GlobalDescriptorTable,
    tss: TaskStateSegment,
}

impl CpuTables {
    const fn new() -> Self {
        Self {
            gdt: GlobalDescriptorTable::empty(),
            tss: TaskStateSegment::new(),
        }
    }
}

static TABLES: [Mutex<CpuTables>; MAX_CPUS] = [const { Mutex::new(CpuTables::new()) }; MAX_CPUS];

/// Build and load the GDT/TSS for `cpu`. The double-fault stack is wired
/// separately by the IDT setup.
pub fn init(cpu: usize, kernel_stack_top: u64) {
    let mut tables = TABLES[cpu].lock();
    tables.tss.privilege_stack_table[0] = X64VirtAddr::new(kernel_stack_top);

    // SAFETY: the tables live in a static and are never moved; the
    // selectors below match the layout just built.
    unsafe {
        let tables = &mut *(&mut *tables as *mut CpuTables);
        let kernel_code = tables.gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = tables.gdt.append(Descriptor::kernel_data_segment());
        let _user_data = tables.gdt.append(Descriptor::user_data_segment());
        let _user_code = tables.gdt.append(Descriptor::user_code_segment());
        let tss_sel = tables.gdt.append(Descriptor::tss_segment(&tables.tss));

        tables.gdt.load_unsafe();
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        DS::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        ES::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        load_tss(tss_sel);
    }
}

/// Point the TSS ring-0 stack at the incoming thread's kernel stack.
pub fn set_kernel_stack(cpu: usize, stack_top: u64) {
    TABLES[cpu].lock().tss.privilege_stack_table[0] = X64VirtAddr::new(stack_top);
}
