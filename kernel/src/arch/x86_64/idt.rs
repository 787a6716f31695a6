//! IDT and low-level trap entry
//!
//! All 256 vectors funnel through one assembly path that materializes a
//! [`Context`] frame and calls `irq::int_handler`. The handler returns the
//! context to resume, which is how the scheduler switches threads from
//! inside the timer interrupt. The `syscall` instruction gets its own
//! entry that fakes up the same frame shape before joining the common
//! dispatch.

#![cfg(target_os = "none")]

use core::mem::size_of;

use spin::Mutex;

use super::context::{Context, KERNEL_CS};

/// Gate type: present, interrupt gate, DPL 0.
const GATE_INTERRUPT: u8 = 0x8E;
/// Same, but reachable from ring 3 (`int 0x80`).
const GATE_USER: u8 = 0xEE;

use super::{INT_SYSCALL, INT_TIMER};

// The timer gate stays DPL 0; `int INT_TIMER` is only issued from kernel
// mode by the scheduler's voluntary-yield path.
const _: () = assert!(INT_TIMER < 256 && INT_SYSCALL < 256);

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    flags: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            flags: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, flags: u8) {
        self.offset_low = handler as u16;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = KERNEL_CS as u16;
        self.ist = 0;
        self.flags = flags;
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

static IDT: Mutex<[IdtEntry; 256]> = Mutex::new([IdtEntry::missing(); 256]);

extern "C" {
    /// 256 stub addresses, filled in by the assembly below.
    static ISR_STUB_TABLE: [u64; 256];
    fn syscall_entry();
}

/// Build the IDT from the stub table and load it on this CPU.
pub fn init() {
    {
        let mut idt = IDT.lock();
        for (vector, entry) in idt.iter_mut().enumerate() {
            // SAFETY: the stub table is a static produced by our own asm.
            let stub = unsafe { ISR_STUB_TABLE[vector] };
            let flags = if vector == INT_SYSCALL {
                GATE_USER
            } else {
                GATE_INTERRUPT
            };
            entry.set(stub, flags);
        }
    }
    load();
    init_syscall_msrs();
}

/// Load the shared IDT on the calling CPU.
pub fn load() {
    let idt = IDT.lock();
    let pointer = IdtPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.as_ptr() as u64,
    };
    // SAFETY: the IDT is 'static and the pointer describes it exactly.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack));
    }
}

/// Program the `syscall`/`sysret` MSRs.
fn init_syscall_msrs() {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::structures::gdt::SegmentSelector;
    use x86_64::PrivilegeLevel;

    let kernel_cs = SegmentSelector::new(1, PrivilegeLevel::Ring0);
    let kernel_ss = SegmentSelector::new(2, PrivilegeLevel::Ring0);
    let user_ss = SegmentSelector::new(3, PrivilegeLevel::Ring3);
    let user_cs = SegmentSelector::new(4, PrivilegeLevel::Ring3);

    // SAFETY: selectors match the GDT layout built in gdt.rs; the entry
    // symbol is our own.
    unsafe {
        Star::write(user_cs, user_ss, kernel_cs, kernel_ss).expect("STAR layout");
        LStar::write(x86_64::VirtAddr::new(syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

// Trap stubs. Vectors with a hardware error code skip the dummy push so
// the frame shape is uniform. The common path saves the GPRs in Context
// order, hands (vector, frame) to the dispatcher, then resumes whatever
// frame the dispatcher returned.
core::arch::global_asm!(
    r#"
.altmacro

.macro isr_stub vector
    .align 16
isr_stub_\vector\():
    .if (\vector == 8) || (\vector >= 10 && \vector <= 14) || (\vector == 17) || (\vector == 21) || (\vector == 29) || (\vector == 30)
    push \vector
    .else
    push 0
    push \vector
    .endif
    jmp interrupt_common
.endm

.macro isr_label vector
    .quad isr_stub_\vector
.endm

.section .text
.set vec, 0
.rept 256
    isr_stub %vec
    .set vec, vec + 1
.endr

.align 16
interrupt_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    // Swap to the kernel GS if we came from ring 3.
    test qword ptr [rsp + 144], 3
    jz 1f
    swapgs
1:
    mov rdi, [rsp + 120]
    mov rsi, rsp
    cld
    call {dispatch}
    mov rsp, rax

    test qword ptr [rsp + 144], 3
    jz 2f
    swapgs
2:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq

// `syscall` entry: build the same Context shape from the sysret
// registers, dispatch, and return through sysretq.
.global syscall_entry
.align 16
syscall_entry:
    swapgs
    mov gs:[32], rsp          // Cpu.user_stack
    mov rsp, gs:[24]          // Cpu.kernel_stack

    push {user_ss}
    push gs:[32]
    push r11                  // rflags
    push {user_cs}
    push rcx                  // rip
    push 0                    // error
    push {syscall_vector}     // isr

    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, {syscall_vector}
    mov rsi, rsp
    cld
    call {dispatch}
    mov rsp, rax

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16

    pop rcx                   // rip
    add rsp, 8                // cs
    pop r11                   // rflags
    swapgs
    mov rsp, [rsp]            // user stack
    sysretq

.section .rodata
.global ISR_STUB_TABLE
.align 8
ISR_STUB_TABLE:
.set vec, 0
.rept 256
    isr_label %vec
    .set vec, vec + 1
.endr
"#,
    dispatch = sym crate::irq::int_handler,
    user_ss = const super::context::USER_SS,
    user_cs = const super::context::USER_CS,
    syscall_vector = const INT_SYSCALL as u64,
);

const _: () = assert!(size_of::<Context>() == 176);
