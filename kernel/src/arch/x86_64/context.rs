//! x86_64 trap frame and FPU state

use crate::mm::VirtAddr;

// Selector layout must match the GDT build order in gdt.rs and the
// syscall STAR programming (user data directly below user code).
/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_SS: u64 = 0x10;
/// User data segment selector (ring 3).
pub const USER_SS: u64 = 0x1B;
/// User code segment selector (ring 3).
pub const USER_CS: u64 = 0x23;

/// RFLAGS with the interrupt-enable bit plus the always-one bit.
const RFLAGS_IF: u64 = 0x202;

/// Register state pushed by the trap stubs, in push order.
///
/// The layout is shared with the assembly entry code; both sides count on
/// field order, so this stays `repr(C)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// Vector number pushed by the stub.
    pub isr: u64,
    /// Hardware error code, or 0 for vectors without one.
    pub error: u64,

    // Hardware-pushed interrupt frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Context {
    /// Frame that enters kernel code at `entry` on `stack`.
    pub fn new_kernel(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            rip: entry.as_u64(),
            rsp: stack.as_u64(),
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            rflags: RFLAGS_IF,
            ..Default::default()
        }
    }

    /// Frame that enters ring 3 at `entry` on `stack`.
    pub fn new_user(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            rip: entry.as_u64(),
            rsp: stack.as_u64(),
            cs: USER_CS,
            ss: USER_SS,
            rflags: RFLAGS_IF,
            ..Default::default()
        }
    }

    /// Did the trap come from ring 3?
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }

    /// Syscall number and the six arguments in kernel argument order.
    pub fn syscall_args(&self) -> (usize, [usize; 6]) {
        (
            self.rax as usize,
            [
                self.rdi as usize,
                self.rsi as usize,
                self.rdx as usize,
                self.r10 as usize,
                self.r8 as usize,
                self.r9 as usize,
            ],
        )
    }

    /// Place a syscall result: value in rax, error in rdx.
    pub fn set_syscall_result(&mut self, value: usize, error: usize) {
        self.rax = value as u64;
        self.rdx = error as u64;
    }
}

/// FXSAVE area. 16-byte alignment is an architectural requirement.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState(pub [u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0u8; 512])
    }
}

/// Per-thread register state outside the trap frame.
#[derive(Default, Clone)]
pub struct ThreadExtra {
    pub fs_base: u64,
    pub gs_base: u64,
    pub fpu: FpuState,
}
