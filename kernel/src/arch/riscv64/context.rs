//! riscv64 trap frame

use crate::mm::VirtAddr;

/// sstatus.SPIE: interrupts enabled after sret.
const SSTATUS_SPIE: u64 = 1 << 5;
/// sstatus.SPP: previous privilege was supervisor.
const SSTATUS_SPP: u64 = 1 << 8;

/// Register state captured at a trap, x1..x31 plus sepc/sstatus.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// x1..x31; index 0 is ra (x1), index 1 is sp (x2).
    pub regs: [u64; 31],
    pub sepc: u64,
    pub sstatus: u64,
}

impl Context {
    const SP: usize = 1; // x2
    const A0: usize = 9; // x10
    const A1: usize = 10; // x11
    const A7: usize = 16; // x17

    /// Frame that enters supervisor code at `entry` on `stack`.
    pub fn new_kernel(entry: VirtAddr, stack: VirtAddr) -> Self {
        let mut ctx = Self {
            sepc: entry.as_u64(),
            sstatus: SSTATUS_SPIE | SSTATUS_SPP,
            ..Default::default()
        };
        ctx.regs[Self::SP] = stack.as_u64();
        ctx
    }

    /// Frame that enters user code at `entry` on `stack`.
    pub fn new_user(entry: VirtAddr, stack: VirtAddr) -> Self {
        let mut ctx = Self {
            sepc: entry.as_u64(),
            sstatus: SSTATUS_SPIE,
            ..Default::default()
        };
        ctx.regs[Self::SP] = stack.as_u64();
        ctx
    }

    /// Did the trap come from user mode?
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }

    /// Syscall number (a7) and arguments (a0..a5).
    pub fn syscall_args(&self) -> (usize, [usize; 6]) {
        (
            self.regs[Self::A7] as usize,
            [
                self.regs[Self::A0] as usize,
                self.regs[Self::A1] as usize,
                self.regs[Self::A1 + 1] as usize,
                self.regs[Self::A1 + 2] as usize,
                self.regs[Self::A1 + 3] as usize,
                self.regs[Self::A1 + 4] as usize,
            ],
        )
    }

    /// Place a syscall result: value in a0, error in a1.
    pub fn set_syscall_result(&mut self, value: usize, error: usize) {
        self.regs[Self::A0] = value as u64;
        self.regs[Self::A1] = error as u64;
    }
}

/// F/D register file image.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState(pub [u8; 264]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0u8; 264])
    }
}

/// Per-thread register state outside the trap frame. The stub port has no
/// segment bases; only the FPU image travels with the thread.
#[derive(Default, Clone)]
pub struct ThreadExtra {
    pub fpu: FpuState,
}
