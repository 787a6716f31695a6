//! Architecture porting surface
//!
//! Each port exposes the same set of items: a `Context` trap frame,
//! `ThreadExtra` per-thread register state, TLB/page-table-root control,
//! interrupt toggles, the timer/syscall vectors, and CPU bring-up. The
//! x86_64 port is complete; riscv64 is the stub port that keeps the
//! surface honest. Hosted builds get no-op fallbacks inside each port so
//! the unit tests can drive the cross-platform code.

pub mod cpu;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use riscv64::*;
