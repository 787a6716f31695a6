//! Driver registration interfaces
//!
//! The actual drivers are external collaborators (usually loadable
//! modules); the kernel only provides the registration points: the PCI
//! driver/device match table, clock sources, and the console terminal
//! that process stdio is wired to.

pub mod clock;
pub mod console;
pub mod pci;
