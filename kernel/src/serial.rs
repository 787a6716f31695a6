//! Serial console output
//!
//! All kernel logging funnels through one UART. On x86_64 this is the
//! classic COM1 16550; the riscv64 stub port drives a memory-mapped
//! 16550-compatible register block as found on the QEMU virt machine.

use core::fmt;

use spin::Mutex;

pub struct SerialPort {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    inner: Option<uart_16550::SerialPort>,
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    inner: Option<MmioUart16550>,
    #[cfg(not(target_os = "none"))]
    _hosted: (),
}

impl SerialPort {
    pub const fn empty() -> Self {
        Self {
            #[cfg(all(any(target_arch = "x86_64", target_arch = "riscv64"), target_os = "none"))]
            inner: None,
            #[cfg(not(target_os = "none"))]
            _hosted: (),
        }
    }

    /// Bring up the UART. Safe to call more than once; later calls win.
    pub fn init(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            // SAFETY: 0x3F8 is the COM1 base port on every PC-compatible.
            let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
            port.init();
            self.inner = Some(port);
        }
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            self.inner = Some(MmioUart16550::new(0x1000_0000));
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(all(any(target_arch = "x86_64", target_arch = "riscv64"), target_os = "none"))]
        {
            if let Some(ref mut inner) = self.inner {
                inner.write_str(s)?;
            }
            Ok(())
        }
        #[cfg(not(target_os = "none"))]
        {
            extern crate std;
            use std::io::Write;
            let _ = std::io::stderr().write_all(s.as_bytes());
            Ok(())
        }
    }
}

/// 16550-compatible UART behind MMIO, as on the QEMU `virt` board.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct MmioUart16550 {
    base: usize,
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl MmioUart16550 {
    const THR: usize = 0x0;
    const LSR: usize = 0x5;
    const LSR_THR_EMPTY: u8 = 1 << 5;

    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: the register block is device memory set up by the platform;
        // volatile accesses are required and have no other side effects.
        unsafe {
            while core::ptr::read_volatile((self.base + Self::LSR) as *const u8)
                & Self::LSR_THR_EMPTY
                == 0
            {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile((self.base + Self::THR) as *mut u8, byte);
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl fmt::Write for MmioUart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// The one console UART.
pub static CONSOLE: Mutex<SerialPort> = Mutex::new(SerialPort::empty());

/// Initialize the serial console. Must run before the first log line.
pub fn init() {
    CONSOLE.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}
