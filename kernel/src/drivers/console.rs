//! Console terminal device
//!
//! A line-oriented terminal node registered at `/dev/console` and marked
//! as the active terminal. New user processes get fds 0/1/2 pointing
//! here. Output is echoed to the serial console and kept in a capture
//! buffer (which is also what the boot-to-userland test rig inspects).

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::error::Errno;
use crate::fs::handle::{self, NodeOps, Stat};
use crate::fs::VfsNode;

/// Capture cap so a chatty process cannot eat the kernel heap.
const CAPTURE_LIMIT: usize = 64 * 1024;

pub struct Terminal {
    captured: Mutex<Vec<u8>>,
    inode: u64,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            captured: Mutex::new(Vec::new()),
            inode: crate::fs::alloc_inode(),
        }
    }

    /// Everything written so far.
    pub fn captured(&self) -> Vec<u8> {
        self.captured.lock().clone()
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeOps for Terminal {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        // No input queue wired up yet; a keyboard module provides one.
        Err(Errno::EAGAIN)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        if let Ok(text) = core::str::from_utf8(buf) {
            crate::print!("{}", text);
        }
        let mut captured = self.captured.lock();
        if captured.len() < CAPTURE_LIMIT {
            let take = buf.len().min(CAPTURE_LIMIT - captured.len());
            captured.extend_from_slice(&buf[..take]);
        }
        Ok(buf.len())
    }

    fn ioctl(&self, request: usize, _arg: usize) -> Result<usize, Errno> {
        match request {
            handle::TCGETS | handle::TCSETS | handle::TIOCGWINSZ => Ok(0),
            _ => Err(Errno::ENOTTY),
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            st_ino: self.inode,
            st_mode: handle::S_IFCHR | 0o620,
            st_nlink: 1,
            ..Default::default()
        }
    }
}

static ACTIVE: Mutex<Option<Arc<VfsNode>>> = Mutex::new(None);
static REGISTERED: Mutex<Option<Arc<Terminal>>> = Mutex::new(None);

/// Register the console terminal and make it active.
pub fn init() {
    let root = crate::fs::root();
    let dev = match crate::fs::lookup(&root, "/dev") {
        Ok(dev) => dev,
        Err(_) => match crate::fs::create_dir(&root, "dev") {
            Ok(dev) => dev,
            Err(err) => {
                log::error!("console: no /dev: {}", err);
                return;
            }
        },
    };
    let terminal = Arc::new(Terminal::new());
    let ops: Arc<dyn NodeOps> = terminal.clone();
    match crate::fs::create_node(&dev, "console", Some(ops)) {
        Ok(node) => {
            *REGISTERED.lock() = Some(terminal);
            set_active(node);
        }
        Err(Errno::EEXIST) => {
            // Reinitialization (tests): keep the existing node active.
            if let Ok(node) = crate::fs::lookup(&root, "/dev/console") {
                set_active(node);
            }
        }
        Err(err) => log::error!("console: cannot register /dev/console: {}", err),
    }
}

/// Bytes written to the registered console so far.
pub fn captured_output() -> Vec<u8> {
    REGISTERED
        .lock()
        .as_ref()
        .map(|terminal| terminal.captured())
        .unwrap_or_default()
}

/// Make `node` the terminal new processes inherit.
pub fn set_active(node: Arc<VfsNode>) {
    *ACTIVE.lock() = Some(node);
}

/// The active terminal node, if any.
pub fn active() -> Option<Arc<VfsNode>> {
    ACTIVE.lock().clone()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn terminal_captures_written_bytes() {
        let terminal = Terminal::new();
        terminal.write(0, b"hi").expect("write");
        assert_eq!(terminal.captured(), b"hi");
    }

    #[test]
    fn terminal_answers_terminal_ioctls() {
        let terminal = Terminal::new();
        assert_eq!(terminal.ioctl(handle::TCGETS, 0), Ok(0));
        assert_eq!(terminal.ioctl(0xDEAD, 0), Err(Errno::ENOTTY));
    }
}
