//! Device/file handle contract
//!
//! Filesystems and device drivers implement `NodeOps`; the kernel only
//! ever talks to this trait. Defaults follow the device-file interface:
//! unimplemented read/write report ENOSYS, unimplemented ioctls report
//! ENOTTY (including the well-known terminal requests on non-terminals).

use crate::error::Errno;

// Well-known terminal ioctl requests.
pub const TCGETS: usize = 0x5401;
pub const TCSETS: usize = 0x5402;
pub const TIOCGWINSZ: usize = 0x5413;

// Stat mode bits (POSIX layout).
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFMT: u32 = 0o170000;

/// File metadata as reported to `stat`-family syscalls.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_blksize: u64,
    pub st_blocks: u64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.st_mode & S_IFMT == S_IFREG
    }
}

/// Operations a node's backing object supports.
pub trait NodeOps: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read.
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Write `buf` at `offset`. Returns bytes written.
    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Device control. Non-terminals answer the terminal requests with
    /// ENOTTY, which is exactly what `isatty` probes for.
    fn ioctl(&self, request: usize, _arg: usize) -> Result<usize, Errno> {
        match request {
            TCGETS | TCSETS | TIOCGWINSZ => Err(Errno::ENOTTY),
            _ => Err(Errno::ENOTTY),
        }
    }

    /// Metadata.
    fn stat(&self) -> Stat;
}

/// A regular file fully backed by memory the bootloader loaded.
pub struct MemoryFile {
    data: &'static [u8],
    inode: u64,
}

impl MemoryFile {
    pub fn new(data: &'static [u8], inode: u64) -> Self {
        Self { data, inode }
    }
}

impl NodeOps for MemoryFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let take = buf.len().min(self.data.len() - offset);
        buf[..take].copy_from_slice(&self.data[offset..offset + take]);
        Ok(take)
    }

    fn stat(&self) -> Stat {
        Stat {
            st_ino: self.inode,
            st_mode: S_IFREG | 0o644,
            st_nlink: 1,
            st_size: self.data.len() as u64,
            st_blksize: 512,
            st_blocks: (self.data.len() as u64).div_ceil(512),
            ..Default::default()
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct Bare;
    impl NodeOps for Bare {
        fn stat(&self) -> Stat {
            Stat::default()
        }
    }

    #[test]
    fn defaults_report_enosys_and_enotty() {
        let node = Bare;
        let mut buf = [0u8; 4];
        assert_eq!(node.read(0, &mut buf), Err(Errno::ENOSYS));
        assert_eq!(node.write(0, &buf), Err(Errno::ENOSYS));
        assert_eq!(node.ioctl(TCGETS, 0), Err(Errno::ENOTTY));
    }

    #[test]
    fn memory_file_reads_with_offset() {
        let file = MemoryFile::new(b"obsidian", 1);
        let mut buf = [0u8; 16];
        assert_eq!(file.read(3, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"idian");
        assert_eq!(file.read(100, &mut buf), Ok(0));
        assert!(file.stat().is_regular());
    }
}
