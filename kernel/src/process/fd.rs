//! Per-process file descriptors
//!
//! A fixed-size table of refcounted descriptors. The integer fd is the
//! slot index. Fork shares descriptors (refcount++), close drops one
//! reference; the node itself lives as long as any table references it.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{sync::Arc, vec, vec::Vec};

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::Errno;
use crate::fs::VfsNode;

/// Hard cap on open descriptors per process.
pub const OPEN_MAX: usize = 256;

/// An open file: a node reference plus the byte offset.
#[derive(Debug)]
pub struct FileDescriptor {
    pub refcount: AtomicUsize,
    pub offset: AtomicU64,
    pub flags: AtomicU32,
    pub node: Arc<VfsNode>,
}

impl FileDescriptor {
    pub fn new(node: Arc<VfsNode>, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicUsize::new(1),
            offset: AtomicU64::new(0),
            flags: AtomicU32::new(flags),
            node,
        })
    }
}

/// The per-process descriptor table.
pub struct FdTable {
    slots: Mutex<Vec<Option<Arc<FileDescriptor>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; OPEN_MAX]),
        }
    }

    /// Resolve an fd number. EBADF for empty or out-of-range slots.
    pub fn get(&self, fd: usize) -> Result<Arc<FileDescriptor>, Errno> {
        if fd >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        self.slots.lock()[fd].clone().ok_or(Errno::EBADF)
    }

    /// Install into the lowest free slot at or above `min`. ENFILE when
    /// the table is full.
    pub fn install(&self, desc: Arc<FileDescriptor>, min: usize) -> Result<usize, Errno> {
        let mut slots = self.slots.lock();
        for fd in min..OPEN_MAX {
            if slots[fd].is_none() {
                slots[fd] = Some(desc);
                return Ok(fd);
            }
        }
        Err(Errno::ENFILE)
    }

    /// Install into a specific slot, sharing the descriptor.
    pub fn install_at(&self, fd: usize, desc: Arc<FileDescriptor>) -> Result<(), Errno> {
        if fd >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        desc.refcount.fetch_add(1, Ordering::Relaxed);
        let previous = self.slots.lock()[fd].replace(desc);
        if let Some(old) = previous {
            old.refcount.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Close one slot.
    pub fn close(&self, fd: usize) -> Result<(), Errno> {
        if fd >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        let desc = self.slots.lock()[fd].take().ok_or(Errno::EBADF)?;
        desc.refcount.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release every descriptor (process teardown).
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(desc) = slot.take() {
                desc.refcount.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Duplicate for fork: same descriptors, shared offsets.
    pub fn clone_for_fork(&self) -> Self {
        let table = Self::new();
        {
            let src = self.slots.lock();
            let mut dst = table.slots.lock();
            for (fd, slot) in src.iter().enumerate() {
                if let Some(desc) = slot {
                    desc.refcount.fetch_add(1, Ordering::Relaxed);
                    dst[fd] = Some(desc.clone());
                }
            }
        }
        table
    }

    /// Number of live descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs;

    fn test_node(tag: &str) -> Arc<VfsNode> {
        fs::init(&[]);
        let ops: Arc<dyn fs::NodeOps> =
            Arc::new(fs::handle::MemoryFile::new(b"x", fs::alloc_inode()));
        match fs::create_node(&fs::root(), tag, Some(ops)) {
            Ok(node) => node,
            Err(_) => fs::lookup(&fs::root(), tag).unwrap(),
        }
    }

    #[test]
    fn install_uses_lowest_free_slot() {
        let table = FdTable::new();
        let node = test_node("fd-low");
        let a = table.install(FileDescriptor::new(node.clone(), 0), 0).unwrap();
        let b = table.install(FileDescriptor::new(node.clone(), 0), 0).unwrap();
        assert_eq!((a, b), (0, 1));
        table.close(0).unwrap();
        let c = table.install(FileDescriptor::new(node, 0), 0).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn exhaustion_reports_enfile() {
        let table = FdTable::new();
        let node = test_node("fd-full");
        for _ in 0..OPEN_MAX {
            table
                .install(FileDescriptor::new(node.clone(), 0), 0)
                .unwrap();
        }
        assert_eq!(
            table
                .install(FileDescriptor::new(node, 0), 0)
                .unwrap_err(),
            Errno::ENFILE
        );
    }

    #[test]
    fn bad_fd_reports_ebadf() {
        let table = FdTable::new();
        assert_eq!(table.get(3).unwrap_err(), Errno::EBADF);
        assert_eq!(table.get(OPEN_MAX + 7).unwrap_err(), Errno::EBADF);
        assert_eq!(table.close(3).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn fork_shares_descriptors_and_offsets() {
        let table = FdTable::new();
        let node = test_node("fd-fork");
        let desc = FileDescriptor::new(node, 0);
        table.install(desc.clone(), 0).unwrap();

        let forked = table.clone_for_fork();
        assert_eq!(desc.refcount.load(Ordering::Relaxed), 2);

        // Offsets are shared state on the descriptor.
        forked.get(0).unwrap().offset.store(42, Ordering::Relaxed);
        assert_eq!(table.get(0).unwrap().offset.load(Ordering::Relaxed), 42);

        forked.close_all();
        assert_eq!(desc.refcount.load(Ordering::Relaxed), 1);
    }
}
