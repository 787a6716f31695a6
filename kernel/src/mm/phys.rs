//! Physical frame allocator
//!
//! A single bitmap over the usable physical range, one bit per page
//! (set = in use). Allocation is first-fit for a run of consecutive free
//! pages, scanning from the index of the last allocation; if that fails
//! the scan restarts from zero before reporting out-of-memory. Freeing a
//! page that is already free is a fatal invariant violation.
//!
//! The bitmap itself is carved out of the first free region large enough
//! to hold it and is addressed through the direct map, so the allocator
//! keeps working when the direct-map base is rebased via
//! [`update_phys_base`].

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

use super::{align_up, PhysAddr, PAGE_SIZE};
use crate::boot::{PhysMemory, PhysMemoryUsage};
use crate::error::{KernelError, KernelResult};

/// Direct-map base. Reads do not take the allocator lock; the base only
/// changes during early boot before other CPUs run.
static PHYS_BASE: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());

struct FrameBitmap {
    /// Bitmap storage, reached through the direct map.
    bits: *mut u64,
    /// Total pages tracked (bitmap length in bits).
    num_pages: usize,
    /// Pages currently free.
    free_pages: usize,
    /// Index the next scan starts from.
    last_index: usize,
}

// SAFETY: the raw bitmap pointer is only dereferenced under the `PM` lock.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    const fn empty() -> Self {
        Self {
            bits: core::ptr::null_mut(),
            num_pages: 0,
            free_pages: 0,
            last_index: 0,
        }
    }

    #[inline]
    fn get(&self, index: usize) -> bool {
        // SAFETY: index < num_pages is checked by all callers; the bitmap
        // covers num_pages bits.
        unsafe { *self.bits.add(index / 64) & (1 << (index % 64)) != 0 }
    }

    #[inline]
    fn set(&mut self, index: usize) {
        unsafe { *self.bits.add(index / 64) |= 1 << (index % 64) }
    }

    #[inline]
    fn clear(&mut self, index: usize) {
        unsafe { *self.bits.add(index / 64) &= !(1 << (index % 64)) }
    }

    /// First-fit scan for `amount` consecutive free pages starting at
    /// `start`. Marks the run used and returns its first page index.
    fn take_run(&mut self, amount: usize, start: usize) -> Option<usize> {
        let mut i = start;
        'scan: while i + amount <= self.num_pages {
            for j in 0..amount {
                if self.get(i + j) {
                    // Skip past the used page that broke the run.
                    i += j + 1;
                    continue 'scan;
                }
            }
            for j in 0..amount {
                self.set(i + j);
            }
            self.last_index = i + amount;
            return Some(i);
        }
        None
    }
}

static PM: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::empty());

/// Set up the allocator from the boot memory map.
///
/// `phys_base` is the virtual address physical page 0 is visible at. Only
/// `Free` regions become allocatable; the bitmap is stolen from the front
/// of the first free region that can hold it.
pub fn init(phys_base: *mut u8, memory_map: &mut [PhysMemory]) {
    PHYS_BASE.store(phys_base, Ordering::SeqCst);

    // Highest usable physical byte decides how many pages the bitmap
    // tracks.
    let mut highest = 0u64;
    for region in memory_map.iter() {
        if region.usage != PhysMemoryUsage::Free {
            continue;
        }
        highest = highest.max(region.address + region.length);
    }
    let num_pages = (highest / PAGE_SIZE as u64) as usize;
    let bitmap_bytes = align_up(num_pages.div_ceil(8), PAGE_SIZE);

    let mut pm = PM.lock();
    pm.num_pages = num_pages;
    pm.free_pages = 0;
    pm.last_index = 0;

    // Steal space for the bitmap itself.
    for region in memory_map.iter_mut() {
        if region.usage != PhysMemoryUsage::Free {
            continue;
        }
        if region.length as usize >= bitmap_bytes {
            pm.bits = phys_base.wrapping_add(region.address as usize) as *mut u64;
            region.address += bitmap_bytes as u64;
            region.length -= bitmap_bytes as u64;
            break;
        }
    }
    assert!(
        !pm.bits.is_null(),
        "no free region large enough for the frame bitmap"
    );

    // Mark everything used, then punch out the free regions.
    // SAFETY: the bitmap region was just reserved above.
    unsafe {
        core::ptr::write_bytes(pm.bits as *mut u8, 0xFF, bitmap_bytes);
    }
    for region in memory_map.iter() {
        if region.usage != PhysMemoryUsage::Free {
            continue;
        }
        let first = (region.address / PAGE_SIZE as u64) as usize;
        let count = (region.length / PAGE_SIZE as u64) as usize;
        for page in first..first + count {
            pm.clear(page);
            pm.free_pages += 1;
        }
    }

    log::info!(
        "pm: {} pages usable ({} MiB), bitmap {} KiB",
        pm.free_pages,
        pm.free_pages * PAGE_SIZE / (1024 * 1024),
        bitmap_bytes / 1024
    );
}

/// Allocate `amount` consecutive physical pages.
pub fn alloc(amount: usize) -> KernelResult<PhysAddr> {
    debug_assert!(amount > 0);
    let mut pm = PM.lock();

    let start = pm.last_index;
    let index = match pm.take_run(amount, start) {
        Some(index) => index,
        // Slow path: retry from the beginning before giving up.
        None => match pm.take_run(amount, 0) {
            Some(index) => index,
            None => {
                return Err(KernelError::OutOfMemory {
                    requested_pages: amount,
                    free_pages: pm.free_pages,
                })
            }
        },
    };

    pm.free_pages -= amount;
    Ok(PhysAddr::new((index * PAGE_SIZE) as u64))
}

/// Allocate `amount` consecutive pages and zero them.
pub fn alloc_zeroed(amount: usize) -> KernelResult<PhysAddr> {
    let addr = alloc(amount)?;
    // SAFETY: the pages were just allocated and are covered by the direct
    // map.
    unsafe {
        core::ptr::write_bytes(addr.as_ptr(), 0, amount * PAGE_SIZE);
    }
    Ok(addr)
}

/// Return `amount` pages starting at `addr` to the pool.
///
/// Panics on double free: a clear bit here means the environment is
/// unsound.
pub fn free(addr: PhysAddr, amount: usize) {
    let mut pm = PM.lock();
    let first = addr.as_usize() / PAGE_SIZE;
    for page in first..first + amount {
        assert!(
            pm.get(page),
            "double free of physical page {:#x}",
            page * PAGE_SIZE
        );
        pm.clear(page);
    }
    pm.free_pages += amount;
}

/// Rebase the direct-map pointer. The bitmap pointer moves with it.
pub fn update_phys_base(new_base: *mut u8) {
    let mut pm = PM.lock();
    let old_base = PHYS_BASE.swap(new_base, Ordering::SeqCst);
    if !pm.bits.is_null() {
        let offset = pm.bits as usize - old_base as usize;
        pm.bits = new_base.wrapping_add(offset) as *mut u64;
    }
}

/// Virtual address physical page 0 is visible at.
pub fn phys_base() -> *mut u8 {
    PHYS_BASE.load(Ordering::SeqCst)
}

/// Pages currently free.
pub fn free_page_count() -> usize {
    PM.lock().free_pages
}

/// Pages tracked in total.
pub fn total_page_count() -> usize {
    PM.lock().num_pages
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testing;

    #[test]
    fn alloc_free_roundtrip_restores_count() {
        let _env = testing::env();
        let before = free_page_count();

        let a = alloc(3).expect("3-page run from fresh arena");
        assert_eq!(a.as_usize() % PAGE_SIZE, 0);
        assert_eq!(free_page_count(), before - 3);

        free(a, 3);
        assert_eq!(free_page_count(), before);
    }

    #[test]
    fn runs_are_consecutive_and_disjoint() {
        let _env = testing::env();

        let a = alloc(4).expect("first run");
        let b = alloc(4).expect("second run");
        // Two live runs never overlap.
        let (alo, ahi) = (a.as_u64(), a.as_u64() + 4 * PAGE_SIZE as u64);
        let (blo, bhi) = (b.as_u64(), b.as_u64() + 4 * PAGE_SIZE as u64);
        assert!(ahi <= blo || bhi <= alo);

        free(a, 4);
        free(b, 4);
    }

    #[test]
    fn zeroed_alloc_is_zero() {
        let _env = testing::env();
        let a = alloc(1).expect("page");
        // Dirty the page, free it, then demand a zeroed one at any address.
        unsafe { core::ptr::write_bytes(a.as_ptr(), 0xAB, PAGE_SIZE) };
        free(a, 1);

        let z = alloc_zeroed(1).expect("zeroed page");
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        free(z, 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let _env = testing::env();
        let a = alloc(1).expect("page");
        free(a, 1);
        free(a, 1);
    }
}
