//! Kernel heap
//!
//! A `linked_list_allocator` heap over a physically-contiguous region
//! handed out by the frame allocator, reached through the direct map.
//! Hosted builds use the system allocator instead (see `lib.rs`).

use super::{phys, PAGE_SIZE};

/// Heap size: 16 MiB of kernel allocations.
pub const HEAP_PAGES: usize = 4096;

/// Carve out and register the kernel heap. Must run after `phys::init`.
#[cfg(target_os = "none")]
pub fn init() {
    let region = phys::alloc(HEAP_PAGES).expect("cannot allocate kernel heap");
    // SAFETY: the region was just allocated, is unaliased, and stays
    // reserved for the heap forever.
    unsafe {
        crate::ALLOCATOR
            .lock()
            .init(region.as_ptr(), HEAP_PAGES * PAGE_SIZE);
    }
    log::info!(
        "heap: {} MiB at {}",
        HEAP_PAGES * PAGE_SIZE / (1024 * 1024),
        region
    );
}

#[cfg(not(target_os = "none"))]
pub fn init() {
    // Hosted: the system allocator is already live.
}
