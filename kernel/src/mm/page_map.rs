//! Per-address-space page maps
//!
//! A `PageMap` names a 4-level translation tree (9 bits per level, 4 KiB
//! granule) guarded by a single lock. Two distinguished maps exist: the
//! kernel map, which owns the upper half (direct physical mapping, foreign
//! region, module region, kernel image), and per-process maps whose roots
//! carry a copy of the kernel-half entries so no switch is needed on a
//! syscall.
//!
//! Table memory is only ever touched through the direct map
//! (`phys::phys_base() + pa`), so the walker runs unmodified in hosted
//! unit tests. The entry format is the x86_64 long-mode one; the riscv64
//! port grows its own leaf encoder when it outgrows the stub stage.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::{Mutex, Once};

use super::{phys, PhysAddr, VirtAddr, FOREIGN_BASE, HHDM_BASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Page protection, independent of the hardware encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags orthogonal to protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u8 {
        const USER = 1 << 0;
    }
}

/// Leaf granule selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmLevel {
    /// 4 KiB
    Small,
    /// 2 MiB
    Medium,
    /// 1 GiB
    Large,
}

impl VmLevel {
    /// Bytes covered by one leaf at this level.
    pub const fn size(self) -> usize {
        match self {
            VmLevel::Small => PAGE_SIZE,
            VmLevel::Medium => 2 * 1024 * 1024,
            VmLevel::Large => 1024 * 1024 * 1024,
        }
    }

    /// Walk depth the leaf lives at (1 = innermost table).
    const fn depth(self) -> usize {
        match self {
            VmLevel::Small => 1,
            VmLevel::Medium => 2,
            VmLevel::Large => 3,
        }
    }
}

// x86_64 long-mode entry bits.
const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_HUGE: u64 = 1 << 7;
const ENTRY_NX: u64 = 1 << 63;
const ENTRY_ADDR: u64 = 0x000F_FFFF_FFFF_F000;

const ENTRIES_PER_TABLE: usize = 512;
/// Root entries below this index translate user addresses.
const KERNEL_HALF_START: usize = 256;

/// Watermark for temporary kernel aliases of user pages.
static FOREIGN_WATERMARK: AtomicU64 = AtomicU64::new(FOREIGN_BASE);

static KERNEL_MAP: Once<PageMap> = Once::new();

/// The kernel's own page map.
pub fn kernel_map() -> &'static PageMap {
    KERNEL_MAP.get().expect("kernel page map not initialized")
}

#[inline]
unsafe fn entry_ptr(table: PhysAddr, index: usize) -> *mut u64 {
    debug_assert!(index < ENTRIES_PER_TABLE);
    // SAFETY: `table` names a page-table frame reachable through the
    // direct map; callers hold the owning map's lock.
    unsafe { (table.as_ptr() as *mut u64).add(index) }
}

#[inline]
unsafe fn read_entry(table: PhysAddr, index: usize) -> u64 {
    unsafe { entry_ptr(table, index).read_volatile() }
}

#[inline]
unsafe fn write_entry(table: PhysAddr, index: usize, value: u64) {
    unsafe { entry_ptr(table, index).write_volatile(value) }
}

#[inline]
const fn table_index(virt: VirtAddr, depth: usize) -> usize {
    ((virt.as_u64() >> (12 + 9 * (depth - 1))) & 0x1FF) as usize
}

fn leaf_bits(prot: VmProt, flags: VmFlags, level: VmLevel) -> u64 {
    let mut bits = ENTRY_PRESENT;
    if prot.contains(VmProt::WRITE) {
        bits |= ENTRY_WRITE;
    }
    if !prot.contains(VmProt::EXEC) {
        bits |= ENTRY_NX;
    }
    if flags.contains(VmFlags::USER) {
        bits |= ENTRY_USER;
    }
    if level.depth() > 1 {
        bits |= ENTRY_HUGE;
    }
    bits
}

/// A per-address-space translation tree.
pub struct PageMap {
    lock: Mutex<()>,
    root: PhysAddr,
}

impl PageMap {
    /// Create a fresh map whose kernel half mirrors the kernel map.
    pub fn new() -> KernelResult<Self> {
        let root = phys::alloc_zeroed(1)?;
        let kernel_root = kernel_map().root;
        for index in KERNEL_HALF_START..ENTRIES_PER_TABLE {
            // SAFETY: both roots are live table frames; the kernel half is
            // append-only after boot, so a snapshot copy is stable.
            unsafe { write_entry(root, index, read_entry(kernel_root, index)) };
        }
        Ok(Self {
            lock: Mutex::new(()),
            root,
        })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Install a leaf translating `virt` to `phys` at the given level,
    /// allocating intermediate tables as needed. Intermediate entries
    /// carry Write and, for user mappings, User.
    pub fn map(
        &self,
        phys_addr: PhysAddr,
        virt: VirtAddr,
        prot: VmProt,
        flags: VmFlags,
        level: VmLevel,
    ) -> KernelResult<()> {
        let _guard = self.lock.lock();
        let user = flags.contains(VmFlags::USER);
        let mut table = self.root;

        for depth in (1..=4).rev() {
            let index = table_index(virt, depth);
            if depth == level.depth() {
                let entry = (phys_addr.as_u64() & ENTRY_ADDR) | leaf_bits(prot, flags, level);
                // SAFETY: walk holds the map lock; `table` is a live frame.
                unsafe { write_entry(table, index, entry) };
                crate::arch::flush_tlb(virt);
                return Ok(());
            }
            table = self.descend(table, index, true, user)?;
        }
        unreachable!("walk terminated without reaching the leaf level")
    }

    /// Change the protection of the leaf covering `virt`, preserving the
    /// translated physical address and granule.
    pub fn protect(&self, virt: VirtAddr, prot: VmProt) -> KernelResult<()> {
        let _guard = self.lock.lock();
        let (table, index, _depth) = self.find_leaf(virt)?;
        // SAFETY: find_leaf proved the entry present; lock is held.
        unsafe {
            let old = read_entry(table, index);
            let keep = old & (ENTRY_ADDR | ENTRY_HUGE | ENTRY_USER);
            let mut bits = ENTRY_PRESENT;
            if prot.contains(VmProt::WRITE) {
                bits |= ENTRY_WRITE;
            }
            if !prot.contains(VmProt::EXEC) {
                bits |= ENTRY_NX;
            }
            write_entry(table, index, keep | bits);
        }
        crate::arch::flush_tlb(virt);
        Ok(())
    }

    /// Remove the leaf covering `virt`.
    pub fn unmap(&self, virt: VirtAddr) -> KernelResult<()> {
        let _guard = self.lock.lock();
        let (table, index, _depth) = self.find_leaf(virt)?;
        // SAFETY: as in `protect`.
        unsafe { write_entry(table, index, 0) };
        crate::arch::flush_tlb(virt);
        Ok(())
    }

    /// Translate `virt` to its physical address, honoring huge leaves.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let _guard = self.lock.lock();
        let (table, index, depth) = self.find_leaf(virt).ok()?;
        // SAFETY: as in `protect`.
        let entry = unsafe { read_entry(table, index) };
        let leaf_size = 1u64 << (12 + 9 * (depth - 1));
        let offset = virt.as_u64() & (leaf_size - 1);
        Some(PhysAddr::new((entry & ENTRY_ADDR) | offset))
    }

    /// Duplicate the user half of this map. Intermediate tables are deep
    /// copied; leaf frames are copied into freshly allocated frames so the
    /// two spaces never alias.
    pub fn fork(&self) -> KernelResult<PageMap> {
        let _guard = self.lock.lock();
        let child = PageMap::new()?;
        for index in 0..KERNEL_HALF_START {
            // SAFETY: source lock held; child is not shared yet.
            let entry = unsafe { read_entry(self.root, index) };
            if entry & ENTRY_PRESENT == 0 {
                continue;
            }
            let copied = fork_table(PhysAddr::new(entry & ENTRY_ADDR), 3)?;
            unsafe { write_entry(child.root, index, copied.as_u64() | (entry & !ENTRY_ADDR)) };
        }
        Ok(child)
    }

    /// Make this map the active translation root.
    pub fn set_active(&self) {
        crate::arch::set_page_table_root(self.root);
    }

    fn descend(
        &self,
        table: PhysAddr,
        index: usize,
        allocate: bool,
        user: bool,
    ) -> KernelResult<PhysAddr> {
        // SAFETY: callers hold the map lock.
        let entry = unsafe { read_entry(table, index) };
        if entry & ENTRY_PRESENT != 0 {
            if user && entry & ENTRY_USER == 0 {
                unsafe { write_entry(table, index, entry | ENTRY_USER) };
            }
            return Ok(PhysAddr::new(entry & ENTRY_ADDR));
        }
        if !allocate {
            return Err(KernelError::UnmappedMemory {
                addr: table.as_usize(),
            });
        }
        let next = phys::alloc_zeroed(1)?;
        let mut bits = ENTRY_PRESENT | ENTRY_WRITE;
        if user {
            bits |= ENTRY_USER;
        }
        unsafe { write_entry(table, index, next.as_u64() | bits) };
        Ok(next)
    }

    /// Walk to the present leaf covering `virt`. Returns the table frame,
    /// the entry index and the depth the leaf lives at.
    fn find_leaf(&self, virt: VirtAddr) -> KernelResult<(PhysAddr, usize, usize)> {
        let mut table = self.root;
        for depth in (1..=4).rev() {
            let index = table_index(virt, depth);
            // SAFETY: callers hold the map lock.
            let entry = unsafe { read_entry(table, index) };
            if entry & ENTRY_PRESENT == 0 {
                return Err(KernelError::UnmappedMemory {
                    addr: virt.as_usize(),
                });
            }
            if depth == 1 || entry & ENTRY_HUGE != 0 {
                return Ok((table, index, depth));
            }
            table = PhysAddr::new(entry & ENTRY_ADDR);
        }
        unreachable!("walk terminated without reaching the leaf level")
    }
}

/// Deep-copy one user-half table subtree, copying leaf frames.
fn fork_table(src: PhysAddr, depth: usize) -> KernelResult<PhysAddr> {
    let dst = phys::alloc_zeroed(1)?;
    for index in 0..ENTRIES_PER_TABLE {
        // SAFETY: source map lock is held by `fork`.
        let entry = unsafe { read_entry(src, index) };
        if entry & ENTRY_PRESENT == 0 {
            continue;
        }
        let flags = entry & !ENTRY_ADDR;
        let target = if depth == 1 || entry & ENTRY_HUGE != 0 {
            // Leaf: copy the backing frames.
            let leaf_size = 1usize << (12 + 9 * (depth - 1));
            let pages = leaf_size / PAGE_SIZE;
            let copy = phys::alloc(pages)?;
            // SAFETY: both ranges are whole allocated frames under the
            // direct map and cannot overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    PhysAddr::new(entry & ENTRY_ADDR).as_ptr(),
                    copy.as_ptr(),
                    leaf_size,
                );
            }
            copy
        } else {
            fork_table(PhysAddr::new(entry & ENTRY_ADDR), depth - 1)?
        };
        unsafe { write_entry(dst, index, target.as_u64() | flags) };
    }
    Ok(dst)
}

/// Recursively free the intermediate tables of one user-half subtree.
/// Leaf frames stay with their owners (mmap regions, loaded segments).
fn destroy_table(table: PhysAddr, depth: usize) {
    if depth > 1 {
        for index in 0..ENTRIES_PER_TABLE {
            // SAFETY: the map is being destroyed; nobody else references it.
            let entry = unsafe { read_entry(table, index) };
            if entry & ENTRY_PRESENT == 0 || entry & ENTRY_HUGE != 0 {
                continue;
            }
            destroy_table(PhysAddr::new(entry & ENTRY_ADDR), depth - 1);
        }
    }
    phys::free(table, 1);
}

impl Drop for PageMap {
    fn drop(&mut self) {
        for index in 0..KERNEL_HALF_START {
            // SAFETY: exclusive access during drop.
            let entry = unsafe { read_entry(self.root, index) };
            if entry & ENTRY_PRESENT != 0 {
                destroy_table(PhysAddr::new(entry & ENTRY_ADDR), 3);
            }
        }
        phys::free(self.root, 1);
    }
}

/// Build the kernel map: the whole physical space linearly mapped into the
/// upper half at the largest granule that fits, ready for the kernel image
/// segments to be re-protected on top.
pub fn init_kernel_map(highest_phys: u64) {
    KERNEL_MAP.call_once(|| {
        let root = phys::alloc_zeroed(1).expect("cannot allocate kernel page map root");
        let map = PageMap {
            lock: Mutex::new(()),
            root,
        };

        let prot = VmProt::READ | VmProt::WRITE;
        let mut cur = 0u64;
        while cur < highest_phys {
            let level = if cur % VmLevel::Large.size() as u64 == 0
                && highest_phys - cur >= VmLevel::Large.size() as u64
            {
                VmLevel::Large
            } else if cur % VmLevel::Medium.size() as u64 == 0
                && highest_phys - cur >= VmLevel::Medium.size() as u64
            {
                VmLevel::Medium
            } else {
                VmLevel::Small
            };
            map.map(
                PhysAddr::new(cur),
                VirtAddr::new(HHDM_BASE + cur),
                prot,
                VmFlags::empty(),
                level,
            )
            .expect("cannot build the direct physical mapping");
            cur += level.size() as u64;
        }

        map
    });
}

/// Re-map the kernel image segments with their proper permissions. Runs
/// after [`init_kernel_map`] on bare metal, before the map goes live.
#[cfg(target_os = "none")]
pub fn remap_kernel_segments(kernel_phys: PhysAddr, kernel_virt: VirtAddr) {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __data_end: u8;
    }

    // SAFETY: linker-provided section bounds.
    let segments = unsafe {
        [
            (
                &__text_start as *const u8 as u64,
                &__text_end as *const u8 as u64,
                VmProt::READ | VmProt::EXEC,
            ),
            (
                &__rodata_start as *const u8 as u64,
                &__rodata_end as *const u8 as u64,
                VmProt::READ,
            ),
            (
                &__data_start as *const u8 as u64,
                &__data_end as *const u8 as u64,
                VmProt::READ | VmProt::WRITE,
            ),
        ]
    };

    let map = kernel_map();
    for (start, end, prot) in segments {
        let mut cur = super::align_down(start as usize, PAGE_SIZE) as u64;
        while cur < end {
            let phys_addr = PhysAddr::new(cur - kernel_virt.as_u64() + kernel_phys.as_u64());
            map.map(
                phys_addr,
                VirtAddr::new(cur),
                prot,
                VmFlags::empty(),
                VmLevel::Small,
            )
            .expect("cannot remap kernel segment");
            cur += PAGE_SIZE as u64;
        }
    }
}

/// Alias `num_pages` of user memory starting at `src_virt` in `src` into
/// contiguous kernel virtual space. The kernel uses the alias to read and
/// write user buffers without switching maps.
pub fn map_foreign(
    src: &PageMap,
    src_virt: VirtAddr,
    num_pages: usize,
) -> KernelResult<VirtAddr> {
    let start = FOREIGN_WATERMARK.fetch_add((num_pages * PAGE_SIZE) as u64, Ordering::SeqCst);
    let kmap = kernel_map();
    for page in 0..num_pages {
        let user_page = VirtAddr::new(src_virt.as_u64() + (page * PAGE_SIZE) as u64);
        let phys_addr = match src.translate(user_page) {
            Some(addr) => addr,
            None => {
                // Roll back what was already aliased.
                unmap_foreign(VirtAddr::new(start), page);
                return Err(KernelError::UnmappedMemory {
                    addr: user_page.as_usize(),
                });
            }
        };
        kmap.map(
            PhysAddr::new(phys_addr.as_u64() & !(PAGE_SIZE as u64 - 1)),
            VirtAddr::new(start + (page * PAGE_SIZE) as u64),
            VmProt::READ | VmProt::WRITE,
            VmFlags::empty(),
            VmLevel::Small,
        )?;
    }
    Ok(VirtAddr::new(start))
}

/// Drop a foreign alias created by [`map_foreign`].
pub fn unmap_foreign(kernel_virt: VirtAddr, num_pages: usize) {
    let kmap = kernel_map();
    for page in 0..num_pages {
        let _ = kmap.unmap(VirtAddr::new(
            kernel_virt.as_u64() + (page * PAGE_SIZE) as u64,
        ));
    }
}

/// Direct-map pointer for a foreign alias page, resolved through the
/// kernel map. Works identically on bare metal and in hosted tests.
pub(crate) fn foreign_page_ptr(kernel_virt: VirtAddr) -> KernelResult<*mut u8> {
    kernel_map()
        .translate(kernel_virt)
        .map(|pa| pa.as_ptr())
        .ok_or(KernelError::UnmappedMemory {
            addr: kernel_virt.as_usize(),
        })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testing;

    const VA: u64 = 0x4000_0000; // 1 GiB, user half

    #[test]
    fn map_translate_unmap() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let frame = phys::alloc(1).expect("frame");

        map.map(
            frame,
            VirtAddr::new(VA),
            VmProt::READ | VmProt::WRITE,
            VmFlags::USER,
            VmLevel::Small,
        )
        .expect("map");
        assert_eq!(map.translate(VirtAddr::new(VA)), Some(frame));
        // Offsets within the page translate too.
        assert_eq!(
            map.translate(VirtAddr::new(VA + 0x123)),
            Some(PhysAddr::new(frame.as_u64() + 0x123))
        );

        map.unmap(VirtAddr::new(VA)).expect("unmap");
        assert_eq!(map.translate(VirtAddr::new(VA)), None);
        phys::free(frame, 1);
    }

    #[test]
    fn protect_preserves_translation() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let frame = phys::alloc(1).expect("frame");

        map.map(
            frame,
            VirtAddr::new(VA),
            VmProt::READ | VmProt::WRITE,
            VmFlags::USER,
            VmLevel::Small,
        )
        .expect("map");
        let before = map.translate(VirtAddr::new(VA));
        map.protect(VirtAddr::new(VA), VmProt::READ).expect("protect");
        assert_eq!(map.translate(VirtAddr::new(VA)), before);

        map.unmap(VirtAddr::new(VA)).expect("unmap");
        phys::free(frame, 1);
    }

    #[test]
    fn map_unmap_restores_leaf_table() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let frame = phys::alloc(1).expect("frame");

        map.map(
            frame,
            VirtAddr::new(VA),
            VmProt::READ,
            VmFlags::USER,
            VmLevel::Small,
        )
        .expect("map");
        let (table, index, _) = map.find_leaf(VirtAddr::new(VA)).expect("leaf");
        map.unmap(VirtAddr::new(VA)).expect("unmap");
        // The leaf slot is byte-identical to its pre-map state.
        assert_eq!(unsafe { read_entry(table, index) }, 0);
        phys::free(frame, 1);
    }

    #[test]
    fn medium_leaf_translates_with_offset() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let frames = phys::alloc(512).expect("2 MiB of frames");

        map.map(
            frames,
            VirtAddr::new(VA),
            VmProt::READ | VmProt::WRITE,
            VmFlags::USER,
            VmLevel::Medium,
        )
        .expect("map 2 MiB leaf");
        assert_eq!(
            map.translate(VirtAddr::new(VA + 0x1F_0123)),
            Some(PhysAddr::new(frames.as_u64() + 0x1F_0123))
        );
        map.unmap(VirtAddr::new(VA)).expect("unmap");
        phys::free(frames, 512);
    }

    #[test]
    fn fork_copies_user_bytes_and_isolates_writes() {
        let _env = testing::env();
        let parent = PageMap::new().expect("parent map");
        let frame = phys::alloc(1).expect("frame");
        parent
            .map(
                frame,
                VirtAddr::new(VA),
                VmProt::READ | VmProt::WRITE,
                VmFlags::USER,
                VmLevel::Small,
            )
            .expect("map");
        unsafe { frame.as_ptr().write_bytes(0x5A, PAGE_SIZE) };

        let child = parent.fork().expect("fork");
        let child_phys = child.translate(VirtAddr::new(VA)).expect("child mapping");
        assert_ne!(child_phys, frame, "child must own a distinct frame");
        let child_bytes =
            unsafe { core::slice::from_raw_parts(child_phys.as_ptr(), PAGE_SIZE) };
        assert!(child_bytes.iter().all(|&b| b == 0x5A));

        // Writes in the child are invisible to the parent.
        unsafe { child_phys.as_ptr().write_bytes(0xA5, PAGE_SIZE) };
        let parent_bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(parent_bytes.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn foreign_alias_reaches_user_frame() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let frame = phys::alloc(1).expect("frame");
        map.map(
            frame,
            VirtAddr::new(VA),
            VmProt::READ | VmProt::WRITE,
            VmFlags::USER,
            VmLevel::Small,
        )
        .expect("map");

        let alias = map_foreign(&map, VirtAddr::new(VA), 1).expect("foreign alias");
        let alias_phys = foreign_page_ptr(alias).expect("alias resolves");
        unsafe { alias_phys.write_bytes(0xEE, PAGE_SIZE) };
        let user_bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(user_bytes.iter().all(|&b| b == 0xEE));

        unmap_foreign(alias, 1);
        assert!(kernel_map().translate(alias).is_none());
        map.unmap(VirtAddr::new(VA)).expect("unmap");
        phys::free(frame, 1);
    }

    #[test]
    fn foreign_alias_of_unmapped_user_page_fails() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        assert!(map_foreign(&map, VirtAddr::new(0x7000_0000), 1).is_err());
    }
}
