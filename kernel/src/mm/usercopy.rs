//! Page-fault-safe access to user memory
//!
//! Kernel code never dereferences a user pointer. The target pages are
//! aliased into kernel space via the foreign-mapping region first; an
//! unmapped user page surfaces as `EFAULT` at alias time instead of as a
//! page fault mid-copy. On x86 with SMAP, accesses are additionally
//! bracketed by stac/clac.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec, vec::Vec};

use super::page_map::{self, PageMap};
use super::{VirtAddr, PAGE_SIZE};
use crate::error::Errno;

/// RAII alias of a user range in kernel virtual space.
///
/// Access goes page-by-page through the kernel map, so it behaves the same
/// on bare metal and in hosted tests. Dropping the guard removes the alias.
pub struct ForeignMapping {
    base: VirtAddr,
    pages: usize,
    /// Byte offset of the user address within the first aliased page.
    head: usize,
    len: usize,
}

impl ForeignMapping {
    /// Alias `len` bytes of `map` starting at `user_addr`.
    pub fn new(map: &PageMap, user_addr: VirtAddr, len: usize) -> Result<Self, Errno> {
        if !user_addr.is_user() || len == 0 {
            return Err(Errno::EFAULT);
        }
        let start = user_addr.align_down(PAGE_SIZE as u64);
        let head = (user_addr.as_u64() - start.as_u64()) as usize;
        let pages = super::page_count(head + len);
        let base = page_map::map_foreign(map, start, pages).map_err(|_| Errno::EFAULT)?;
        Ok(Self {
            base,
            pages,
            head,
            len,
        })
    }

    /// Copy `dst.len()` bytes out of the aliased range at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), Errno> {
        self.access(offset, dst.len(), |page, page_off, chunk_off, chunk| {
            // SAFETY: `page` resolves to a live frame for the whole chunk.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    page.add(page_off),
                    dst.as_mut_ptr().add(chunk_off),
                    chunk,
                );
            }
        })
    }

    /// Copy `src` into the aliased range at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), Errno> {
        self.access(offset, src.len(), |page, page_off, chunk_off, chunk| {
            // SAFETY: as in `read`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(chunk_off),
                    page.add(page_off),
                    chunk,
                );
            }
        })
    }

    /// Zero `len` bytes of the aliased range at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<(), Errno> {
        self.access(offset, len, |page, page_off, _chunk_off, chunk| {
            // SAFETY: as in `read`.
            unsafe { page.add(page_off).write_bytes(0, chunk) }
        })
    }

    /// Walk the alias page by page, handing each chunk to `f`.
    fn access(
        &self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(*mut u8, usize, usize, usize),
    ) -> Result<(), Errno> {
        let start = self.head + offset;
        if start + len > self.head + self.len {
            return Err(Errno::EFAULT);
        }
        crate::arch::user_access_begin();
        let mut done = 0;
        while done < len {
            let pos = start + done;
            let page_index = pos / PAGE_SIZE;
            let page_off = pos % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_off).min(len - done);
            let page_va = VirtAddr::new(self.base.as_u64() + (page_index * PAGE_SIZE) as u64);
            let page = match page_map::foreign_page_ptr(page_va) {
                Ok(ptr) => ptr,
                Err(_) => {
                    crate::arch::user_access_end();
                    return Err(Errno::EFAULT);
                }
            };
            f(page, page_off, done, chunk);
            done += chunk;
        }
        crate::arch::user_access_end();
        Ok(())
    }
}

impl Drop for ForeignMapping {
    fn drop(&mut self) {
        page_map::unmap_foreign(self.base, self.pages);
    }
}

/// Copy `dst.len()` bytes from user memory.
pub fn copy_from_user(map: &PageMap, src: VirtAddr, dst: &mut [u8]) -> Result<(), Errno> {
    if dst.is_empty() {
        return Ok(());
    }
    ForeignMapping::new(map, src, dst.len())?.read(0, dst)
}

/// Copy `src` into user memory.
pub fn copy_to_user(map: &PageMap, dst: VirtAddr, src: &[u8]) -> Result<(), Errno> {
    if src.is_empty() {
        return Ok(());
    }
    ForeignMapping::new(map, dst, src.len())?.write(0, src)
}

/// Read a nul-terminated string from user memory, up to `max` bytes.
#[cfg(feature = "alloc")]
pub fn string_from_user(map: &PageMap, src: VirtAddr, max: usize) -> Result<String, Errno> {
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = src;
    let mut remaining = max;
    while remaining > 0 {
        // Probe one page at a time so a terminator near the start does not
        // require the whole range to be mapped.
        let page_left =
            PAGE_SIZE - (cursor.as_u64() as usize % PAGE_SIZE);
        let chunk_len = page_left.min(remaining);
        let mut chunk = vec![0u8; chunk_len];
        copy_from_user(map, cursor, &mut chunk)?;
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            collected.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(collected).map_err(|_| Errno::EINVAL);
        }
        collected.extend_from_slice(&chunk);
        cursor = VirtAddr::new(cursor.as_u64() + chunk_len as u64);
        remaining -= chunk_len;
    }
    Err(Errno::ERANGE)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::page_map::{PageMap, VmFlags, VmLevel, VmProt};
    use crate::mm::{phys, testing};

    fn user_map_with_page(va: u64) -> PageMap {
        let map = PageMap::new().expect("page map");
        let frame = phys::alloc(1).expect("frame");
        map.map(
            frame,
            VirtAddr::new(va),
            VmProt::READ | VmProt::WRITE,
            VmFlags::USER,
            VmLevel::Small,
        )
        .expect("map");
        map
    }

    #[test]
    fn copy_roundtrip_through_alias() {
        let _env = testing::env();
        let map = user_map_with_page(0x1000_0000);

        copy_to_user(&map, VirtAddr::new(0x1000_0040), b"obsidian").expect("copy in");
        let mut back = [0u8; 8];
        copy_from_user(&map, VirtAddr::new(0x1000_0040), &mut back).expect("copy out");
        assert_eq!(&back, b"obsidian");
    }

    #[test]
    fn crossing_page_boundary_copies_both_pages() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        for page in 0..2u64 {
            let frame = phys::alloc(1).expect("frame");
            map.map(
                frame,
                VirtAddr::new(0x2000_0000 + page * PAGE_SIZE as u64),
                VmProt::READ | VmProt::WRITE,
                VmFlags::USER,
                VmLevel::Small,
            )
            .expect("map");
        }
        let data = [0x42u8; 64];
        copy_to_user(&map, VirtAddr::new(0x2000_0FE0), &data).expect("straddling copy");
        let mut back = [0u8; 64];
        copy_from_user(&map, VirtAddr::new(0x2000_0FE0), &mut back).expect("read back");
        assert_eq!(back, data);
    }

    #[test]
    fn unmapped_user_address_faults() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&map, VirtAddr::new(0x3000_0000), &mut buf),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn kernel_address_is_rejected() {
        let _env = testing::env();
        let map = PageMap::new().expect("page map");
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&map, VirtAddr::new(0xFFFF_8000_0000_0000), &mut buf),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn string_from_user_stops_at_nul() {
        let _env = testing::env();
        let map = user_map_with_page(0x1100_0000);
        copy_to_user(&map, VirtAddr::new(0x1100_0000), b"hello\0junk").expect("copy in");
        let s = string_from_user(&map, VirtAddr::new(0x1100_0000), 256).expect("string");
        assert_eq!(s, "hello");
    }
}
