//! ELF loader
//!
//! Loads ET_EXEC/ET_DYN images into a target page map. Mappings are
//! eager: every PT_LOAD gets its pages allocated and mapped up front,
//! then filled through a temporary foreign alias so the kernel never
//! executes under the target map. Relocation of relocatable modules
//! lives with the module loader; this file only knows how to read and
//! place images.

pub mod types;

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec};

use types::*;

use crate::error::ElfError;
use crate::fs::NodeOps;
use crate::mm::page_map::{PageMap, VmFlags, VmLevel, VmProt};
use crate::mm::usercopy::ForeignMapping;
use crate::mm::{align_down, align_up, phys, VirtAddr, PAGE_SIZE};

/// What the loader reports back about a placed image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    /// Absolute entry address (load base included).
    pub entry: u64,
    /// Absolute address of the program-header table in the image.
    pub phdr_vaddr: u64,
    pub phentsize: u16,
    pub phnum: u16,
    /// PT_INTERP path, if the image names one.
    pub interpreter: Option<String>,
}

/// Read exactly `buf.len()` bytes at `offset` or fail.
pub(crate) fn read_exact(
    ops: &dyn NodeOps,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), ElfError> {
    match ops.read(offset, buf) {
        Ok(read) if read == buf.len() => Ok(()),
        _ => Err(ElfError::TruncatedFile),
    }
}

/// Read one plain-old-data struct at `offset`.
pub(crate) fn read_pod<T: Copy>(ops: &dyn NodeOps, offset: u64) -> Result<T, ElfError> {
    // SAFETY: T is a repr(C) on-disk structure; any bit pattern is a
    // value, validation happens at the field level afterwards.
    let mut value = unsafe { core::mem::zeroed::<T>() };
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            &mut value as *mut T as *mut u8,
            core::mem::size_of::<T>(),
        )
    };
    read_exact(ops, offset, bytes)?;
    Ok(value)
}

/// Validate the identification fields against the host architecture.
pub(crate) fn check_ident(header: &ElfHeader, allowed_types: &[u16]) -> Result<(), ElfError> {
    if header.e_ident[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.e_ident[EI_CLASS] != ELFCLASS64
        || header.e_ident[EI_DATA] != ELFDATA2LSB
        || header.e_ident[EI_VERSION] != EV_CURRENT
        || header.e_ident[EI_OSABI] != ELFOSABI_SYSV
        || header.e_machine != EM_HOST
    {
        return Err(ElfError::WrongMachine);
    }
    if !allowed_types.contains(&header.e_type) {
        return Err(ElfError::WrongType);
    }
    Ok(())
}

/// Protection bits of a segment.
pub(crate) fn segment_prot(p_flags: u32) -> VmProt {
    let mut prot = VmProt::empty();
    if p_flags & PF_R != 0 {
        prot |= VmProt::READ;
    }
    if p_flags & PF_W != 0 {
        prot |= VmProt::WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= VmProt::EXEC;
    }
    prot
}

/// Load the image behind `ops` into `map` at `base`.
///
/// On failure the caller owns the cleanup: pages already mapped stay in
/// the map, so a fresh map should be destroyed rather than reused. The
/// identification checks run before anything is mapped, so a mismatched
/// image leaves the map untouched.
pub fn load(map: &PageMap, ops: &dyn NodeOps, base: u64) -> Result<ElfInfo, ElfError> {
    let header: ElfHeader = read_pod(ops, 0)?;
    check_ident(&header, &[ET_EXEC, ET_DYN])?;
    if header.e_phentsize as usize != core::mem::size_of::<ProgramHeader>() {
        return Err(ElfError::WrongMachine);
    }

    let mut info = ElfInfo {
        entry: base + header.e_entry,
        phentsize: header.e_phentsize,
        phnum: header.e_phnum,
        ..Default::default()
    };

    for index in 0..header.e_phnum as u64 {
        let phdr: ProgramHeader = read_pod(
            ops,
            header.e_phoff + index * core::mem::size_of::<ProgramHeader>() as u64,
        )?;
        match phdr.p_type {
            PT_LOAD => load_segment(map, ops, base, &phdr)?,
            PT_PHDR => info.phdr_vaddr = base + phdr.p_vaddr,
            PT_INTERP => {
                let mut path = vec![0u8; phdr.p_filesz as usize];
                read_exact(ops, phdr.p_offset, &mut path)?;
                // Strip the trailing nul.
                while path.last() == Some(&0) {
                    path.pop();
                }
                info.interpreter =
                    Some(String::from_utf8(path).map_err(|_| ElfError::TruncatedFile)?);
            }
            _ => {}
        }
    }

    Ok(info)
}

/// Place one PT_LOAD: allocate, map user-accessible, fill through a
/// foreign alias, zero the tail.
fn load_segment(
    map: &PageMap,
    ops: &dyn NodeOps,
    base: u64,
    phdr: &ProgramHeader,
) -> Result<(), ElfError> {
    let prot = segment_prot(phdr.p_flags);
    if !prot.contains(VmProt::READ) {
        log::warn!("elf: segment at {:#x} lacks read permission", phdr.p_vaddr);
    }

    let vaddr = base + phdr.p_vaddr;
    let aligned = align_down(vaddr as usize, PAGE_SIZE) as u64;
    let slack = (vaddr - aligned) as usize;
    let pages = align_up(phdr.p_memsz as usize + slack, PAGE_SIZE) / PAGE_SIZE;
    if pages == 0 {
        return Ok(());
    }

    for page in 0..pages {
        let frame = phys::alloc_zeroed(1).map_err(|_| ElfError::MapFailed)?;
        map.map(
            frame,
            VirtAddr::new(aligned + (page * PAGE_SIZE) as u64),
            prot,
            VmFlags::USER,
            VmLevel::Small,
        )
        .map_err(|_| ElfError::MapFailed)?;
    }

    // Alias the fresh pages into the kernel and stream the file in.
    let alias = ForeignMapping::new(map, VirtAddr::new(aligned), pages * PAGE_SIZE)
        .map_err(|_| ElfError::MapFailed)?;

    let mut chunk = vec![0u8; 64 * 1024];
    let mut copied = 0usize;
    while copied < phdr.p_filesz as usize {
        let take = chunk.len().min(phdr.p_filesz as usize - copied);
        read_exact(ops, phdr.p_offset + copied as u64, &mut chunk[..take])?;
        alias
            .write(slack + copied, &chunk[..take])
            .map_err(|_| ElfError::MapFailed)?;
        copied += take;
    }
    // Zero out the remaining memsz (bss tail).
    let tail = phdr.p_memsz as usize - phdr.p_filesz as usize;
    if tail > 0 {
        alias
            .zero(slack + phdr.p_filesz as usize, tail)
            .map_err(|_| ElfError::MapFailed)?;
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_image {
    //! Hand-assembled ELF images for loader tests.

    extern crate std;

    use std::boxed::Box;
    use std::vec::Vec;

    use super::types::*;

    pub const EHSIZE: usize = core::mem::size_of::<ElfHeader>();
    pub const PHSIZE: usize = core::mem::size_of::<ProgramHeader>();

    pub fn bytes_of<T: Copy>(value: &T) -> Vec<u8> {
        // SAFETY: on-disk POD structs.
        unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
                .to_vec()
        }
    }

    pub fn header(e_type: u16, machine: u16, entry: u64, phnum: u16) -> ElfHeader {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[EI_CLASS] = ELFCLASS64;
        ident[EI_DATA] = ELFDATA2LSB;
        ident[EI_VERSION] = EV_CURRENT;
        ident[EI_OSABI] = ELFOSABI_SYSV;
        ElfHeader {
            e_ident: ident,
            e_type,
            e_machine: machine,
            e_version: 1,
            e_entry: entry,
            e_phoff: EHSIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: EHSIZE as u16,
            e_phentsize: PHSIZE as u16,
            e_phnum: phnum,
            e_shentsize: core::mem::size_of::<SectionHeader>() as u16,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    /// A one-segment ET_DYN image whose single PT_LOAD carries `payload`
    /// at vaddr 0x1000 with a bss tail of `tail` bytes.
    pub fn single_load_image(machine: u16, payload: &[u8], tail: u64) -> &'static [u8] {
        let data_off = (EHSIZE + PHSIZE) as u64;
        let phdr = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: data_off,
            p_vaddr: 0x1000,
            p_paddr: 0,
            p_filesz: payload.len() as u64,
            p_memsz: payload.len() as u64 + tail,
            p_align: 0x1000,
        };
        let mut image = bytes_of(&header(ET_DYN, machine, 0x1000, 1));
        image.extend_from_slice(&bytes_of(&phdr));
        image.extend_from_slice(payload);
        Box::leak(image.into_boxed_slice())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::handle::MemoryFile;
    use crate::mm::testing;

    #[test]
    fn loads_a_single_segment_image() {
        let _env = testing::env();
        let image = test_image::single_load_image(EM_HOST, b"obsidian-code", 32);
        let file = MemoryFile::new(image, 1);
        let map = PageMap::new().expect("page map");

        let info = load(&map, &file, 0).expect("load");
        assert_eq!(info.entry, 0x1000);
        assert_eq!(info.phnum, 1);
        assert!(info.interpreter.is_none());

        // The payload landed at the segment's address...
        let pa = map.translate(VirtAddr::new(0x1000)).expect("mapped");
        let bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr(), 13) };
        assert_eq!(bytes, b"obsidian-code");
        // ...and the bss tail reads back zero.
        let tail = unsafe { core::slice::from_raw_parts(pa.as_ptr().add(13), 32) };
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn base_offset_shifts_the_image() {
        let _env = testing::env();
        let image = test_image::single_load_image(EM_HOST, b"xyz", 0);
        let file = MemoryFile::new(image, 2);
        let map = PageMap::new().expect("page map");

        let info = load(&map, &file, 0x4000_0000).expect("load at base");
        assert_eq!(info.entry, 0x4000_1000);
        assert!(map.translate(VirtAddr::new(0x4000_1000)).is_some());
        assert!(map.translate(VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn wrong_machine_fails_before_mapping() {
        let _env = testing::env();
        let other_machine = if EM_HOST == EM_X86_64 { EM_RISCV } else { EM_X86_64 };
        let image = test_image::single_load_image(other_machine, b"nope", 0);
        let file = MemoryFile::new(image, 3);
        let map = PageMap::new().expect("page map");

        assert_eq!(load(&map, &file, 0), Err(ElfError::WrongMachine));
        // Nothing was installed.
        assert!(map.translate(VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn relocatable_required_for_modules_is_rejected_here_when_et_none() {
        let _env = testing::env();
        let mut raw = test_image::bytes_of(&test_image::header(0, EM_HOST, 0, 0));
        raw.extend_from_slice(&[0u8; 64]);
        let image: &'static [u8] = alloc::boxed::Box::leak(raw.into_boxed_slice());
        let file = MemoryFile::new(image, 4);
        let map = PageMap::new().expect("page map");
        assert_eq!(load(&map, &file, 0), Err(ElfError::WrongType));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let _env = testing::env();
        let file = MemoryFile::new(b"\x7fELF", 5);
        let map = PageMap::new().expect("page map");
        assert_eq!(load(&map, &file, 0), Err(ElfError::TruncatedFile));
    }
}
