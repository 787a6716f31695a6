//! Module loader
//!
//! Loadable kernel modules are relocatable ET_DYN objects carrying a
//! `.mod` descriptor (init/exit hooks, identity, dependency names).
//! Loading maps the segments into the kernel's module region, applies
//! .rela.dyn/.rela.plt against the kernel symbol table, re-protects the
//! segments, publishes the module's global symbols and runs the init
//! hooks — dependencies strictly first. The kernel's own symbols come
//! from its ELF image at boot and also feed the panic backtrace.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec,
    vec::Vec,
};

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::boot::{cmdline, BootInfo};
use crate::elf::types::*;
use crate::elf::{check_ident, read_exact, read_pod, segment_prot};
use crate::error::{ElfError, KernelResult, ModuleError};
use crate::fs::NodeOps;
use crate::mm::page_map::{kernel_map, VmFlags, VmLevel, VmProt};
use crate::mm::{align_up, phys, PhysAddr, VirtAddr, MODULE_BASE, PAGE_SIZE};

/// Fixed-field part of the `.mod` descriptor section. The dependency
/// name array (`num_deps` entries of 64 bytes) follows it in memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModDescriptor {
    pub init: u64,
    pub exit: u64,
    pub name: [u8; 64],
    pub author: [u8; 64],
    pub description: [u8; 168],
    pub num_deps: u64,
}

/// The init hook of a module.
#[derive(Clone, Copy)]
pub enum InitHook {
    /// Compiled into the kernel (registered at boot).
    Builtin(fn() -> i32),
    /// Entry address inside a mapped module image.
    Image(u64),
}

/// Exit hook, same shapes.
#[derive(Clone, Copy)]
pub enum ExitHook {
    Builtin(fn()),
    Image(u64),
}

/// Everything the kernel tracks about one module.
pub struct LoadedModule {
    pub name: String,
    pub description: String,
    pub init: Option<InitHook>,
    pub exit: Option<ExitHook>,
    pub deps: Vec<String>,
    /// Path of the backing file for not-yet-loaded dynamic modules.
    pub file_path: Option<String>,
    /// Mapped regions (address, pages) for unload.
    pub maps: Vec<(VirtAddr, usize)>,
    pub loaded: bool,
}

impl LoadedModule {
    fn builtin(name: &str, init: fn() -> i32, exit: Option<fn()>, deps: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            init: Some(InitHook::Builtin(init)),
            exit: exit.map(ExitHook::Builtin),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            file_path: None,
            maps: Vec::new(),
            loaded: false,
        }
    }

    fn pending_file(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            init: None,
            exit: None,
            deps: Vec::new(),
            file_path: Some(path.to_string()),
            maps: Vec::new(),
            loaded: false,
        }
    }
}

/// Exported symbol: absolute address and size.
#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub value: u64,
    pub size: u64,
}

static MODULES: Mutex<BTreeMap<String, LoadedModule>> = Mutex::new(BTreeMap::new());
static SYMBOLS: Mutex<BTreeMap<String, SymbolInfo>> = Mutex::new(BTreeMap::new());
static POST_INIT: Mutex<Vec<fn()>> = Mutex::new(Vec::new());

/// Watermark for module mappings in the kernel half.
static MODULE_REGION: AtomicU64 = AtomicU64::new(MODULE_BASE);

/// Register a module under `name`. Already-registered names are kept and
/// the newcomer ignored.
pub fn register(name: &str, module: LoadedModule) {
    let mut modules = MODULES.lock();
    if modules.contains_key(name) {
        log::warn!("module: ignoring already registered \"{}\"", name);
        return;
    }
    log::info!("module: registered \"{}\"", name);
    modules.insert(name.to_string(), module);
}

/// Register a built-in (compiled-in) module.
pub fn register_builtin(name: &str, init: fn() -> i32, exit: Option<fn()>, deps: &[&str]) {
    // Cmdline toggle: `name=0` keeps the module out of the registry.
    if cmdline::get_usize(name, 1) == 0 {
        log::info!("module: \"{}\" disabled on the command line", name);
        return;
    }
    register(name, LoadedModule::builtin(name, init, exit, deps));
}

/// Run a previously registered module, dependencies first.
pub fn load(name: &str) -> Result<(), ModuleError> {
    let (deps, init, already) = {
        let modules = MODULES.lock();
        let module = modules.get(name).ok_or(ModuleError::NotRegistered)?;
        (module.deps.clone(), module.init, module.loaded)
    };
    if already {
        return Ok(());
    }

    for dep in &deps {
        if let Err(err) = load(dep) {
            log::error!(
                "module: \"{}\" failed: dependency \"{}\" did not load: {:?}",
                name,
                dep,
                err
            );
            return Err(ModuleError::DependencyFailed);
        }
    }

    let Some(init) = init else {
        log::error!("module: \"{}\" has no init hook", name);
        return Err(ModuleError::NotRegistered);
    };
    let status = match init {
        InitHook::Builtin(func) => func(),
        InitHook::Image(addr) => call_image_init(addr),
    };
    if status != 0 {
        log::error!("module: \"{}\" init returned {}", name, status);
        return Err(ModuleError::InitFailed(status));
    }
    MODULES.lock().get_mut(name).expect("registered above").loaded = true;
    log::info!("module: \"{}\" initialized", name);
    Ok(())
}

#[cfg(target_os = "none")]
fn call_image_init(addr: u64) -> i32 {
    // SAFETY: the address was relocated into the module region and its
    // segment re-protected executable before we got here.
    let func: extern "C" fn() -> i32 = unsafe { core::mem::transmute(addr as usize) };
    func()
}

#[cfg(not(target_os = "none"))]
fn call_image_init(_addr: u64) -> i32 {
    // Hosted tests never execute image code.
    0
}

/// Run a callback after every module has initialized.
pub fn register_post_init(callback: fn()) {
    POST_INIT.lock().push(callback);
}

/// Publish a symbol. First writer wins.
pub fn register_symbol(name: &str, symbol: SymbolInfo) {
    let mut symbols = SYMBOLS.lock();
    symbols.entry(name.to_string()).or_insert(symbol);
}

/// Look up an exported symbol.
pub fn get_symbol(name: &str) -> Option<SymbolInfo> {
    SYMBOLS.lock().get(name).copied()
}

/// Resolve an address to the symbol covering it (panic backtraces).
pub fn find_symbol(addr: u64) -> Option<(String, SymbolInfo)> {
    let symbols = SYMBOLS.lock();
    for (name, symbol) in symbols.iter() {
        if addr >= symbol.value && addr < symbol.value + symbol.size {
            return Some((name.clone(), *symbol));
        }
    }
    None
}

/// Load the kernel's own global symbols from its ELF image.
pub fn load_kernel_symbols(image: &dyn NodeOps) -> Result<usize, ElfError> {
    let header: ElfHeader = read_pod(image, 0)?;
    check_ident(&header, &[ET_EXEC, ET_DYN])?;

    // Find .symtab and its string table.
    let mut symtab: Option<SectionHeader> = None;
    let mut strtab: Option<SectionHeader> = None;
    const SHT_SYMTAB: u32 = 2;
    for index in 0..header.e_shnum as u64 {
        let shdr: SectionHeader = read_pod(
            image,
            header.e_shoff + index * core::mem::size_of::<SectionHeader>() as u64,
        )?;
        if shdr.sh_type == SHT_SYMTAB {
            let linked: SectionHeader = read_pod(
                image,
                header.e_shoff + shdr.sh_link as u64 * core::mem::size_of::<SectionHeader>() as u64,
            )?;
            symtab = Some(shdr);
            strtab = Some(linked);
            break;
        }
    }
    let (symtab, strtab) = match (symtab, strtab) {
        (Some(s), Some(t)) => (s, t),
        _ => return Err(ElfError::BadDynamic),
    };

    let mut names = vec![0u8; strtab.sh_size as usize];
    read_exact(image, strtab.sh_offset, &mut names)?;

    let count = (symtab.sh_size / symtab.sh_entsize.max(1)) as usize;
    let mut published = 0;
    for index in 0..count {
        let symbol: Symbol = read_pod(
            image,
            symtab.sh_offset + (index as u64) * symtab.sh_entsize,
        )?;
        if symbol.binding() != STB_GLOBAL || symbol.st_size == 0 {
            continue;
        }
        if let Some(name) = cstr_at(&names, symbol.st_name as usize) {
            register_symbol(
                name,
                SymbolInfo {
                    value: symbol.st_value,
                    size: symbol.st_size,
                },
            );
            published += 1;
        }
    }
    log::info!("module: {} kernel symbols loaded", published);
    Ok(published)
}

fn cstr_at(table: &[u8], offset: usize) -> Option<&str> {
    let tail = table.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&tail[..end]).ok()
}

fn fixed_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Write a u64 into the module region through the kernel map.
fn poke_module_word(addr: VirtAddr, value: u64) -> Result<(), ElfError> {
    let pa = kernel_map().translate(addr).ok_or(ElfError::MapFailed)?;
    // SAFETY: the address was just resolved to a live module-region frame.
    unsafe { (pa.as_ptr() as *mut u64).write_unaligned(value) };
    Ok(())
}

/// Read raw bytes out of the module region through the kernel map.
fn peek_module_bytes(addr: VirtAddr, buf: &mut [u8]) -> Result<(), ElfError> {
    let mut done = 0;
    while done < buf.len() {
        let cursor = VirtAddr::new(addr.as_u64() + done as u64);
        let page_off = cursor.as_usize() % PAGE_SIZE;
        let take = (PAGE_SIZE - page_off).min(buf.len() - done);
        let pa = kernel_map().translate(cursor).ok_or(ElfError::MapFailed)?;
        // SAFETY: resolved module-region frame.
        unsafe {
            core::ptr::copy_nonoverlapping(pa.as_ptr(), buf[done..].as_mut_ptr(), take);
        }
        done += take;
    }
    Ok(())
}

/// Write raw bytes into the module region through the kernel map.
fn poke_module_bytes(addr: VirtAddr, buf: &[u8]) -> Result<(), ElfError> {
    let mut done = 0;
    while done < buf.len() {
        let cursor = VirtAddr::new(addr.as_u64() + done as u64);
        let page_off = cursor.as_usize() % PAGE_SIZE;
        let take = (PAGE_SIZE - page_off).min(buf.len() - done);
        let pa = kernel_map().translate(cursor).ok_or(ElfError::MapFailed)?;
        // SAFETY: resolved module-region frame.
        unsafe {
            core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), pa.as_ptr(), take);
        }
        done += take;
    }
    Ok(())
}

struct DynamicInfo {
    strtab: u64,
    strsz: u64,
    symtab: u64,
    rela: u64,
    relasz: u64,
    relaent: u64,
    pltrelsz: u64,
    jmprel: u64,
    init_array: u64,
    init_arraysz: u64,
}

/// Load a relocatable module ELF from the VFS.
pub fn load_elf(path: &str) -> Result<(), ModuleError> {
    let node = crate::fs::lookup(&crate::fs::root(), path)
        .map_err(|_| ModuleError::NotRegistered)?;
    let node_name = node.name.clone();
    let ops = node.ops.clone().ok_or(ModuleError::Elf(ElfError::TruncatedFile))?;

    {
        let modules = MODULES.lock();
        let Some(module) = modules.get(&node_name) else {
            log::error!("module: \"{}\" was not registered", path);
            return Err(ModuleError::NotRegistered);
        };
        if module.init.is_some() {
            // Already materialized (built-in or loaded earlier).
            return Ok(());
        }
    }

    match load_elf_image(ops.as_ref()) {
        Ok(loaded) => {
            let mut modules = MODULES.lock();
            let module = modules.get_mut(&node_name).expect("checked above");
            module.description = loaded.description;
            module.init = loaded.init;
            module.exit = loaded.exit;
            module.deps = loaded.deps;
            module.maps = loaded.maps;
            Ok(())
        }
        Err(err) => {
            log::error!("module: failed to load \"{}\": {:?}", path, err);
            Err(err)
        }
    }
}

struct LoadedImage {
    description: String,
    init: Option<InitHook>,
    exit: Option<ExitHook>,
    deps: Vec<String>,
    maps: Vec<(VirtAddr, usize)>,
}

fn load_elf_image(ops: &dyn NodeOps) -> Result<LoadedImage, ModuleError> {
    let header: ElfHeader = read_pod(ops, 0)?;
    check_ident(&header, &[ET_DYN])?;

    // Program and section headers.
    let mut phdrs: Vec<ProgramHeader> = Vec::with_capacity(header.e_phnum as usize);
    for index in 0..header.e_phnum as u64 {
        phdrs.push(read_pod(
            ops,
            header.e_phoff + index * core::mem::size_of::<ProgramHeader>() as u64,
        )?);
    }
    let mut shdrs: Vec<SectionHeader> = Vec::with_capacity(header.e_shnum as usize);
    for index in 0..header.e_shnum as u64 {
        shdrs.push(read_pod(
            ops,
            header.e_shoff + index * core::mem::size_of::<SectionHeader>() as u64,
        )?);
    }

    let mut maps: Vec<(VirtAddr, usize)> = Vec::new();
    let mut dynamic: Option<DynamicInfo> = None;
    let mut base_virt: u64 = 0;

    let result = (|| -> Result<LoadedImage, ModuleError> {
        // Map every PT_LOAD read-write into the module region.
        for phdr in &phdrs {
            match phdr.p_type {
                PT_LOAD => {
                    if base_virt == 0 {
                        // First mapping decides the load base.
                        base_virt = MODULE_REGION.load(Ordering::SeqCst);
                    }
                    let vaddr = base_virt + phdr.p_vaddr;
                    let aligned = crate::mm::align_down(vaddr as usize, PAGE_SIZE) as u64;
                    let slack = (vaddr - aligned) as usize;
                    let pages = align_up(phdr.p_memsz as usize + slack, PAGE_SIZE) / PAGE_SIZE;
                    if pages == 0 {
                        continue;
                    }

                    for page in 0..pages {
                        let frame =
                            phys::alloc_zeroed(1).map_err(|_| ModuleError::Elf(ElfError::MapFailed))?;
                        kernel_map()
                            .map(
                                frame,
                                VirtAddr::new(aligned + (page * PAGE_SIZE) as u64),
                                VmProt::READ | VmProt::WRITE,
                                VmFlags::empty(),
                                VmLevel::Small,
                            )
                            .map_err(|_| ModuleError::Elf(ElfError::MapFailed))?;
                    }
                    MODULE_REGION
                        .store(aligned + (pages * PAGE_SIZE) as u64, Ordering::SeqCst);
                    maps.push((VirtAddr::new(aligned), pages));

                    // Stream the file contents in, zero tail included (the
                    // frames start zeroed).
                    let mut chunk = vec![0u8; 64 * 1024];
                    let mut copied = 0usize;
                    while copied < phdr.p_filesz as usize {
                        let take = chunk.len().min(phdr.p_filesz as usize - copied);
                        read_exact(ops, phdr.p_offset + copied as u64, &mut chunk[..take])?;
                        poke_module_bytes(
                            VirtAddr::new(vaddr + copied as u64),
                            &chunk[..take],
                        )?;
                        copied += take;
                    }
                }
                PT_DYNAMIC => {
                    let mut info = DynamicInfo {
                        strtab: 0,
                        strsz: 0,
                        symtab: 0,
                        rela: 0,
                        relasz: 0,
                        relaent: 0,
                        pltrelsz: 0,
                        jmprel: 0,
                        init_array: 0,
                        init_arraysz: 0,
                    };
                    let count = phdr.p_filesz as usize / core::mem::size_of::<Dyn>();
                    for index in 0..count {
                        let entry: Dyn = read_pod(
                            ops,
                            phdr.p_offset + (index * core::mem::size_of::<Dyn>()) as u64,
                        )?;
                        match entry.d_tag {
                            DT_STRTAB => info.strtab = entry.d_val,
                            DT_STRSZ => info.strsz = entry.d_val,
                            DT_SYMTAB => info.symtab = entry.d_val,
                            DT_RELA => info.rela = entry.d_val,
                            DT_RELASZ => info.relasz = entry.d_val,
                            DT_RELAENT => info.relaent = entry.d_val,
                            DT_PLTRELSZ => info.pltrelsz = entry.d_val,
                            DT_JMPREL => info.jmprel = entry.d_val,
                            DT_INIT_ARRAY => info.init_array = entry.d_val,
                            DT_INIT_ARRAYSZ => info.init_arraysz = entry.d_val,
                            _ => {}
                        }
                    }
                    if info.strtab == 0 || info.symtab == 0 || info.strsz == 0 {
                        return Err(ModuleError::Elf(ElfError::BadDynamic));
                    }
                    dynamic = Some(info);
                }
                _ => {}
            }
        }

        let dynamic = dynamic.ok_or(ModuleError::Elf(ElfError::BadDynamic))?;

        // Locate the `.mod` descriptor via the section string table.
        let shstr = shdrs
            .get(header.e_shstrndx as usize)
            .ok_or(ModuleError::NoDescriptor)?;
        let mut shstrtab = vec![0u8; shstr.sh_size as usize];
        read_exact(ops, shstr.sh_offset, &mut shstrtab)?;

        let mod_section = shdrs
            .iter()
            .find(|s| cstr_at(&shstrtab, s.sh_name as usize) == Some(".mod"))
            .ok_or(ModuleError::NoDescriptor)?;

        let descriptor_addr = VirtAddr::new(base_virt + mod_section.sh_addr);
        let mut descriptor_raw = [0u8; core::mem::size_of::<ModDescriptor>()];
        peek_module_bytes(descriptor_addr, &mut descriptor_raw)?;
        // SAFETY: repr(C) POD view of bytes we just read.
        let descriptor: ModDescriptor =
            unsafe { core::ptr::read_unaligned(descriptor_raw.as_ptr() as *const _) };

        // Dependency names follow the fixed fields.
        let mut deps: Vec<String> = Vec::with_capacity(descriptor.num_deps as usize);
        for index in 0..descriptor.num_deps {
            let mut name_raw = [0u8; 64];
            peek_module_bytes(
                VirtAddr::new(
                    descriptor_addr.as_u64()
                        + core::mem::size_of::<ModDescriptor>() as u64
                        + index * 64,
                ),
                &mut name_raw,
            )?;
            deps.push(fixed_str(&name_raw).to_string());
        }

        // Dependencies must exist (and dynamic ones must be materialized)
        // before relocation can resolve their exports.
        for dep in &deps {
            let dep_path = {
                let modules = MODULES.lock();
                let Some(dep_module) = modules.get(dep.as_str()) else {
                    log::error!("module: unknown dependency \"{}\"", dep);
                    return Err(ModuleError::DependencyFailed);
                };
                if dep_module.init.is_some() {
                    None
                } else {
                    dep_module.file_path.clone()
                }
            };
            if let Some(dep_path) = dep_path {
                load_elf(&dep_path)?;
            }
        }

        // Symbol and string tables for relocation.
        let mut strtab_data = vec![0u8; dynamic.strsz as usize];
        read_exact(ops, dynamic.strtab, &mut strtab_data)?;
        let sym_bytes = (dynamic.strtab - dynamic.symtab) as usize;
        let sym_count = sym_bytes / core::mem::size_of::<Symbol>();
        let mut symtab_data: Vec<Symbol> = Vec::with_capacity(sym_count);
        for index in 0..sym_count {
            symtab_data.push(read_pod(
                ops,
                dynamic.symtab + (index * core::mem::size_of::<Symbol>()) as u64,
            )?);
        }

        // Apply .rela.dyn, then .rela.plt.
        let relaent = if dynamic.relaent != 0 {
            dynamic.relaent
        } else {
            core::mem::size_of::<Rela>() as u64
        };
        for (table, size) in [(dynamic.rela, dynamic.relasz), (dynamic.jmprel, dynamic.pltrelsz)]
        {
            if table == 0 || size == 0 {
                continue;
            }
            let count = size / relaent;
            for index in 0..count {
                let rela: Rela = read_pod(ops, table + index * relaent)?;
                apply_relocation(&rela, &symtab_data, &strtab_data, base_virt)?;
            }
        }

        // Re-protect the segments to their real permissions.
        for phdr in &phdrs {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let prot = segment_prot(phdr.p_flags);
            let vaddr = base_virt + phdr.p_vaddr;
            let aligned = crate::mm::align_down(vaddr as usize, PAGE_SIZE) as u64;
            let pages = align_up(phdr.p_memsz as usize + (vaddr - aligned) as usize, PAGE_SIZE)
                / PAGE_SIZE;
            for page in 0..pages {
                kernel_map()
                    .protect(VirtAddr::new(aligned + (page * PAGE_SIZE) as u64), prot)
                    .map_err(|_| ModuleError::Elf(ElfError::MapFailed))?;
            }
        }

        // Publish the module's own global symbols.
        for symbol in &symtab_data {
            if symbol.binding() != STB_GLOBAL || symbol.st_size == 0 {
                continue;
            }
            if let Some(name) = cstr_at(&strtab_data, symbol.st_name as usize) {
                register_symbol(
                    name,
                    SymbolInfo {
                        value: base_virt + symbol.st_value,
                        size: symbol.st_size,
                    },
                );
            }
        }

        // Constructors before the init hook proper.
        #[cfg(target_os = "none")]
        if dynamic.init_array != 0 {
            let count = dynamic.init_arraysz / 8;
            for index in 0..count {
                let mut raw = [0u8; 8];
                peek_module_bytes(
                    VirtAddr::new(base_virt + dynamic.init_array + index * 8),
                    &mut raw,
                )?;
                let addr = u64::from_ne_bytes(raw);
                if addr != 0 {
                    // SAFETY: constructor inside the just-relocated image.
                    let ctor: extern "C" fn() = unsafe { core::mem::transmute(addr as usize) };
                    ctor();
                }
            }
        }

        Ok(LoadedImage {
            description: fixed_str(&descriptor.description).to_string(),
            init: if descriptor.init != 0 {
                Some(InitHook::Image(base_virt + descriptor.init))
            } else {
                None
            },
            exit: if descriptor.exit != 0 {
                Some(ExitHook::Image(base_virt + descriptor.exit))
            } else {
                None
            },
            deps,
            maps: core::mem::take(&mut maps),
        })
    })();

    if result.is_err() {
        // Unmap and free everything mapped so far; no partial symbols
        // were published (publication happens after relocation succeeds).
        unmap_regions(&maps);
    }
    result
}

fn apply_relocation(
    rela: &Rela,
    symtab: &[Symbol],
    strtab: &[u8],
    base_virt: u64,
) -> Result<(), ModuleError> {
    let location = VirtAddr::new(base_virt + rela.r_offset);
    let reloc_type = rela.reloc_type();

    if reloc_type == reloc::R_RELATIVE {
        poke_module_word(location, (base_virt as i64 + rela.r_addend) as u64)?;
        return Ok(());
    }

    if reloc_type == reloc::R_ABS64
        || reloc_type == reloc::R_GLOB_DAT
        || reloc_type == reloc::R_JUMP_SLOT
    {
        let symbol = symtab
            .get(rela.symbol_index())
            .ok_or(ModuleError::Elf(ElfError::BadRelocation))?;
        let resolved = if symbol.st_shndx == 0 {
            // External: the kernel (or an earlier module) must export it.
            let name = cstr_at(strtab, symbol.st_name as usize)
                .ok_or(ModuleError::Elf(ElfError::BadRelocation))?;
            match get_symbol(name) {
                Some(info) => info.value,
                None => {
                    log::error!("module: unresolved symbol \"{}\"", name);
                    return Err(ModuleError::Elf(ElfError::UnresolvedSymbol));
                }
            }
        } else {
            base_virt + symbol.st_value
        };
        poke_module_word(location, (resolved as i64 + rela.r_addend) as u64)?;
        return Ok(());
    }

    log::error!("module: unhandled relocation type {}", reloc_type);
    Err(ModuleError::Elf(ElfError::BadRelocation))
}

fn unmap_regions(maps: &[(VirtAddr, usize)]) {
    for &(base, pages) in maps {
        for page in 0..pages {
            let va = VirtAddr::new(base.as_u64() + (page * PAGE_SIZE) as u64);
            if let Some(pa) = kernel_map().translate(va) {
                let _ = kernel_map().unmap(va);
                phys::free(PhysAddr::new(pa.as_u64() & !(PAGE_SIZE as u64 - 1)), 1);
            }
        }
    }
}

/// Unload a module: exit hook, symbol removal is left to reboot (modules
/// are not unloaded while anything may call them), memory returned.
pub fn unload(name: &str) -> KernelResult<()> {
    let mut modules = MODULES.lock();
    let module = modules
        .get_mut(name)
        .ok_or(crate::error::KernelError::ModuleError(
            ModuleError::NotRegistered,
        ))?;
    if let Some(exit) = module.exit {
        match exit {
            ExitHook::Builtin(func) => func(),
            #[cfg(target_os = "none")]
            ExitHook::Image(addr) => {
                // SAFETY: the image is still mapped and relocated.
                let func: extern "C" fn() = unsafe { core::mem::transmute(addr as usize) };
                func();
            }
            #[cfg(not(target_os = "none"))]
            ExitHook::Image(_) => {}
        }
    }
    let maps = core::mem::take(&mut module.maps);
    module.loaded = false;
    module.init = None;
    module.exit = None;
    drop(modules);
    unmap_regions(&maps);
    Ok(())
}

/// Boot-time module bring-up: kernel symbols, built-ins, dynamic modules
/// from the modules directory, then init in dependency order.
pub fn init(boot: &BootInfo) -> KernelResult<()> {
    // Kernel symbol table from our own image, if the bootloader provided
    // it (needed for module relocation and panic backtraces).
    if let Some(kernel_file) = boot.files.iter().find(|f| f.path == "/kernel") {
        let image = crate::fs::handle::MemoryFile::new(kernel_file.data, 0);
        if let Err(err) = load_kernel_symbols(&image) {
            log::warn!("module: cannot load kernel symbols: {:?}", err);
        }
    } else {
        log::warn!("module: kernel image not among boot files, no symbols");
    }

    // Discover dynamic modules.
    let modules_dir = cmdline::get_str("modules", "/boot/modules");
    match crate::fs::lookup(&crate::fs::root(), &modules_dir) {
        Err(_) => {
            log::warn!("module: directory \"{}\" is missing", modules_dir);
        }
        Ok(dir) if !dir.is_dir() => {
            log::warn!("module: \"{}\" is not a directory", modules_dir);
        }
        Ok(dir) => {
            // Register them all first so dependency names resolve.
            let mut paths: Vec<String> = Vec::new();
            for node in dir.children() {
                if node.ops.is_none() {
                    continue;
                }
                if cmdline::get_usize(&node.name, 1) == 0 {
                    log::info!("module: \"{}\" disabled on the command line", node.name);
                    continue;
                }
                let path = crate::fs::path_of(&node);
                register(&node.name, LoadedModule::pending_file(&node.name, &path));
                paths.push(path);
            }
            // Then materialize the images.
            for path in paths {
                let _ = load_elf(&path);
            }
        }
    }

    // Initialize every registered module.
    let names: Vec<String> = MODULES.lock().keys().cloned().collect();
    for name in names {
        if let Err(err) = load(&name) {
            log::error!("module: \"{}\" failed to initialize: {:?}", name, err);
        }
    }

    // Post-init callbacks registered by the modules.
    let callbacks: Vec<fn()> = core::mem::take(&mut *POST_INIT.lock());
    for callback in callbacks {
        callback();
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    use super::*;

    static INIT_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static FAIL_A: AtomicUsize = AtomicUsize::new(0);

    fn init_a() -> i32 {
        if FAIL_A.load(StdOrdering::Relaxed) != 0 {
            return -1;
        }
        INIT_ORDER.lock().push("a");
        0
    }

    fn init_b() -> i32 {
        INIT_ORDER.lock().push("b");
        0
    }

    #[test]
    fn dependency_initializes_first() {
        let _env = crate::mm::testing::env();
        // B registered before A, but A's init must run first.
        register("dep-b", LoadedModule::builtin("dep-b", init_b, None, &["dep-a"]));
        register("dep-a", LoadedModule::builtin("dep-a", init_a, None, &[]));

        load("dep-b").expect("load with dependency");
        let order = INIT_ORDER.lock().clone();
        let pos_a = order.iter().position(|&m| m == "a").expect("a ran");
        let pos_b = order.iter().position(|&m| m == "b").expect("b ran");
        assert!(pos_a < pos_b);

        // Loading again is a no-op.
        load("dep-b").expect("idempotent");
        assert_eq!(INIT_ORDER.lock().len(), 2);
    }

    #[test]
    fn failing_dependency_blocks_dependent() {
        let _env = crate::mm::testing::env();
        FAIL_A.store(1, StdOrdering::Relaxed);
        register(
            "fail-child",
            LoadedModule::builtin("fail-child", init_b, None, &["fail-parent"]),
        );
        register(
            "fail-parent",
            LoadedModule::builtin("fail-parent", init_a, None, &[]),
        );

        assert!(matches!(
            load("fail-child"),
            Err(ModuleError::DependencyFailed)
        ));
        FAIL_A.store(0, StdOrdering::Relaxed);
    }

    #[test]
    fn unknown_module_is_rejected() {
        assert!(matches!(
            load("never-registered"),
            Err(ModuleError::NotRegistered)
        ));
    }

    #[test]
    fn symbols_resolve_by_name_and_address() {
        register_symbol(
            "obsidian_test_export",
            SymbolInfo {
                value: 0xFFFF_C000_0010_0000,
                size: 64,
            },
        );
        let info = get_symbol("obsidian_test_export").expect("registered");
        assert_eq!(info.size, 64);

        let (name, _) = find_symbol(0xFFFF_C000_0010_0020).expect("covering symbol");
        assert_eq!(name, "obsidian_test_export");
        assert!(find_symbol(0xFFFF_C000_0020_0000).is_none());
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        register("dup-mod", LoadedModule::builtin("dup-mod", init_a, None, &[]));
        register("dup-mod", LoadedModule::builtin("dup-mod", init_b, None, &["x"]));
        let modules = MODULES.lock();
        assert!(modules.get("dup-mod").unwrap().deps.is_empty());
    }
}
