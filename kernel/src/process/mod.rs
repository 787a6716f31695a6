//! Processes
//!
//! A process owns exactly one address space, a descriptor table, a
//! working directory and its threads. The process tree is owned through
//! the global lists and the children vectors; parent links are weak pid
//! references, and orphans reparent to init. Pids are globally unique
//! and monotonic.

pub mod exec;
pub mod fd;
pub mod thread;

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{Errno, KernelError, KernelResult};
use crate::fs::VfsNode;
use crate::mm::page_map::PageMap;
use crate::mm::{VirtAddr, USER_INTERP_BASE, USER_MAP_BASE, USER_STACK_TOP};
use crate::sched::list::ListNode;
use fd::{FdTable, FileDescriptor};
use thread::Thread;

pub type Pid = usize;

/// Default permission mask of a fresh process tree root.
const DEFAULT_UMASK: u32 = 0o022;

static PID_COUNTER: Mutex<Pid> = Mutex::new(0);

fn alloc_pid() -> Pid {
    let mut counter = PID_COUNTER.lock();
    let pid = *counter;
    *counter += 1;
    pid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessState {
    Running = 0,
    Ready = 1,
    Waiting = 2,
    Blocked = 3,
    Dead = 4,
}

impl ProcessState {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Ready,
            2 => Self::Waiting,
            3 => Self::Blocked,
            _ => Self::Dead,
        }
    }
}

/// The address space a process executes under.
pub enum AddressSpace {
    /// Kernel processes share the kernel map.
    Kernel,
    /// User processes own their map.
    User(Arc<PageMap>),
}

impl AddressSpace {
    pub fn page_map(&self) -> &PageMap {
        match self {
            AddressSpace::Kernel => crate::mm::page_map::kernel_map(),
            AddressSpace::User(map) => map,
        }
    }

    pub fn user_map(&self) -> Option<&Arc<PageMap>> {
        match self {
            AddressSpace::Kernel => None,
            AddressSpace::User(map) => Some(map),
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub name: String,
    state: AtomicU32,
    pub address_space: Mutex<AddressSpace>,
    pub working_dir: Mutex<Arc<VfsNode>>,
    /// Watermark for new anonymous mappings.
    pub map_base: AtomicU64,
    /// Watermark below which the next user stack is placed.
    pub stack_top: AtomicU64,
    /// Permission mask (umask).
    pub umask: AtomicU32,
    /// Weak parent reference.
    pub parent: Mutex<Option<Pid>>,
    pub children: Mutex<Vec<Pid>>,
    pub threads: Mutex<Vec<NonNull<Thread>>>,
    pub files: FdTable,
    pub return_code: AtomicI32,
    /// Set once the parent collected the return code.
    pub waited: core::sync::atomic::AtomicBool,
    /// Registered signal handlers, indexed by signal number.
    pub sigactions: Mutex<[u64; 64]>,
    /// Intrusive link for the process lists.
    next: Option<NonNull<Process>>,
}

// SAFETY: processes are shared by pointer between CPUs; mutable state is
// behind locks or atomics.
unsafe impl Send for Process {}

impl ListNode for Process {
    fn next_link(&self) -> Option<NonNull<Self>> {
        self.next
    }
    fn set_next_link(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }
}

impl Process {
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Resolve a descriptor number; sets the caller's errno on failure.
    pub fn fd_to_ptr(&self, fd: usize) -> Result<Arc<FileDescriptor>, Errno> {
        self.files.get(fd).inspect_err(|&err| thread::set_errno(err))
    }

    /// Root of the currently installed page map.
    pub fn page_map_root(&self) -> crate::mm::PhysAddr {
        self.address_space.lock().page_map().root()
    }
}

fn new_process(
    name: &str,
    state: ProcessState,
    is_user: bool,
    parent: Option<NonNull<Process>>,
) -> KernelResult<NonNull<Process>> {
    let address_space = if is_user {
        AddressSpace::User(Arc::new(PageMap::new()?))
    } else {
        AddressSpace::Kernel
    };

    let (working_dir, umask, map_base, parent_pid) = match parent {
        Some(parent) => {
            // SAFETY: the caller guarantees the parent is live.
            let parent = unsafe { parent.as_ref() };
            (
                parent.working_dir.lock().clone(),
                parent.umask.load(Ordering::Relaxed),
                parent.map_base.load(Ordering::Relaxed),
                Some(parent.pid),
            )
        }
        None => (crate::fs::root(), DEFAULT_UMASK, USER_MAP_BASE, None),
    };

    let process = Box::new(Process {
        pid: alloc_pid(),
        name: name.to_string(),
        state: AtomicU32::new(state as u32),
        address_space: Mutex::new(address_space),
        working_dir: Mutex::new(working_dir),
        map_base: AtomicU64::new(map_base),
        stack_top: AtomicU64::new(USER_STACK_TOP),
        umask: AtomicU32::new(umask),
        parent: Mutex::new(parent_pid),
        children: Mutex::new(Vec::new()),
        threads: Mutex::new(Vec::new()),
        files: FdTable::new(),
        return_code: AtomicI32::new(0),
        waited: core::sync::atomic::AtomicBool::new(false),
        sigactions: Mutex::new([0; 64]),
        next: None,
    });
    let process = NonNull::from(Box::leak(process));

    if let Some(parent) = parent {
        // SAFETY: parent is live.
        unsafe {
            parent.as_ref().children.lock().push(process.as_ref().pid);
        }
    }
    crate::sched::register_process(process);
    Ok(process)
}

/// Create a process with one initial thread entering at `entry`.
pub fn create(
    name: &str,
    state: ProcessState,
    entry: VirtAddr,
    is_user: bool,
    parent: Option<NonNull<Process>>,
) -> KernelResult<NonNull<Process>> {
    let process = new_process(name, state, is_user, parent)?;
    thread::create(process, entry, is_user)?;
    log::debug!("process: created \"{}\" (pid {})", name, unsafe {
        process.as_ref().pid
    });
    Ok(process)
}

/// Create a user process from an ELF executable, wiring stdio to the
/// active terminal.
pub fn create_elf(
    name: &str,
    parent: Option<NonNull<Process>>,
    path: &str,
) -> KernelResult<NonNull<Process>> {
    let node = crate::fs::lookup(&crate::fs::root(), path).map_err(|_| {
        KernelError::ElfError(crate::error::ElfError::TruncatedFile)
    })?;
    let ops = node
        .ops
        .clone()
        .ok_or(KernelError::ElfError(crate::error::ElfError::TruncatedFile))?;

    let process = new_process(name, ProcessState::Ready, true, parent)?;
    // SAFETY: just created, not yet visible to the scheduler's selector.
    let proc_ref = unsafe { process.as_ref() };

    let loaded = (|| -> KernelResult<u64> {
        let space = proc_ref.address_space.lock();
        let map = space.page_map();
        let info = crate::elf::load(map, ops.as_ref(), 0)?;
        match info.interpreter {
            Some(ref interp) => {
                let interp_node = crate::fs::lookup(&crate::fs::root(), interp)
                    .map_err(|_| KernelError::ElfError(crate::error::ElfError::TruncatedFile))?;
                let interp_ops = interp_node
                    .ops
                    .clone()
                    .ok_or(KernelError::ElfError(crate::error::ElfError::TruncatedFile))?;
                let interp_info = crate::elf::load(map, interp_ops.as_ref(), USER_INTERP_BASE)?;
                Ok(interp_info.entry)
            }
            None => Ok(info.entry),
        }
    })();
    let entry = match loaded {
        Ok(entry) => entry,
        Err(err) => {
            // The half-built process goes straight to the reaper.
            kill(process, -1);
            return Err(err);
        }
    };

    // Stdio: fds 0/1/2 share one descriptor on the active terminal.
    if let Some(terminal) = crate::drivers::console::active() {
        let desc = FileDescriptor::new(terminal, 0);
        for fd in 0..3 {
            let _ = proc_ref.files.install_at(fd, desc.clone());
        }
        // install_at bumped the refcount thrice; the creation reference
        // itself is not parked anywhere.
        desc.refcount.fetch_sub(1, Ordering::Relaxed);
    }

    thread::create(process, VirtAddr::new(entry), true)?;
    log::info!("process: \"{}\" (pid {}) from \"{}\"", name, proc_ref.pid, path);
    Ok(process)
}

/// Bring up pid 1.
pub fn spawn_init(path: &str) -> KernelResult<()> {
    let process = create_elf("init", None, path)?;
    // SAFETY: just created.
    let pid = unsafe { process.as_ref().pid };
    if pid != 1 {
        log::warn!("process: init got pid {} instead of 1", pid);
    }
    Ok(())
}

/// Fork `process`: duplicated address space, shared descriptors, and one
/// thread that resumes after the fork trap with result 0.
pub fn fork(process: NonNull<Process>, invoking: &Thread) -> KernelResult<Pid> {
    // SAFETY: caller guarantees the process is live.
    let parent = unsafe { process.as_ref() };

    let forked_space = {
        let space = parent.address_space.lock();
        match &*space {
            AddressSpace::Kernel => AddressSpace::Kernel,
            AddressSpace::User(map) => AddressSpace::User(Arc::new(map.fork()?)),
        }
    };

    let child = Box::new(Process {
        pid: alloc_pid(),
        name: parent.name.clone(),
        state: AtomicU32::new(ProcessState::Ready as u32),
        address_space: Mutex::new(forked_space),
        working_dir: Mutex::new(parent.working_dir.lock().clone()),
        map_base: AtomicU64::new(parent.map_base.load(Ordering::Relaxed)),
        stack_top: AtomicU64::new(parent.stack_top.load(Ordering::Relaxed)),
        umask: AtomicU32::new(parent.umask.load(Ordering::Relaxed)),
        parent: Mutex::new(Some(parent.pid)),
        children: Mutex::new(Vec::new()),
        threads: Mutex::new(Vec::new()),
        files: parent.files.clone_for_fork(),
        return_code: AtomicI32::new(0),
        waited: core::sync::atomic::AtomicBool::new(false),
        sigactions: Mutex::new(*parent.sigactions.lock()),
        next: None,
    });
    let child = NonNull::from(Box::leak(child));
    // SAFETY: child is live; parent is live.
    let child_pid = unsafe { child.as_ref().pid };
    parent.children.lock().push(child_pid);

    crate::sched::register_process(child);
    thread::fork_from(child, invoking)?;
    Ok(child_pid)
}

/// Terminate `process`: threads to the hanging list, children reparent to
/// init, descriptors released, state Dead. A self-kill clears the CPU's
/// thread pointer so the scheduler cannot re-select the corpse.
pub fn kill(process: NonNull<Process>, return_code: i32) {
    crate::sched::pause();
    // SAFETY: caller guarantees the process is live.
    let proc_ref = unsafe { process.as_ref() };
    if proc_ref.pid <= 1 {
        log::warn!("process: killing pid {} ({})", proc_ref.pid, proc_ref.name);
    }

    let cpu = crate::arch::cpu::current();
    let is_suicide = cpu
        .current_thread()
        .map(|t| {
            // SAFETY: the current thread is live.
            core::ptr::eq(unsafe { t.as_ref() }.process.as_ptr(), process.as_ptr())
        })
        .unwrap_or(false);

    // Hand every thread over to the reaper.
    {
        let threads = proc_ref.threads.lock();
        for &thread in threads.iter() {
            crate::sched::hang_thread(thread);
        }
    }
    proc_ref.threads.lock().clear();

    // The parent link stays so the return code can be collected; the
    // children reparent to init.
    let orphans: Vec<Pid> = core::mem::take(&mut *proc_ref.children.lock());
    if !orphans.is_empty() {
        if let Some(init) = by_pid(1) {
            // SAFETY: init is live.
            let init = unsafe { init.as_ref() };
            for orphan_pid in orphans {
                if let Some(orphan) = by_pid(orphan_pid) {
                    // SAFETY: list membership keeps the orphan live.
                    unsafe { *orphan.as_ref().parent.lock() = Some(1) };
                }
                init.children.lock().push(orphan_pid);
            }
        }
    }

    proc_ref.files.close_all();
    proc_ref.return_code.store(return_code, Ordering::Release);
    proc_ref.set_state(ProcessState::Dead);
    crate::sched::hang_process(process);

    if is_suicide {
        cpu.set_current_thread(core::ptr::null_mut());
    }
    crate::sched::invoke();
}

/// Free a reaped process. Switches away from the dying address space
/// first if this CPU still has it loaded.
pub fn destroy(process: NonNull<Process>) {
    // SAFETY: the reaper holds the only reference by now.
    let proc_ref = unsafe { process.as_ref() };
    if crate::arch::cpu::current().current_thread().is_none() {
        crate::mm::page_map::kernel_map().set_active();
    }
    if let Some(parent_pid) = *proc_ref.parent.lock() {
        if let Some(parent) = by_pid(parent_pid) {
            // SAFETY: list membership keeps the parent live.
            unsafe {
                parent.as_ref().children.lock().retain(|&pid| pid != proc_ref.pid);
            }
        }
    }
    log::debug!("process: reaping \"{}\" (pid {})", proc_ref.name, proc_ref.pid);
    // The address space Arc drops with the box and tears down its tables.
    // SAFETY: as above; nothing references the process anymore.
    unsafe { drop(Box::from_raw(process.as_ptr())) };
}

/// Look up a live (or not-yet-reaped) process by pid.
pub fn by_pid(pid: Pid) -> Option<NonNull<Process>> {
    crate::sched::find_process(pid)
}

/// The process of the thread executing on this CPU.
pub fn current() -> Option<NonNull<Process>> {
    thread::current().map(|t| {
        // SAFETY: the current thread is live.
        unsafe { t.as_ref() }.process
    })
}
