//! Kernel error types
//!
//! Two layers: `KernelError` for faults inside the kernel, and `Errno` for
//! everything that crosses the system-call boundary. Subsystem errors
//! convert into `KernelError`; syscall handlers convert either into an
//! `Errno` before returning to user space.

use core::fmt;

/// POSIX error numbers as used by the system-call ABI.
///
/// Syscalls report failure by placing the number in the error slot of the
/// result pair; user space sees the negated value.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    ERANGE = 34,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    EBADFD = 77,
    ENOTSOCK = 88,
    EOPNOTSUPP = 95,
    ETIMEDOUT = 110,
}

impl Errno {
    /// Raw error number.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Value placed in the syscall error slot.
    pub const fn as_usize(self) -> usize {
        self as i32 as usize
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested_pages: usize,
        free_pages: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: u64,
    },
    ThreadNotFound {
        tid: u64,
    },

    /// Loader errors
    ElfError(ElfError),

    /// Module errors
    ModuleError(ModuleError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// ELF loader errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Short read while parsing headers or segments
    TruncatedFile,
    /// Magic bytes are not `\x7fELF`
    BadMagic,
    /// Class, data encoding, OSABI or machine do not match the host
    WrongMachine,
    /// e_type is not acceptable for this load (ET_DYN/ET_EXEC)
    WrongType,
    /// A segment could not be mapped into the target page map
    MapFailed,
    /// Relocation references a symbol the kernel does not export
    UnresolvedSymbol,
    /// Relocation type is not supported on this architecture
    BadRelocation,
    /// The dynamic section is missing required entries
    BadDynamic,
}

/// Module loader errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleError {
    /// Module name was never registered
    NotRegistered,
    /// A listed dependency is unknown or failed to load
    DependencyFailed,
    /// The image lacks the module descriptor section
    NoDescriptor,
    /// The module's init hook returned a nonzero status
    InitFailed(i32),
    /// Underlying ELF processing failed
    Elf(ElfError),
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested_pages,
                free_pages,
            } => write!(
                f,
                "Out of memory: requested {} pages, {} free",
                requested_pages, free_pages
            ),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "Thread {} not found", tid),
            Self::ElfError(e) => write!(f, "ELF error: {:?}", e),
            Self::ModuleError(e) => write!(f, "Module error: {:?}", e),
            Self::InvalidArgument { name } => write!(f, "Invalid argument: {}", name),
            Self::ResourceExhausted { resource } => {
                write!(f, "Resource exhausted: {}", resource)
            }
            Self::AlreadyExists { resource } => write!(f, "{} already exists", resource),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::ElfError(err)
    }
}

impl From<ModuleError> for KernelError {
    fn from(err: ModuleError) -> Self {
        Self::ModuleError(err)
    }
}

impl From<ElfError> for ModuleError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } => Errno::ENOMEM,
            KernelError::InvalidAddress { .. } | KernelError::UnmappedMemory { .. } => {
                Errno::EFAULT
            }
            KernelError::ProcessNotFound { .. } | KernelError::ThreadNotFound { .. } => {
                Errno::ESRCH
            }
            KernelError::ElfError(_) => Errno::ENOEXEC,
            KernelError::ModuleError(_) => Errno::ENOEXEC,
            KernelError::InvalidArgument { .. } => Errno::EINVAL,
            KernelError::ResourceExhausted { .. } => Errno::ENFILE,
            KernelError::AlreadyExists { .. } => Errno::EEXIST,
            KernelError::NotInitialized { .. } => Errno::EBUSY,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_posix() {
        assert_eq!(Errno::ENOENT.as_i32(), 2);
        assert_eq!(Errno::EBADF.as_i32(), 9);
        assert_eq!(Errno::EINVAL.as_i32(), 22);
        assert_eq!(Errno::ENOSYS.as_i32(), 38);
    }

    #[test]
    fn kernel_error_maps_to_errno() {
        let e: Errno = KernelError::OutOfMemory {
            requested_pages: 4,
            free_pages: 0,
        }
        .into();
        assert_eq!(e, Errno::ENOMEM);
        let e: Errno = KernelError::ElfError(ElfError::WrongMachine).into();
        assert_eq!(e, Errno::ENOEXEC);
    }
}
