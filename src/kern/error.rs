//! Error types for the VM subsystem
//!
//! Two propagation classes exist. Errors caused by a process's own
//! behaviour ([`VmError::Fault`], [`VmError::Invalid`], ...) travel back to
//! the trap handler as errno values. Broken internal invariants are
//! [`KernelPanic`]s: the kernel cannot continue on inconsistent shared
//! state, so the top-level harness halts on them.

use thiserror::Error;

use crate::machine::device::DeviceError;
use crate::{Paddr, Vaddr};

// ============================================================================
// Errno Values
// ============================================================================

/// Out of memory
pub const ENOMEM: i32 = 3;
/// Bad memory reference
pub const EFAULT: i32 = 6;
/// Invalid argument
pub const EINVAL: i32 = 8;

// ============================================================================
// Kernel-Fatal Conditions
// ============================================================================

/// Unrecoverable conditions; any of these halts the kernel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelPanic {
    #[error("got VM_FAULT_READONLY at 0x{vaddr:08x}")]
    ReadOnlyFault { vaddr: Vaddr },

    #[error("cannot find victim for address space {owner}")]
    NoVictim { owner: u64 },

    #[error("swapfile is full")]
    SwapFull,

    #[error("swapfile: no slot for 0x{vaddr:08x} of address space {owner}")]
    SwapSlotMissing { owner: u64, vaddr: Vaddr },

    #[error("swapfile: I/O error at offset {offset}: {source}")]
    SwapIo { offset: u64, source: DeviceError },

    #[error("swapfile: short transfer at offset {offset} ({done} of {expected} bytes)")]
    ShortTransfer {
        offset: u64,
        done: usize,
        expected: usize,
    },

    #[error("swapfile can't be larger than {limit} bytes (requested {requested})")]
    SwapTooLarge { requested: usize, limit: usize },

    #[error("error opening swapfile: {0}")]
    SwapOpen(DeviceError),

    #[error("swap store used before bootstrap")]
    SwapNotBootstrapped,

    #[error("page table: no entry for 0x{vaddr:08x}")]
    PageNotFound { vaddr: Vaddr },

    #[error("physical address 0x{paddr:08x} is not page-aligned")]
    Misaligned { paddr: Paddr },

    #[error("out of memory during bootstrap")]
    BootstrapOom,

    #[error("kernel free of 0x{vaddr:08x} outside managed memory")]
    BadKernelFree { vaddr: Vaddr },
}

// ============================================================================
// VM Errors
// ============================================================================

/// Result of a VM operation as seen by the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Access outside every region of the address space
    #[error("bad address")]
    Fault,

    /// Malformed request (e.g. unknown fault type)
    #[error("invalid argument")]
    Invalid,

    /// No physical memory for an eager allocation
    #[error("out of memory")]
    NoMemory,

    /// The executable image could not be read
    #[error("executable read failed at offset {offset}")]
    ImageRead { offset: u64 },

    /// Kernel-fatal condition; the caller must halt
    #[error("kernel panic: {0}")]
    Panic(#[from] KernelPanic),
}

impl VmError {
    /// Errno value reported to the faulting process
    ///
    /// Fatal errors have no errno; they never reach a process.
    pub fn errno(&self) -> Option<i32> {
        match self {
            VmError::Fault | VmError::ImageRead { .. } => Some(EFAULT),
            VmError::Invalid => Some(EINVAL),
            VmError::NoMemory => Some(ENOMEM),
            VmError::Panic(_) => None,
        }
    }

    /// True if the kernel must halt
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Panic(_))
    }
}

pub type VmResult<T> = Result<T, VmError>;
