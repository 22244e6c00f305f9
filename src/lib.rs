//! demand_vm - Demand-paged virtual memory for a MIPS-like teaching kernel
//!
//! This crate implements the paging core of a small kernel with a
//! software-managed TLB: the physical frame table (coremap), per-process
//! page tables and segment lists, the swap store, and the fault handler
//! that ties them together.
//!
//! The hardware the core talks to (RAM, TLB, disks) is modelled under
//! [`machine`], so the whole subsystem runs hosted as well as in-kernel.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod config;
pub mod console;
pub mod kern;
pub mod machine;
pub mod vm;

pub use config::VmConfig;
pub use kern::error::{KernelPanic, VmError};
pub use vm::{AddressSpace, AsId, FaultType, VmSystem};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name, used in console banners
pub const NAME: &str = "demand_vm";

/// Virtual address on the 32-bit target
pub type Vaddr = u32;
/// Physical address on the 32-bit target
pub type Paddr = u32;
