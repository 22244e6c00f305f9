//! Machine model
//!
//! The pieces of a MIPS-like machine the VM subsystem drives directly:
//! - ram: physical memory and the boot-time page stealer
//! - tlb: the software-managed translation lookaside buffer
//! - device: random-access block devices (swap file, executables)

pub mod device;
pub mod ram;
pub mod tlb;

pub use device::{BlockDevice, DeviceError, MemDevice};
pub use ram::PhysicalMemory;
pub use tlb::Tlb;

/// Base of the direct-mapped kernel segment
pub const MIPS_KSEG0: u32 = 0x8000_0000;

/// Kernel virtual address of a physical address
pub const fn paddr_to_kvaddr(paddr: u32) -> u32 {
    paddr + MIPS_KSEG0
}

/// Physical address of a direct-mapped kernel virtual address
pub const fn kvaddr_to_paddr(vaddr: u32) -> u32 {
    vaddr - MIPS_KSEG0
}
