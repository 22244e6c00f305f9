//! Kernel Page Allocator
//!
//! Whole-page allocations for the kernel itself. Before the coremap is
//! bootstrapped, pages are stolen from the boot-time bump allocator and can
//! never be returned; afterwards they come from the coremap as `Fixed`
//! contiguous runs that are never evicted.
//!
//! Addresses handed out are kernel virtual addresses in the direct-mapped
//! segment.

use crate::kern::error::KernelPanic;
use crate::machine::paddr_to_kvaddr;
use crate::vm::VmSystem;
use crate::Vaddr;

impl VmSystem {
    /// Whether the coremap manages physical memory yet
    pub fn is_bootstrapped(&self) -> bool {
        self.coremap().is_bootstrapped()
    }

    /// Allocate `npages` contiguous kernel pages
    pub fn alloc_kpages(&self, npages: usize) -> Option<Vaddr> {
        let paddr = if self.is_bootstrapped() {
            self.coremap().alloc_contiguous(npages)
        } else {
            self.ram().ram_stealmem(npages)
        }?;
        Some(paddr_to_kvaddr(paddr))
    }

    /// Free a kernel allocation made by [`VmSystem::alloc_kpages`]
    ///
    /// Memory stolen before bootstrap is leaked.
    pub fn free_kpages(&self, vaddr: Vaddr) -> Result<(), KernelPanic> {
        self.coremap().free_kernel(vaddr).map(|_| ())
    }
}
