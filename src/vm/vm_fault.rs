//! VM Fault Handler
//!
//! Resolves one TLB miss: find the segment and page-table entry of the
//! faulting page, bring the page into a frame if it is not resident, and
//! install the translation.
//!
//! ## Page States
//!
//! - **Resident**: only the TLB entry is missing; reload it
//! - **Swapped**: get a frame, read the page back from swap
//! - **Unloaded**: get a frame, then zero-fill it (stack) or read it from
//!   the executable image
//!
//! Getting a frame falls back to evicting the oldest frame of the faulting
//! address space when memory is full. The address-space lock is held for
//! the whole fault, so no other fault of the same process can see a page
//! half loaded or pick a frame that is still being filled.

use crate::config::{trunc_page, PAGE_FRAME, PAGE_SIZE};
use crate::kern::error::{KernelPanic, VmError, VmResult};
use crate::vm::addrspace::{AddressSpace, AsId, AsInner};
use crate::vm::coremap::FrameState;
use crate::vm::loadelf::load_page_from_elf;
use crate::vm::pt::{PageTable, Residency};
use crate::vm::vm_stats::VmStat;
use crate::vm::VmSystem;
use crate::{Paddr, Vaddr};

// ============================================================================
// Fault Types
// ============================================================================

/// Read fault code
pub const VM_FAULT_READ: i32 = 0;
/// Write fault code
pub const VM_FAULT_WRITE: i32 = 1;
/// Write to a read-only page
pub const VM_FAULT_READONLY: i32 = 2;

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
    ReadOnly,
}

impl FaultType {
    /// Decode a trap fault code
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            VM_FAULT_READ => Some(FaultType::Read),
            VM_FAULT_WRITE => Some(FaultType::Write),
            VM_FAULT_READONLY => Some(FaultType::ReadOnly),
            _ => None,
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            FaultType::Read => VM_FAULT_READ,
            FaultType::Write => VM_FAULT_WRITE,
            FaultType::ReadOnly => VM_FAULT_READONLY,
        }
    }
}

// ============================================================================
// Fault Handling
// ============================================================================

impl VmSystem {
    /// Handle a fault of kind `faulttype` at `faultaddress` in `aspace`
    ///
    /// On success the TLB maps the faulting page. A write to a read-only
    /// page is fatal; an unknown fault code is [`VmError::Invalid`]; an
    /// address outside every segment is [`VmError::Fault`].
    pub fn vm_fault(
        &self,
        aspace: Option<&AddressSpace>,
        faulttype: i32,
        faultaddress: Vaddr,
    ) -> VmResult<()> {
        let vaddr = trunc_page(faultaddress);

        match FaultType::from_code(faulttype) {
            Some(FaultType::ReadOnly) => {
                return Err(KernelPanic::ReadOnlyFault { vaddr }.into());
            }
            Some(FaultType::Read | FaultType::Write) => {}
            None => return Err(VmError::Invalid),
        }

        let aspace = aspace.ok_or(VmError::Fault)?;
        self.stats().inc(VmStat::TlbFault);
        crate::vm_trace!("vm_fault: 0x{:08x} in {}", faultaddress, aspace.id());

        let mut inner = aspace.lock();
        let AsInner {
            page_table,
            segments,
            image,
            ..
        } = &mut *inner;

        let segment = segments.find(vaddr).ok_or(VmError::Fault)?;
        let index = page_table
            .find_in(segment.entries(), vaddr)
            .ok_or(VmError::Fault)?;
        let residency = page_table
            .get(index)
            .map(|e| e.residency())
            .ok_or(VmError::Fault)?;
        let writable = segment.permissions().can_write();

        match residency {
            Residency::Resident(paddr) => {
                self.stats().inc(VmStat::TlbReload);
                // the loader may still be filling a read-only page
                let loading = self.coremap().check_state(paddr, FrameState::Loading);
                self.install(vaddr, paddr, writable || loading)
            }

            Residency::Swapped => {
                let paddr = self.obtain_frame(aspace.id(), page_table, vaddr)?;
                if let Some(entry) = page_table.get_mut(index) {
                    entry.set_resident(paddr);
                }

                let mut page = [0u8; PAGE_SIZE];
                self.swap().read_in(aspace.id(), vaddr, &mut page)?;
                self.ram().write_page(paddr, &page);
                self.stats().inc(VmStat::PageFaultSwap);
                self.stats().inc(VmStat::PageFaultDisk);

                self.coremap().update_state(paddr, FrameState::Clean);
                self.install(vaddr, paddr, writable)
            }

            Residency::Unloaded => {
                let chunk = segment.load_chunk(segment.page_index(vaddr));
                let image = match (chunk, image.as_deref()) {
                    (Some(chunk), None) => {
                        return Err(VmError::ImageRead {
                            offset: chunk.file_offset,
                        });
                    }
                    (_, image) => image,
                };

                let paddr = self.obtain_frame(aspace.id(), page_table, vaddr)?;
                if let Some(entry) = page_table.get_mut(index) {
                    entry.set_resident(paddr);
                }

                let (Some(chunk), Some(image)) = (chunk, image) else {
                    self.ram().zero_page(paddr);
                    self.stats().inc(VmStat::PageFaultZero);
                    self.coremap().update_state(paddr, FrameState::Clean);
                    return self.install(vaddr, paddr, writable);
                };

                let mut page = [0u8; PAGE_SIZE];
                if let Err(err) = load_page_from_elf(image, &mut page, chunk) {
                    self.abandon_page(aspace.id(), page_table, index, vaddr, paddr);
                    return Err(err);
                }
                self.ram().write_page(paddr, &page);
                self.stats().inc(VmStat::PageFaultElf);
                self.stats().inc(VmStat::PageFaultDisk);

                self.coremap().update_state(paddr, FrameState::Clean);
                self.install(vaddr, paddr, writable)
            }
        }
    }

    /// A frame for page `vaddr` of `owner`, evicting one of the owner's
    /// own pages if memory is full
    fn obtain_frame(
        &self,
        owner: AsId,
        page_table: &mut PageTable,
        vaddr: Vaddr,
    ) -> VmResult<Paddr> {
        if let Some(paddr) = self.coremap().allocate_user(vaddr, owner) {
            return Ok(paddr);
        }

        self.stats().inc(VmStat::SwapFileWrite);
        let victim = self.coremap().select_victim(owner)?;

        let mut page = [0u8; PAGE_SIZE];
        self.ram().read_page(victim.paddr, &mut page);
        self.swap().write_out(owner, victim.vaddr, &page)?;
        page_table.mark_evicted(victim.vaddr)?;
        self.coremap().reassign(owner, victim.index, vaddr);

        self.tlb_sync()
            .replace_victim(self.tlb(), self.stats(), victim.vaddr, vaddr, victim.paddr);
        crate::vm_trace!(
            "evict: 0x{:08x} -> swap, frame 0x{:08x} -> 0x{:08x}",
            victim.vaddr,
            victim.paddr,
            vaddr
        );
        Ok(victim.paddr)
    }

    /// Back out of a page-in that failed after entry `index` got the frame
    /// at `paddr`: the page is unloaded again, the frame freed, and any
    /// translation eviction pointed at it dropped
    pub(crate) fn abandon_page(
        &self,
        owner: AsId,
        page_table: &mut PageTable,
        index: usize,
        vaddr: Vaddr,
        paddr: Paddr,
    ) {
        if let Some(entry) = page_table.get_mut(index) {
            entry.set_unloaded();
        }
        self.tlb_sync().invalidate_page(self.tlb(), vaddr);
        self.coremap().free_frame(paddr, owner);
        crate::vm_trace!("abandon: 0x{:08x}, frame 0x{:08x} freed", vaddr, paddr);
    }

    /// Install `vaddr -> paddr` in the TLB
    fn install(&self, vaddr: Vaddr, paddr: Paddr, writable: bool) -> VmResult<()> {
        if paddr & PAGE_FRAME != paddr {
            return Err(KernelPanic::Misaligned { paddr }.into());
        }
        self.tlb_sync()
            .write_mapping(self.tlb(), self.stats(), vaddr, paddr, writable);
        Ok(())
    }
}
