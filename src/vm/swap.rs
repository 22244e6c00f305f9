//! Swap Store
//!
//! Fixed-capacity backing store for pages evicted from memory. Slot `i`
//! of the directory describes the page stored at byte `i * PAGE_SIZE` of
//! the swap file, so slot number and storage location are the same thing.
//!
//! Slots are reserved or located under the directory lock; the page
//! transfer itself happens after the lock is dropped. A reserved slot is
//! already owned, so a concurrent write-out can never pick it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{PAGE_SIZE, SWAP_FILE_NAME, SWAP_SIZE_LIMIT};
use crate::kern::error::KernelPanic;
use crate::machine::device::{BlockDevice, DeviceError};
use crate::vm::addrspace::AsId;
use crate::Vaddr;

/// One swap directory slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SwapSlot {
    owner: Option<AsId>,
    vaddr: Vaddr,
}

impl SwapSlot {
    fn holds(&self, owner: AsId, vaddr: Vaddr) -> bool {
        self.owner == Some(owner) && self.vaddr == vaddr
    }
}

/// The swap store
pub struct SwapStore {
    slots: Mutex<Vec<SwapSlot>>,
    file: Mutex<Option<Arc<dyn BlockDevice>>>,
}

impl SwapStore {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            file: Mutex::new(None),
        }
    }

    /// Create `capacity_pages` empty slots and open the swap file
    ///
    /// `open` is handed the logical file name and must create the file if
    /// it does not exist.
    pub fn bootstrap<F>(&self, capacity_pages: usize, open: F) -> Result<(), KernelPanic>
    where
        F: FnOnce(&str) -> Result<Arc<dyn BlockDevice>, DeviceError>,
    {
        let requested = capacity_pages * PAGE_SIZE;
        if requested > SWAP_SIZE_LIMIT {
            return Err(KernelPanic::SwapTooLarge {
                requested,
                limit: SWAP_SIZE_LIMIT,
            });
        }

        {
            let mut slots = self.slots.lock();
            slots.clear();
            slots.resize(capacity_pages, SwapSlot::default());
        }

        let file = open(SWAP_FILE_NAME).map_err(KernelPanic::SwapOpen)?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.file.lock().is_some()
    }

    fn device(&self) -> Result<Arc<dyn BlockDevice>, KernelPanic> {
        self.file
            .lock()
            .as_ref()
            .cloned()
            .ok_or(KernelPanic::SwapNotBootstrapped)
    }

    /// Store `page` as the content of `vaddr` in `owner`, returning the slot
    ///
    /// Running out of slots is fatal.
    pub fn write_out(
        &self,
        owner: AsId,
        vaddr: Vaddr,
        page: &[u8; PAGE_SIZE],
    ) -> Result<usize, KernelPanic> {
        let device = self.device()?;
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots
                .iter()
                .position(|s| s.owner.is_none())
                .ok_or(KernelPanic::SwapFull)?;
            slots[slot] = SwapSlot {
                owner: Some(owner),
                vaddr,
            };
            slot
        };

        let offset = (slot * PAGE_SIZE) as u64;
        let done = device
            .write_at(offset, page)
            .map_err(|source| KernelPanic::SwapIo { offset, source })?;
        check_transfer(offset, done)?;

        crate::vm_trace!("swap_out: 0x{:08x} of {} -> slot {}", vaddr, owner, slot);
        Ok(slot)
    }

    /// Fetch the content of `vaddr` in `owner` into `page`, releasing its
    /// slot, and return the slot it came from
    ///
    /// The slot stays owned until the transfer is over, so a concurrent
    /// write-out cannot reuse it mid-read. The caller only asks for pages
    /// it knows are swapped out, so a missing slot is fatal.
    pub fn read_in(
        &self,
        owner: AsId,
        vaddr: Vaddr,
        page: &mut [u8; PAGE_SIZE],
    ) -> Result<usize, KernelPanic> {
        let device = self.device()?;
        let slot = self
            .slot_of(owner, vaddr)
            .ok_or(KernelPanic::SwapSlotMissing {
                owner: owner.0,
                vaddr,
            })?;

        let offset = (slot * PAGE_SIZE) as u64;
        let transfer = device
            .read_at(offset, page)
            .map_err(|source| KernelPanic::SwapIo { offset, source })
            .and_then(|done| check_transfer(offset, done));

        {
            let mut slots = self.slots.lock();
            if slots[slot].holds(owner, vaddr) {
                slots[slot] = SwapSlot::default();
            }
        }
        transfer?;

        crate::vm_trace!("swap_in: slot {} -> 0x{:08x} of {}", slot, vaddr, owner);
        Ok(slot)
    }

    /// Release every slot owned by `owner`
    pub fn free_all_for(&self, owner: AsId) {
        for slot in self.slots.lock().iter_mut() {
            if slot.owner == Some(owner) {
                *slot = SwapSlot::default();
            }
        }
    }

    /// Slot holding `vaddr` of `owner`
    pub fn slot_of(&self, owner: AsId, vaddr: Vaddr) -> Option<usize> {
        self.slots.lock().iter().position(|s| s.holds(owner, vaddr))
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of occupied slots
    pub fn used(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.owner.is_some()).count()
    }

    /// Print every occupied slot
    pub fn dump(&self, msg: &str) {
        crate::kprintln!("{}", msg);
        for (i, slot) in self.slots.lock().iter().enumerate() {
            if slot.owner.is_some() {
                crate::kprintln!("{} - {:#010x}", i, slot.vaddr);
            }
        }
        crate::kprintln!();
    }

    /// Drop the directory and close the swap file
    pub fn shutdown(&self) {
        *self.slots.lock() = Vec::new();
        *self.file.lock() = None;
    }
}

impl Default for SwapStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Page transfers are all-or-nothing
fn check_transfer(offset: u64, done: usize) -> Result<(), KernelPanic> {
    if done != PAGE_SIZE {
        return Err(KernelPanic::ShortTransfer {
            offset,
            done,
            expected: PAGE_SIZE,
        });
    }
    Ok(())
}
