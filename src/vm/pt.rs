//! Per-process Page Table
//!
//! One entry per virtual page of every region of an address space. Entries
//! of one region are contiguous and in ascending address order, so a
//! region only needs to remember the index of its first entry and its
//! page count to bound a lookup.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::kern::error::KernelPanic;
use crate::{Paddr, Vaddr};

// ============================================================================
// Page Table Entry
// ============================================================================

/// Where the content of a virtual page currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Never loaded: content comes from the image or is zero-filled
    Unloaded,
    /// Backed by the frame at this physical address
    Resident(Paddr),
    /// Evicted to the swap store
    Swapped,
}

/// One virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    vaddr: Vaddr,
    residency: Residency,
}

impl PageTableEntry {
    /// Fresh entry: neither resident nor in swap
    pub const fn new(vaddr: Vaddr) -> Self {
        Self {
            vaddr,
            residency: Residency::Unloaded,
        }
    }

    pub const fn vaddr(&self) -> Vaddr {
        self.vaddr
    }

    pub const fn residency(&self) -> Residency {
        self.residency
    }

    /// Backing frame, if resident
    pub const fn frame(&self) -> Option<Paddr> {
        match self.residency {
            Residency::Resident(paddr) => Some(paddr),
            _ => None,
        }
    }

    pub const fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident(_))
    }

    pub const fn in_swap(&self) -> bool {
        matches!(self.residency, Residency::Swapped)
    }

    /// Bind the page to `frame`
    pub fn set_resident(&mut self, frame: Paddr) {
        self.residency = Residency::Resident(frame);
    }

    /// Record that the page went to swap
    pub fn set_swapped(&mut self) {
        self.residency = Residency::Swapped;
    }

    /// Forget the page's content; the next fault loads it afresh
    pub fn set_unloaded(&mut self) {
        self.residency = Residency::Unloaded;
    }
}

// ============================================================================
// Page Table
// ============================================================================

/// Page table of one address space
#[derive(Debug, Default)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add one fresh entry, returning its index
    pub fn create_entry(&mut self, vaddr: Vaddr) -> usize {
        self.entries.push(PageTableEntry::new(vaddr));
        self.entries.len() - 1
    }

    /// Add `npages` fresh entries for consecutive pages starting at
    /// `first_vaddr`, returning the index of the first one
    pub fn create_run(&mut self, first_vaddr: Vaddr, npages: usize) -> usize {
        let first = self.entries.len();
        self.entries.reserve(npages);
        for i in 0..npages {
            self.create_entry(first_vaddr + (i * crate::config::PAGE_SIZE) as u32);
        }
        first
    }

    /// Index of the entry for page `vaddr` within `range`, newest first
    pub fn find_in(&self, range: Range<usize>, vaddr: Vaddr) -> Option<usize> {
        let start = range.start;
        self.entries
            .get(range)?
            .iter()
            .rposition(|e| e.vaddr == vaddr)
            .map(|i| start + i)
    }

    /// Index of the entry for page `vaddr` anywhere in the table
    ///
    /// Where regions overlap, the most recently defined one wins, the same
    /// as for segment lookup.
    pub fn find(&self, vaddr: Vaddr) -> Option<usize> {
        self.find_in(0..self.entries.len(), vaddr)
    }

    /// Mark the page at `vaddr` as evicted to swap
    ///
    /// The evicting fault believes the page is resident; not finding it
    /// means the coremap and page table disagree.
    pub fn mark_evicted(&mut self, vaddr: Vaddr) -> Result<(), KernelPanic> {
        let index = self.find(vaddr).ok_or(KernelPanic::PageNotFound { vaddr })?;
        self.entries[index].set_swapped();
        Ok(())
    }

    /// Drop every entry
    pub fn free_chain(&mut self) {
        self.entries = Vec::new();
    }

    pub fn get(&self, index: usize) -> Option<&PageTableEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of resident pages
    pub fn resident_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_resident()).count()
    }
}

impl fmt::Display for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Printing PageTable")?;
        for e in &self.entries {
            writeln!(
                f,
                "vaddr 0x{:x} - paddr 0x{:x} - inmem {} inswap {}",
                e.vaddr,
                e.frame().unwrap_or(0),
                e.is_resident() as u8,
                e.in_swap() as u8
            )?;
        }
        Ok(())
    }
}
