//! Software-managed TLB
//!
//! Models the MIPS R3000 translation lookaside buffer: `NUM_TLB` slots of
//! (entryhi, entrylo) pairs, written only by the kernel. Any access must
//! happen with interrupts masked; [`Tlb::splhigh`] hands out a guard that
//! stands for that state, and all slot operations live on the guard.

use core::fmt;
use spin::{Mutex, MutexGuard};

use crate::config::PAGE_FRAME;
use crate::{Paddr, Vaddr};

// ============================================================================
// Constants
// ============================================================================

/// Number of TLB slots
pub const NUM_TLB: usize = 64;

/// Virtual page number mask of entryhi
pub const TLBHI_VPAGE: u32 = 0xffff_f000;
/// Physical page number mask of entrylo
pub const TLBLO_PPAGE: u32 = 0xffff_f000;
/// Entry is writable (MIPS calls it "dirty")
pub const TLBLO_DIRTY: u32 = 0x0000_0400;
/// Entry is valid
pub const TLBLO_VALID: u32 = 0x0000_0200;
/// Entrylo value of an unused slot
pub const TLBLO_INVALID: u32 = 0;

/// Entryhi value of unused slot `i`: a distinct kernel-segment page that
/// can never match a user probe
pub const fn tlbhi_invalid(i: usize) -> u32 {
    (0x80000 + i as u32) << 12
}

// ============================================================================
// TLB Entry
// ============================================================================

/// One TLB slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: u32,
    pub lo: u32,
}

impl TlbEntry {
    pub const fn invalid(i: usize) -> Self {
        Self {
            hi: tlbhi_invalid(i),
            lo: TLBLO_INVALID,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.lo & TLBLO_VALID != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.lo & TLBLO_DIRTY != 0
    }
}

// ============================================================================
// TLB
// ============================================================================

/// The translation lookaside buffer
pub struct Tlb {
    slots: Mutex<[TlbEntry; NUM_TLB]>,
}

impl Tlb {
    /// Create a TLB with every slot invalid
    pub fn new() -> Self {
        let mut slots = [TlbEntry::invalid(0); NUM_TLB];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = TlbEntry::invalid(i);
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Mask interrupts and take exclusive access to the TLB
    pub fn splhigh(&self) -> SplGuard<'_> {
        SplGuard {
            slots: self.slots.lock(),
        }
    }

    /// Emulate the MMU lookup: physical address and writability of a
    /// valid mapping for `vaddr`
    pub fn translate(&self, vaddr: Vaddr) -> Option<(Paddr, bool)> {
        let spl = self.splhigh();
        let i = spl.probe(vaddr & TLBHI_VPAGE)?;
        let entry = spl.read(i);
        if !entry.is_valid() {
            return None;
        }
        let paddr = (entry.lo & TLBLO_PPAGE) | (vaddr & !PAGE_FRAME);
        Some((paddr, entry.is_writable()))
    }

    /// Number of valid slots
    pub fn valid_count(&self) -> usize {
        self.splhigh().slots.iter().filter(|e| e.is_valid()).count()
    }

    /// Print every slot to the console
    pub fn dump(&self) {
        crate::kprintln!("TLB printing");
        let spl = self.splhigh();
        for entry in spl.slots.iter() {
            crate::kprintln!("{}", entry);
        }
        crate::kprintln!("end");
    }
}

impl fmt::Display for TlbEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLB :: vaddr 0x{:08x} - paddr 0x{:08x}", self.hi, self.lo)
    }
}

/// Interrupts-masked access to the TLB; dropping it restores interrupts
pub struct SplGuard<'a> {
    slots: MutexGuard<'a, [TlbEntry; NUM_TLB]>,
}

impl SplGuard<'_> {
    /// Read slot `i`
    pub fn read(&self, i: usize) -> TlbEntry {
        self.slots[i]
    }

    /// Write slot `i`
    pub fn write(&mut self, hi: u32, lo: u32, i: usize) {
        self.slots[i] = TlbEntry { hi, lo };
    }

    /// Find the slot whose entryhi matches `hi`
    pub fn probe(&self, hi: u32) -> Option<usize> {
        self.slots.iter().position(|e| e.hi == hi)
    }
}
