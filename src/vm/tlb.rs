//! TLB Synchronizer
//!
//! Keeps the hardware TLB in step with the page tables. Every operation
//! runs with interrupts masked ([`Tlb::splhigh`]) for its whole
//! read-modify-write sequence.
//!
//! Slot choice for a new mapping: update in place on a hit, else the first
//! invalid slot, else a round-robin victim. The first two of those never
//! evict a live translation.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::machine::tlb::{Tlb, TlbEntry, NUM_TLB, TLBLO_DIRTY, TLBLO_VALID};
use crate::vm::vm_stats::{VmStat, VmStats};
use crate::{Paddr, Vaddr};

/// Which path a TLB write took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbWrite {
    /// Existing entry for the page updated in place
    Hit(usize),
    /// Unused slot taken
    Free(usize),
    /// Live slot overwritten
    Replaced(usize),
}

impl TlbWrite {
    pub const fn slot(&self) -> usize {
        match *self {
            TlbWrite::Hit(i) | TlbWrite::Free(i) | TlbWrite::Replaced(i) => i,
        }
    }
}

/// Software side of TLB management
#[derive(Debug, Default)]
pub struct TlbSync {
    next_victim: AtomicUsize,
}

impl TlbSync {
    pub const fn new() -> Self {
        Self {
            next_victim: AtomicUsize::new(0),
        }
    }

    fn rr_victim(&self) -> usize {
        self.next_victim.fetch_add(1, Ordering::Relaxed) % NUM_TLB
    }

    /// Map `vaddr` to `paddr`, writable if `writable`
    pub fn write_mapping(
        &self,
        tlb: &Tlb,
        stats: &VmStats,
        vaddr: Vaddr,
        paddr: Paddr,
        writable: bool,
    ) -> TlbWrite {
        let mut lo = paddr | TLBLO_VALID;
        if writable {
            lo |= TLBLO_DIRTY;
        }

        let mut spl = tlb.splhigh();
        if let Some(i) = spl.probe(vaddr) {
            spl.write(vaddr, lo, i);
            return TlbWrite::Hit(i);
        }

        let outcome = match (0..NUM_TLB).find(|&i| !spl.read(i).is_valid()) {
            Some(i) => {
                spl.write(vaddr, lo, i);
                TlbWrite::Free(i)
            }
            None => {
                let i = self.rr_victim();
                spl.write(vaddr, lo, i);
                TlbWrite::Replaced(i)
            }
        };
        drop(spl);

        match outcome {
            TlbWrite::Replaced(_) => stats.inc(VmStat::TlbFaultReplace),
            _ => stats.inc(VmStat::TlbFaultFree),
        }
        crate::vm_trace!("tlb: 0x{:08x} -> 0x{:08x} {:?}", vaddr, paddr, outcome);
        outcome
    }

    /// After an eviction, retarget the slot that mapped `old_vaddr` to
    /// `new_vaddr` at `paddr`
    ///
    /// The new mapping is always writable: the frame is about to be filled.
    /// Returns the slot used, or `None` if `old_vaddr` was not cached.
    pub fn replace_victim(
        &self,
        tlb: &Tlb,
        stats: &VmStats,
        old_vaddr: Vaddr,
        new_vaddr: Vaddr,
        paddr: Paddr,
    ) -> Option<usize> {
        let mut spl = tlb.splhigh();
        let i = spl.probe(old_vaddr)?;
        spl.write(new_vaddr, paddr | TLBLO_DIRTY | TLBLO_VALID, i);
        drop(spl);
        stats.inc(VmStat::TlbFaultFree);
        Some(i)
    }

    /// Drop the translation for `vaddr`, returning the slot it held
    pub fn invalidate_page(&self, tlb: &Tlb, vaddr: Vaddr) -> Option<usize> {
        let mut spl = tlb.splhigh();
        let i = spl.probe(vaddr)?;
        let entry = TlbEntry::invalid(i);
        spl.write(entry.hi, entry.lo, i);
        Some(i)
    }

    /// Invalidate every slot (address-space switch)
    pub fn invalidate_all(&self, tlb: &Tlb, stats: &VmStats) {
        let mut spl = tlb.splhigh();
        for i in 0..NUM_TLB {
            let entry = TlbEntry::invalid(i);
            spl.write(entry.hi, entry.lo, i);
        }
        drop(spl);
        stats.inc(VmStat::TlbInvalid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slots_first() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        assert_eq!(
            sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, false),
            TlbWrite::Free(0)
        );
        assert_eq!(
            sync.write_mapping(&tlb, &stats, 0x40_1000, 0x20_1000, true),
            TlbWrite::Free(1)
        );
        assert_eq!(stats.get(VmStat::TlbFaultFree), 2);
        assert_eq!(tlb.translate(0x40_0010), Some((0x20_0010, false)));
        assert_eq!(tlb.translate(0x40_1010), Some((0x20_1010, true)));
    }

    #[test]
    fn test_hit_updates_in_place_without_counting() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, true);
        assert_eq!(
            sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, false),
            TlbWrite::Hit(0)
        );
        assert_eq!(stats.get(VmStat::TlbFaultFree), 1);
        assert_eq!(tlb.translate(0x40_0000), Some((0x20_0000, false)));
    }

    #[test]
    fn test_round_robin_when_full() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        for i in 0..NUM_TLB as u32 {
            sync.write_mapping(&tlb, &stats, 0x40_0000 + i * 0x1000, 0x20_0000, false);
        }
        assert_eq!(
            sync.write_mapping(&tlb, &stats, 0x60_0000, 0x30_0000, false),
            TlbWrite::Replaced(0)
        );
        assert_eq!(
            sync.write_mapping(&tlb, &stats, 0x60_1000, 0x30_1000, false),
            TlbWrite::Replaced(1)
        );
        assert_eq!(stats.get(VmStat::TlbFaultReplace), 2);
        assert_eq!(tlb.translate(0x40_0000), None);
    }

    #[test]
    fn test_replace_victim() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, false);
        assert_eq!(
            sync.replace_victim(&tlb, &stats, 0x40_0000, 0x40_5000, 0x20_0000),
            Some(0)
        );
        assert_eq!(tlb.translate(0x40_0000), None);
        assert_eq!(tlb.translate(0x40_5000), Some((0x20_0000, true)));
        assert_eq!(sync.replace_victim(&tlb, &stats, 0x41_0000, 0x42_0000, 0), None);
        assert_eq!(stats.get(VmStat::TlbFaultFree), 2);
    }

    #[test]
    fn test_invalidate_all() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, false);
        sync.invalidate_all(&tlb, &stats);
        assert_eq!(tlb.valid_count(), 0);
        assert_eq!(stats.get(VmStat::TlbInvalid), 1);
    }

    #[test]
    fn test_invalidate_page() {
        let (tlb, stats, sync) = (Tlb::new(), VmStats::new(), TlbSync::new());
        sync.write_mapping(&tlb, &stats, 0x40_0000, 0x20_0000, true);
        sync.write_mapping(&tlb, &stats, 0x40_1000, 0x20_1000, true);
        assert_eq!(sync.invalidate_page(&tlb, 0x40_1000), Some(1));
        assert_eq!(tlb.translate(0x40_1000), None);
        assert!(tlb.translate(0x40_0000).is_some());
        assert_eq!(sync.invalidate_page(&tlb, 0x40_1000), None);
    }
}
