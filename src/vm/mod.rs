//! Demand-paged virtual memory
//!
//! ## Components
//!
//! - [`coremap`]: physical frame table, allocation and victim selection
//! - [`pt`]: per-process page tables
//! - [`segment`]: per-process region descriptors and partial-page arithmetic
//! - [`swap`]: the swap store
//! - [`tlb`]: keeps the hardware TLB in step with the page tables
//! - [`vm_fault`]: the fault handler tying the above together
//! - [`addrspace`]: address-space lifecycle
//! - [`vm_stats`]: statistics counters
//!
//! [`VmSystem`] owns every shared table; nothing in this module is a
//! global. Lock order is address space, then coremap, then swap; the
//! TLB is only ever taken on its own. Device I/O happens with at most the
//! address-space lock held.

pub mod addrspace;
pub mod coremap;
pub mod loadelf;
pub mod pt;
pub mod segment;
pub mod swap;
pub mod tlb;
pub mod vm_fault;
pub mod vm_stats;

pub use addrspace::{AddressSpace, AsId};
pub use coremap::{Coremap, FrameState};
pub use segment::Permissions;
pub use swap::SwapStore;
pub use vm_fault::FaultType;
pub use vm_stats::{StatsSnapshot, VmStat, VmStats};

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::VmConfig;
use crate::kern::error::KernelPanic;
use crate::machine::device::{BlockDevice, DeviceError};
use crate::machine::{PhysicalMemory, Tlb};
use self::tlb::TlbSync;

/// The virtual memory subsystem of one machine
pub struct VmSystem {
    config: VmConfig,
    ram: PhysicalMemory,
    tlb: Tlb,
    tlb_sync: TlbSync,
    coremap: Coremap,
    swap: SwapStore,
    stats: VmStats,
    next_as_id: AtomicU64,
}

impl VmSystem {
    /// Create the subsystem over `ram`; nothing is managed until
    /// [`VmSystem::vm_bootstrap`]
    pub fn new(config: VmConfig, ram: PhysicalMemory) -> Self {
        Self {
            config,
            ram,
            tlb: Tlb::new(),
            tlb_sync: TlbSync::new(),
            coremap: Coremap::new(),
            swap: SwapStore::new(),
            stats: VmStats::new(),
            next_as_id: AtomicU64::new(1),
        }
    }

    /// Take over physical memory and open the swap file
    ///
    /// With a free-frame limit configured, all but that many frames are
    /// pinned so that processes page against a tiny pool.
    pub fn vm_bootstrap<F>(&self, open_swap: F) -> Result<(), KernelPanic>
    where
        F: FnOnce(&str) -> Result<Arc<dyn BlockDevice>, DeviceError>,
    {
        let lastpaddr = self.ram.ram_getsize();
        let firstpaddr = self.ram.ram_getfirstfree();
        match self.config.free_frame_limit {
            Some(frames) => self
                .coremap
                .bootstrap_constrained(lastpaddr, firstpaddr, frames)?,
            None => self.coremap.bootstrap(lastpaddr, firstpaddr)?,
        }
        self.swap.bootstrap(self.config.swap_pages, open_swap)?;

        crate::kprintln!(
            "{}: {} frames, {} free, {} swap pages",
            crate::NAME,
            self.coremap.frame_count(),
            self.coremap.free_count(),
            self.swap.capacity()
        );
        Ok(())
    }

    /// Print the statistics report and release the swap store and the
    /// coremap, returning the final counters
    pub fn vm_shutdown(&self) -> StatsSnapshot {
        let snapshot = self.stats.snapshot();
        crate::kprint!("{}", snapshot);
        self.swap.shutdown();
        self.coremap.shutdown();
        snapshot
    }

    pub(crate) fn next_as_id(&self) -> AsId {
        AsId(self.next_as_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn ram(&self) -> &PhysicalMemory {
        &self.ram
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn coremap(&self) -> &Coremap {
        &self.coremap
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub(crate) fn tlb_sync(&self) -> &TlbSync {
        &self.tlb_sync
    }
}
