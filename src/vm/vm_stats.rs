//! VM Statistics Counters
//!
//! Monotonic counters bumped by the fault path, the TLB code and the swap
//! store. At shutdown the report checks three identities that any correct
//! run satisfies:
//!
//! - TLB faults with free + TLB faults with replace == TLB faults
//! - TLB reloads + page faults (disk) + page faults (zeroed) == TLB faults
//! - page faults from ELF + page faults from swapfile == page faults (disk)

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Identifiers
// ============================================================================

/// Statistic identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmStat {
    TlbFault = 0,
    TlbFaultFree = 1,
    TlbFaultReplace = 2,
    TlbInvalid = 3,
    TlbReload = 4,
    PageFaultZero = 5,
    PageFaultDisk = 6,
    PageFaultElf = 7,
    PageFaultSwap = 8,
    SwapFileWrite = 9,
}

/// Number of statistics
pub const TOT_COUNTERS: usize = 10;

impl VmStat {
    pub const ALL: [VmStat; TOT_COUNTERS] = [
        VmStat::TlbFault,
        VmStat::TlbFaultFree,
        VmStat::TlbFaultReplace,
        VmStat::TlbInvalid,
        VmStat::TlbReload,
        VmStat::PageFaultZero,
        VmStat::PageFaultDisk,
        VmStat::PageFaultElf,
        VmStat::PageFaultSwap,
        VmStat::SwapFileWrite,
    ];

    /// Label used in the report
    pub const fn label(self) -> &'static str {
        match self {
            VmStat::TlbFault => "TLB Faults",
            VmStat::TlbFaultFree => "TLB Faults with Free",
            VmStat::TlbFaultReplace => "TLB Faults with Replace",
            VmStat::TlbInvalid => "TLB Invalidations",
            VmStat::TlbReload => "TLB Reloads",
            VmStat::PageFaultZero => "Page Faults (Zeroed)",
            VmStat::PageFaultDisk => "Page Faults (Disk)",
            VmStat::PageFaultElf => "Page Faults from ELF",
            VmStat::PageFaultSwap => "Page Faults from Swapfile",
            VmStat::SwapFileWrite => "Swapfile Writes",
        }
    }
}

// ============================================================================
// Counter Table
// ============================================================================

/// The statistics table
#[derive(Debug)]
pub struct VmStats {
    counters: [AtomicU64; TOT_COUNTERS],
}

impl VmStats {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            counters: [ZERO; TOT_COUNTERS],
        }
    }

    /// Increment one statistic
    #[inline]
    pub fn inc(&self, stat: VmStat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one statistic
    #[inline]
    pub fn get(&self, stat: VmStat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    /// Reset every statistic to zero
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut values = [0; TOT_COUNTERS];
        for stat in VmStat::ALL {
            values[stat as usize] = self.get(stat);
        }
        StatsSnapshot { values }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Snapshot and Report
// ============================================================================

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    values: [u64; TOT_COUNTERS],
}

/// One consistency identity evaluated on a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsCheck {
    pub lhs_label: &'static str,
    pub rhs_label: &'static str,
    pub lhs: u64,
    pub rhs: u64,
}

impl StatsCheck {
    pub fn holds(&self) -> bool {
        self.lhs == self.rhs
    }
}

impl StatsSnapshot {
    pub fn get(&self, stat: VmStat) -> u64 {
        self.values[stat as usize]
    }

    /// Counter-wise difference from an earlier snapshot
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        let mut values = [0; TOT_COUNTERS];
        for (i, value) in values.iter_mut().enumerate() {
            *value = self.values[i].saturating_sub(earlier.values[i]);
        }
        StatsSnapshot { values }
    }

    /// The three shutdown identities
    pub fn checks(&self) -> heapless::Vec<StatsCheck, 3> {
        let faults = self.get(VmStat::TlbFault);
        let mut checks = heapless::Vec::new();
        let _ = checks.push(StatsCheck {
            lhs_label: "TLB Faults with Free + TLB Faults with Replace",
            rhs_label: "TLB Faults",
            lhs: self.get(VmStat::TlbFaultFree) + self.get(VmStat::TlbFaultReplace),
            rhs: faults,
        });
        let _ = checks.push(StatsCheck {
            lhs_label: "TLB Reloads + Page Faults (Disk) + Page Faults (Zeroed)",
            rhs_label: "TLB Faults",
            lhs: self.get(VmStat::TlbReload)
                + self.get(VmStat::PageFaultDisk)
                + self.get(VmStat::PageFaultZero),
            rhs: faults,
        });
        let _ = checks.push(StatsCheck {
            lhs_label: "Page Faults from ELF + Page Faults from Swapfile",
            rhs_label: "Page Faults (Disk)",
            lhs: self.get(VmStat::PageFaultElf) + self.get(VmStat::PageFaultSwap),
            rhs: self.get(VmStat::PageFaultDisk),
        });
        checks
    }

    /// True if every identity holds
    pub fn is_consistent(&self) -> bool {
        self.checks().iter().all(StatsCheck::holds)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Virtual memory statistics:")?;
        for stat in VmStat::ALL {
            writeln!(f, "VM_STATS {:>30} = {:>10}", stat.label(), self.get(stat))?;
        }
        writeln!(f)?;
        writeln!(f, "Virtual memory checks:")?;
        for check in self.checks() {
            let verdict = if check.holds() { "OK!" } else { "Warning:" };
            let relation = if check.holds() { "=" } else { "!=" };
            writeln!(
                f,
                "{} {} ({}) {} {} ({})",
                verdict, check.lhs_label, check.lhs, relation, check.rhs_label, check.rhs
            )?;
        }
        Ok(())
    }
}
