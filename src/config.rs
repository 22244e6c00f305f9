//! VM configuration
//!
//! Compile-time constants of the target machine and the tunables a
//! kernel picks at boot.

use crate::Vaddr;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on the target)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-number bits of an address
pub const PAGE_FRAME: u32 = 0xffff_f000;

/// Number of user stack pages (must exceed 64K so ARG_MAX argument blocks fit)
pub const STACK_PAGES: usize = 18;

/// Top of the user stack; the user address space ends here
pub const USERSTACK: Vaddr = 0x8000_0000;

/// Logical name of the swap file
pub const SWAP_FILE_NAME: &str = "emu0:swapfile";

/// Hard upper bound on swap file size in bytes
pub const SWAP_SIZE_LIMIT: usize = 9 * 1024 * 1024;

/// Default swap capacity in pages
pub const SWAP_PAGES: usize = SWAP_SIZE_LIMIT / PAGE_SIZE;

/// Free frames left by the swap-test bootstrap (enough for `palin`)
pub const NUM_FREEFRAMES_TEST: usize = 17;

/// Bytes one coremap entry occupies on the 32-bit target
pub const COREMAP_ENTRY_SIZE: usize = 20;

// ============================================================================
// Page Arithmetic
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u32) -> u32 {
    addr & PAGE_FRAME
}

/// Round address up to page boundary
pub const fn round_page(addr: u32) -> u32 {
    (addr.wrapping_add(PAGE_SIZE as u32 - 1)) & PAGE_FRAME
}

/// Offset of an address inside its page
pub const fn page_offset(addr: u64) -> usize {
    (addr & (PAGE_SIZE as u64 - 1)) as usize
}

// ============================================================================
// Boot Configuration
// ============================================================================

/// Tunables chosen at boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Swap capacity in pages
    pub swap_pages: usize,
    /// Load pages lazily on first fault instead of at exec time
    pub demand_paging: bool,
    /// Leave only this many frames free at bootstrap (swap stress mode)
    pub free_frame_limit: Option<usize>,
    /// Number of pages in each user stack
    pub stack_pages: usize,
}

impl VmConfig {
    pub fn new() -> Self {
        Self {
            swap_pages: SWAP_PAGES,
            demand_paging: true,
            free_frame_limit: None,
            stack_pages: STACK_PAGES,
        }
    }

    pub fn with_swap_pages(mut self, pages: usize) -> Self {
        self.swap_pages = pages;
        self
    }

    pub fn with_demand_paging(mut self, enabled: bool) -> Self {
        self.demand_paging = enabled;
        self
    }

    pub fn with_free_frame_limit(mut self, frames: usize) -> Self {
        self.free_frame_limit = Some(frames);
        self
    }

    pub fn with_stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
