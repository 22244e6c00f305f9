//! Physical memory
//!
//! RAM of a fixed size whose low part holds the kernel image. Before the
//! coremap exists, pages are handed out by a bump allocator
//! (`ram_stealmem`) that never frees. Once the coremap takes over via
//! `ram_getfirstfree`, stealing is disabled for good.

use alloc::boxed::Box;
use alloc::vec;
use spin::Mutex;

use crate::config::{round_page, PAGE_SIZE};
use crate::Paddr;

/// Boot-time allocator state
#[derive(Debug)]
struct StealState {
    /// First physical address not yet handed out
    firstpaddr: Paddr,
    /// Set once the coremap has claimed the remaining memory
    claimed: bool,
}

/// The machine's physical memory
pub struct PhysicalMemory {
    /// One past the last physical address
    lastpaddr: Paddr,
    steal: Mutex<StealState>,
    bytes: Mutex<Box<[u8]>>,
}

impl PhysicalMemory {
    /// Create `ram_size` bytes of RAM with the kernel image occupying
    /// everything below `kernel_end`
    pub fn new(ram_size: u32, kernel_end: Paddr) -> Self {
        let lastpaddr = ram_size & !(PAGE_SIZE as u32 - 1);
        Self {
            lastpaddr,
            steal: Mutex::new(StealState {
                firstpaddr: round_page(kernel_end).min(lastpaddr),
                claimed: false,
            }),
            bytes: Mutex::new(vec![0u8; lastpaddr as usize].into_boxed_slice()),
        }
    }

    /// Size of RAM (one past the last physical address)
    pub fn ram_getsize(&self) -> Paddr {
        self.lastpaddr
    }

    /// Hand the rest of memory to the coremap, returning its first free
    /// address; `ram_stealmem` fails from now on
    pub fn ram_getfirstfree(&self) -> Paddr {
        let mut steal = self.steal.lock();
        steal.claimed = true;
        steal.firstpaddr
    }

    /// Boot-time page allocation; memory obtained here is never freed
    pub fn ram_stealmem(&self, npages: usize) -> Option<Paddr> {
        let mut steal = self.steal.lock();
        if steal.claimed {
            return None;
        }
        let size = (npages * PAGE_SIZE) as u64;
        if steal.firstpaddr as u64 + size > self.lastpaddr as u64 {
            return None;
        }
        let paddr = steal.firstpaddr;
        steal.firstpaddr += size as u32;
        Some(paddr)
    }

    /// Fill one page with zeroes
    pub fn zero_page(&self, paddr: Paddr) {
        let start = paddr as usize;
        self.bytes.lock()[start..start + PAGE_SIZE].fill(0);
    }

    /// Copy one page out of RAM
    pub fn read_page(&self, paddr: Paddr, page: &mut [u8; PAGE_SIZE]) {
        self.read_bytes(paddr, page);
    }

    /// Copy one page into RAM
    pub fn write_page(&self, paddr: Paddr, page: &[u8; PAGE_SIZE]) {
        self.write_bytes(paddr, page);
    }

    /// Copy bytes out of RAM starting at `paddr`
    pub fn read_bytes(&self, paddr: Paddr, buf: &mut [u8]) {
        let start = paddr as usize;
        buf.copy_from_slice(&self.bytes.lock()[start..start + buf.len()]);
    }

    /// Copy bytes into RAM starting at `paddr`
    pub fn write_bytes(&self, paddr: Paddr, buf: &[u8]) {
        let start = paddr as usize;
        self.bytes.lock()[start..start + buf.len()].copy_from_slice(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealmem_bumps() {
        let ram = PhysicalMemory::new(64 * 1024, 0x2100);
        assert_eq!(ram.ram_getsize(), 0x10000);
        assert_eq!(ram.ram_stealmem(2), Some(0x3000));
        assert_eq!(ram.ram_stealmem(1), Some(0x5000));
        assert_eq!(ram.ram_stealmem(100), None);
    }

    #[test]
    fn test_claim_disables_stealing() {
        let ram = PhysicalMemory::new(64 * 1024, 0x1000);
        assert_eq!(ram.ram_stealmem(1), Some(0x1000));
        assert_eq!(ram.ram_getfirstfree(), 0x2000);
        assert_eq!(ram.ram_stealmem(1), None);
    }

    #[test]
    fn test_page_access() {
        let ram = PhysicalMemory::new(64 * 1024, 0x1000);
        ram.write_bytes(0x2010, b"frame");

        let mut page = [0u8; PAGE_SIZE];
        ram.read_page(0x2000, &mut page);
        assert_eq!(&page[0x10..0x15], b"frame");

        ram.zero_page(0x2000);
        ram.read_page(0x2000, &mut page);
        assert!(page.iter().all(|&b| b == 0));
    }
}
