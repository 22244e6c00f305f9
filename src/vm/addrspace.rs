//! Address Spaces
//!
//! An address space owns its page table, its segment list, the handle of
//! the executable it was loaded from, and its heap bounds. Frames and swap
//! slots refer back to it only through its [`AsId`], so destroying it
//! never leaves a dangling reference: the frames and slots are released
//! first.
//!
//! With demand paging (the default) nothing is loaded before the first
//! fault. Without it, `as_prepare_load` allocates every frame up front and
//! `as_complete_load` reads the whole image in.

use alloc::sync::Arc;
use core::fmt;
use spin::{Mutex, MutexGuard};

use crate::config::{round_page, PAGE_SIZE, USERSTACK};
use crate::kern::error::{VmError, VmResult};
use crate::machine::device::BlockDevice;
use crate::vm::coremap::FrameState;
use crate::vm::loadelf::load_page_from_elf;
use crate::vm::pt::{PageTable, Residency};
use crate::vm::segment::{Permissions, Segment, SegmentList};
use crate::vm::VmSystem;
use crate::Vaddr;

// ============================================================================
// Address Space Identity
// ============================================================================

/// Stable identifier of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsId(pub u64);

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

// ============================================================================
// Address Space
// ============================================================================

pub(crate) struct AsInner {
    pub(crate) page_table: PageTable,
    pub(crate) segments: SegmentList,
    pub(crate) image: Option<Arc<dyn BlockDevice>>,
    pub(crate) heap_start: Vaddr,
    pub(crate) heap_end: Vaddr,
}

/// A process address space
pub struct AddressSpace {
    id: AsId,
    inner: Mutex<AsInner>,
}

impl AddressSpace {
    fn new(id: AsId) -> Self {
        Self {
            id,
            inner: Mutex::new(AsInner {
                page_table: PageTable::new(),
                segments: SegmentList::new(),
                image: None,
                heap_start: 0,
                heap_end: 0,
            }),
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AsInner> {
        self.inner.lock()
    }

    /// Where page `vaddr` currently lives, if it belongs to the address space
    pub fn residency(&self, vaddr: Vaddr) -> Option<Residency> {
        let inner = self.inner.lock();
        let index = inner.page_table.find(vaddr & crate::config::PAGE_FRAME)?;
        inner.page_table.get(index).map(|e| e.residency())
    }

    /// Number of pages currently backed by a frame
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().page_table.resident_count()
    }

    /// Number of page-table entries
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Start and end of the (empty) heap
    pub fn heap_bounds(&self) -> (Vaddr, Vaddr) {
        let inner = self.inner.lock();
        (inner.heap_start, inner.heap_end)
    }

    /// Print the page table
    pub fn dump_page_table(&self) {
        crate::kprint!("{}", self.inner.lock().page_table);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl VmSystem {
    /// Create an empty address space
    pub fn as_create(&self) -> AddressSpace {
        AddressSpace::new(self.next_as_id())
    }

    /// Tear down an address space
    ///
    /// Frames go first, then the page table, swap slots, segments and
    /// finally the image handle.
    pub fn as_destroy(&self, aspace: AddressSpace) {
        let id = aspace.id;
        let mut inner = aspace.inner.lock();
        self.coremap().free_all_for(id);
        inner.page_table.free_chain();
        self.swap().free_all_for(id);
        inner.segments.destroy_chain();
        inner.image = None;
        crate::vm_trace!("as_destroy: {}", id);
    }

    /// Make `aspace` the current address space
    ///
    /// The TLB is not tagged, so every entry is flushed. Kernel threads
    /// without an address space leave it alone.
    pub fn as_activate(&self, aspace: Option<&AddressSpace>) {
        if aspace.is_none() {
            return;
        }
        self.tlb_sync().invalidate_all(self.tlb(), self.stats());
    }

    /// Define the region `[vaddr, vaddr + size)` backed by the image at
    /// `offset`
    ///
    /// The region is widened to whole pages and gets one fresh page-table
    /// entry per page.
    pub fn as_define_region(
        &self,
        aspace: &AddressSpace,
        vaddr: Vaddr,
        offset: u64,
        size: usize,
        permissions: Permissions,
    ) -> VmResult<()> {
        if vaddr as u64 + size as u64 > USERSTACK as u64 {
            return Err(VmError::Fault);
        }
        let mut inner = aspace.inner.lock();
        let first_entry = inner.page_table.len();
        let segment = Segment::new(vaddr, Some(offset), size, permissions, first_entry);
        inner
            .page_table
            .create_run(segment.first_vaddr(), segment.page_count());

        let end = round_page(segment.end() as u32);
        if end > inner.heap_start {
            inner.heap_start = end;
            inner.heap_end = end;
        }
        inner.segments.create(segment);
        Ok(())
    }

    /// Define the user stack, returning the initial stack pointer
    pub fn as_define_stack(&self, aspace: &AddressSpace) -> VmResult<Vaddr> {
        let pages = self.config().stack_pages;
        let base = USERSTACK - (pages * PAGE_SIZE) as u32;

        let mut inner = aspace.inner.lock();
        let first_entry = inner.page_table.create_run(base, pages);
        let segment = Segment::zero_fill(
            base,
            pages,
            Permissions::READ | Permissions::WRITE,
            first_entry,
        );
        let entries = segment.entries();
        inner.segments.create(segment);

        if !self.config().demand_paging {
            for index in entries {
                let paddr = self.claim_frame(aspace.id, &mut inner.page_table, index)?;
                self.ram().zero_page(paddr);
                self.coremap().update_state(paddr, FrameState::Clean);
            }
        }
        Ok(USERSTACK)
    }

    /// Get ready to load the image
    ///
    /// Without demand paging every page gets its frame now; otherwise this
    /// does nothing.
    pub fn as_prepare_load(&self, aspace: &AddressSpace) -> VmResult<()> {
        if self.config().demand_paging {
            return Ok(());
        }
        let mut inner = aspace.inner.lock();
        for index in 0..inner.page_table.len() {
            if let Err(err) = self.claim_frame(aspace.id, &mut inner.page_table, index) {
                self.abandon_loading(aspace.id, &mut inner.page_table);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Attach the executable image the regions were defined from
    ///
    /// Without demand paging the image is read in completely here.
    pub fn as_complete_load(
        &self,
        aspace: &AddressSpace,
        image: Arc<dyn BlockDevice>,
    ) -> VmResult<()> {
        let mut inner = aspace.inner.lock();
        inner.image = Some(image.clone());
        if self.config().demand_paging {
            return Ok(());
        }

        let AsInner {
            page_table,
            segments,
            ..
        } = &mut *inner;
        let loaded = self.load_segments(aspace.id, page_table, segments, &*image);
        if loaded.is_err() {
            self.abandon_loading(aspace.id, page_table);
        }
        loaded
    }

    /// Read every page of every segment into its frame
    fn load_segments(
        &self,
        owner: AsId,
        page_table: &mut PageTable,
        segments: &SegmentList,
        image: &dyn BlockDevice,
    ) -> VmResult<()> {
        for segment in segments.iter() {
            for (n, index) in segment.entries().enumerate() {
                let paddr = self.claim_frame(owner, page_table, index)?;
                let mut page = [0u8; PAGE_SIZE];
                if let Some(chunk) = segment.load_chunk(n + 1) {
                    load_page_from_elf(image, &mut page, chunk)?;
                }
                self.ram().write_page(paddr, &page);
                self.coremap().update_state(paddr, FrameState::Clean);
            }
        }
        Ok(())
    }

    /// Unload every page whose frame was claimed but never filled
    fn abandon_loading(&self, owner: AsId, page_table: &mut PageTable) {
        for index in 0..page_table.len() {
            let Some(entry) = page_table.get(index) else {
                continue;
            };
            let Some(paddr) = entry.frame() else {
                continue;
            };
            if self.coremap().check_state(paddr, FrameState::Loading) {
                let vaddr = entry.vaddr();
                self.abandon_page(owner, page_table, index, vaddr, paddr);
            }
        }
    }

    /// Frame backing entry `index`, allocating one if there is none yet
    fn claim_frame(
        &self,
        owner: AsId,
        page_table: &mut PageTable,
        index: usize,
    ) -> VmResult<crate::Paddr> {
        let entry = page_table.get_mut(index).ok_or(VmError::Fault)?;
        if let Some(paddr) = entry.frame() {
            return Ok(paddr);
        }
        let paddr = self
            .coremap()
            .allocate_user(entry.vaddr(), owner)
            .ok_or(VmError::NoMemory)?;
        entry.set_resident(paddr);
        Ok(paddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::machine::device::{DeviceError, MemDevice};
    use crate::vm::tests::system;
    use crate::vm::vm_stats::VmStat;
    use alloc::vec::Vec;

    fn rx() -> Permissions {
        Permissions::READ | Permissions::EXECUTE
    }

    #[test]
    fn test_define_region() {
        let vm = system(VmConfig::new().with_swap_pages(8));
        let aspace = vm.as_create();
        vm.as_define_region(&aspace, 0x40_0064, 100, 10000, rx())
            .unwrap();
        assert_eq!(aspace.segment_count(), 1);
        assert_eq!(aspace.page_count(), 3);
        assert_eq!(aspace.residency(0x40_2abc), Some(Residency::Unloaded));
        assert_eq!(aspace.residency(0x40_3000), None);
        assert_eq!(aspace.heap_bounds(), (0x40_3000, 0x40_3000));
        assert_eq!(aspace.resident_pages(), 0);
    }

    #[test]
    fn test_define_stack() {
        let vm = system(VmConfig::new().with_swap_pages(8));
        let aspace = vm.as_create();
        assert_eq!(vm.as_define_stack(&aspace), Ok(USERSTACK));
        assert_eq!(aspace.page_count(), 18);
        assert_eq!(aspace.residency(USERSTACK - 4), Some(Residency::Unloaded));
        assert_eq!(
            aspace.residency(USERSTACK - 18 * PAGE_SIZE as u32),
            Some(Residency::Unloaded)
        );
    }

    #[test]
    fn test_region_past_user_space() {
        let vm = system(VmConfig::new().with_swap_pages(8));
        let aspace = vm.as_create();
        assert_eq!(
            vm.as_define_region(&aspace, 0x7fff_f000, 0, 0x2000, rx()),
            Err(VmError::Fault)
        );
    }

    #[test]
    fn test_destroy_releases_frames() {
        let vm = system(VmConfig::new().with_swap_pages(8).with_demand_paging(false));
        let free = vm.coremap().free_count();
        let aspace = vm.as_create();
        let id = aspace.id();
        vm.as_define_region(&aspace, 0x40_0000, 0, 0x3000, rx())
            .unwrap();
        vm.as_prepare_load(&aspace).unwrap();
        vm.as_define_stack(&aspace).unwrap();
        assert_eq!(vm.coremap().owned_by(id), 21);

        vm.as_destroy(aspace);
        assert_eq!(vm.coremap().owned_by(id), 0);
        assert_eq!(vm.coremap().free_count(), free);
    }

    #[test]
    fn test_eager_load() {
        let vm = system(VmConfig::new().with_swap_pages(8).with_demand_paging(false));
        let aspace = vm.as_create();
        vm.as_define_region(&aspace, 0x40_0000, 0, 5000, rx())
            .unwrap();
        vm.as_prepare_load(&aspace).unwrap();
        let bytes: Vec<u8> = (0..5000).map(|i| (i % 199) as u8).collect();
        vm.as_complete_load(&aspace, Arc::new(MemDevice::from_bytes(bytes)))
            .unwrap();

        let Some(Residency::Resident(paddr)) = aspace.residency(0x40_1000) else {
            panic!("page not resident");
        };
        assert!(vm.coremap().check_state(paddr, FrameState::Clean));
        let mut page = [0u8; PAGE_SIZE];
        vm.ram().read_page(paddr, &mut page);
        assert_eq!(page[0], (4096 % 199) as u8);
        assert!(page[5000 - 4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_eager_out_of_memory() {
        let vm = system(
            VmConfig::new()
                .with_swap_pages(8)
                .with_demand_paging(false)
                .with_free_frame_limit(2),
        );
        let aspace = vm.as_create();
        vm.as_define_region(&aspace, 0x40_0000, 0, 0x3000, rx())
            .unwrap();
        assert_eq!(vm.as_prepare_load(&aspace), Err(VmError::NoMemory));
    }

    struct Unreadable;

    impl BlockDevice for Unreadable {
        fn read_at(&self, _: u64, _: &mut [u8]) -> Result<usize, DeviceError> {
            Err(DeviceError::Io { code: 5 })
        }

        fn write_at(&self, _: u64, _: &[u8]) -> Result<usize, DeviceError> {
            Err(DeviceError::ReadOnly)
        }
    }

    #[test]
    fn test_eager_load_failure_releases_frames() {
        let vm = system(VmConfig::new().with_swap_pages(8).with_demand_paging(false));
        let free = vm.coremap().free_count();
        let aspace = vm.as_create();
        vm.as_define_region(&aspace, 0x40_0000, 0, 0x3000, rx())
            .unwrap();
        vm.as_prepare_load(&aspace).unwrap();
        assert_eq!(vm.coremap().owned_by(aspace.id()), 3);

        assert_eq!(
            vm.as_complete_load(&aspace, Arc::new(Unreadable)),
            Err(VmError::ImageRead { offset: 0 })
        );
        assert_eq!(vm.coremap().owned_by(aspace.id()), 0);
        assert_eq!(vm.coremap().free_count(), free);
        assert_eq!(aspace.residency(0x40_1000), Some(Residency::Unloaded));
    }

    #[test]
    fn test_activate_flushes_tlb() {
        let vm = system(VmConfig::new().with_swap_pages(8));
        let aspace = vm.as_create();
        vm.as_activate(None);
        assert_eq!(vm.stats().get(VmStat::TlbInvalid), 0);
        vm.as_activate(Some(&aspace));
        assert_eq!(vm.stats().get(VmStat::TlbInvalid), 1);
    }
}
