//! Coremap - Physical Frame Table
//!
//! One entry per physical frame between the first free address at boot and
//! the top of RAM. The coremap is the only source of truth for which frame
//! backs what; every scan-then-mark sequence runs under its lock, and no
//! device I/O ever happens while the lock is held.
//!
//! ## Frame States
//!
//! - **Free**: unused
//! - **Fixed**: kernel memory, never evicted, never owned by a process
//! - **Loading**: being filled by a fault (from the image, swap, or zero);
//!   not evictable
//! - **Clean**: resident user page, evictable
//!
//! User frames go `Free -> Loading -> Clean`, back to `Loading` when they
//! are evicted and reused, and `Free` when their address space dies.
//! Kernel frames go `Free -> Fixed -> Free`.
//!
//! ## Eviction
//!
//! Every (re)allocation stamps the frame with a global counter. The victim
//! is the evictable frame of the faulting address space with the smallest
//! stamp; ties go to the lowest frame index. Stamps are not refreshed on
//! access, so this approximates FIFO rather than LRU.

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{COREMAP_ENTRY_SIZE, PAGE_SIZE};
use crate::kern::error::KernelPanic;
use crate::machine::{paddr_to_kvaddr, MIPS_KSEG0};
use crate::vm::addrspace::AsId;
use crate::{Paddr, Vaddr};

// ============================================================================
// Frame Entry
// ============================================================================

/// Frame state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Fixed,
    Loading,
    Clean,
}

/// One coremap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Owning address space (meaningless when free)
    pub owner: Option<AsId>,
    /// Virtual page mapped to this frame
    pub vaddr: Vaddr,
    pub state: FrameState,
    /// Frames in the kernel allocation starting here (1 for user frames)
    pub run_length: usize,
    /// Allocation order stamp; `None` while free
    pub timestamp: Option<u64>,
}

impl FrameEntry {
    const fn free() -> Self {
        Self {
            owner: None,
            vaddr: 0,
            state: FrameState::Free,
            run_length: 0,
            timestamp: None,
        }
    }

    fn release(&mut self) {
        *self = Self::free();
    }

    /// Can be chosen as an eviction victim for `owner`
    fn evictable_by(&self, owner: AsId) -> bool {
        self.owner == Some(owner)
            && self.state != FrameState::Fixed
            && self.state != FrameState::Loading
    }
}

/// A frame chosen for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    /// Virtual page that lived in the frame
    pub vaddr: Vaddr,
    /// Physical address of the frame
    pub paddr: Paddr,
    /// Coremap index of the frame
    pub index: usize,
}

// ============================================================================
// Coremap
// ============================================================================

struct CoremapInner {
    frames: Vec<FrameEntry>,
    firstpaddr: Paddr,
    timestamp: u64,
    bootstrapped: bool,
}

impl CoremapInner {
    fn paddr_of(&self, index: usize) -> Paddr {
        self.firstpaddr + (index * PAGE_SIZE) as u32
    }

    fn index_of(&self, paddr: Paddr) -> Option<usize> {
        if !self.bootstrapped || paddr < self.firstpaddr {
            return None;
        }
        let index = (paddr - self.firstpaddr) as usize / PAGE_SIZE;
        (index < self.frames.len()).then_some(index)
    }

    fn next_stamp(&mut self) -> u64 {
        let stamp = self.timestamp;
        self.timestamp += 1;
        stamp
    }
}

/// The physical frame table
pub struct Coremap {
    inner: Mutex<CoremapInner>,
}

impl Coremap {
    /// Create an empty, not yet bootstrapped coremap
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(CoremapInner {
                frames: Vec::new(),
                firstpaddr: 0,
                timestamp: 0,
                bootstrapped: false,
            }),
        }
    }

    /// Take over physical memory from `firstpaddr` to `lastpaddr`
    ///
    /// The table itself lives in the memory it describes, so the frames
    /// covering it start out `Fixed`.
    pub fn bootstrap(&self, lastpaddr: Paddr, firstpaddr: Paddr) -> Result<(), KernelPanic> {
        let nframes = Self::frame_count_for(lastpaddr, firstpaddr)?;
        let space = nframes * COREMAP_ENTRY_SIZE;

        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.frames.resize(nframes, FrameEntry::free());
        inner.firstpaddr = firstpaddr;
        inner.timestamp = 0;
        for i in 0..nframes {
            if i <= space / PAGE_SIZE {
                let stamp = inner.next_stamp();
                let frame = &mut inner.frames[i];
                frame.state = FrameState::Fixed;
                frame.timestamp = Some(stamp);
            }
        }
        inner.bootstrapped = true;
        Ok(())
    }

    /// Swap-stress bootstrap: every frame but the last `free_frames`
    /// starts out `Fixed`, so processes must page against a tiny pool
    pub fn bootstrap_constrained(
        &self,
        lastpaddr: Paddr,
        firstpaddr: Paddr,
        free_frames: usize,
    ) -> Result<(), KernelPanic> {
        let nframes = Self::frame_count_for(lastpaddr, firstpaddr)?;

        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.frames.resize(nframes, FrameEntry::free());
        inner.firstpaddr = firstpaddr;
        inner.timestamp = 0;
        for i in 0..nframes {
            let stamp = inner.next_stamp();
            let frame = &mut inner.frames[i];
            frame.state = FrameState::Fixed;
            frame.timestamp = Some(stamp);
        }
        for frame in inner.frames.iter_mut().skip(nframes.saturating_sub(free_frames)) {
            frame.state = FrameState::Free;
            frame.timestamp = None;
        }
        inner.bootstrapped = true;
        Ok(())
    }

    fn frame_count_for(lastpaddr: Paddr, firstpaddr: Paddr) -> Result<usize, KernelPanic> {
        if firstpaddr >= lastpaddr {
            return Err(KernelPanic::BootstrapOom);
        }
        Ok((lastpaddr - firstpaddr) as usize / PAGE_SIZE)
    }

    /// Whether `bootstrap` has run
    pub fn is_bootstrapped(&self) -> bool {
        self.inner.lock().bootstrapped
    }

    /// Allocate `nframes` contiguous frames for the kernel
    ///
    /// First fit over the frame array. The frames become `Fixed`; the run
    /// length is recorded on the first one. Returns the physical base.
    pub fn alloc_contiguous(&self, nframes: usize) -> Option<Paddr> {
        if nframes == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        if !inner.bootstrapped {
            return None;
        }

        let mut first = 0;
        let mut found = false;
        for i in 0..inner.frames.len() {
            if inner.frames[i].state == FrameState::Free {
                if i == 0 || inner.frames[i - 1].state != FrameState::Free {
                    first = i;
                }
                if i - first + 1 >= nframes {
                    found = true;
                    break;
                }
            }
        }
        if !found {
            return None;
        }

        let stamp = inner.timestamp;
        for i in first..first + nframes {
            let kvaddr = paddr_to_kvaddr(inner.paddr_of(i));
            let frame = &mut inner.frames[i];
            frame.run_length = if i == first { nframes } else { 0 };
            frame.state = FrameState::Fixed;
            frame.owner = None;
            frame.vaddr = kvaddr;
            frame.timestamp = Some(stamp);
        }
        inner.timestamp += 1;
        Some(inner.paddr_of(first))
    }

    /// Allocate one frame for user page `vaddr` of `owner`
    ///
    /// The frame starts out `Loading`; the caller marks it `Clean` once its
    /// contents are in place. `None` means memory is full and the caller
    /// has to evict.
    pub fn allocate_user(&self, vaddr: Vaddr, owner: AsId) -> Option<Paddr> {
        let mut inner = self.inner.lock();
        let index = inner
            .frames
            .iter()
            .position(|f| f.state == FrameState::Free)?;
        let stamp = inner.next_stamp();
        let frame = &mut inner.frames[index];
        frame.state = FrameState::Loading;
        frame.run_length = 1;
        frame.owner = Some(owner);
        frame.vaddr = vaddr;
        frame.timestamp = Some(stamp);
        Some(inner.paddr_of(index))
    }

    /// Free the kernel allocation starting at kernel address `kvaddr`
    ///
    /// Returns `Ok(false)` without doing anything before bootstrap (memory
    /// stolen at boot is never returned).
    pub fn free_kernel(&self, kvaddr: Vaddr) -> Result<bool, KernelPanic> {
        let mut inner = self.inner.lock();
        if !inner.bootstrapped {
            return Ok(false);
        }
        let pos = inner
            .index_of(kvaddr.wrapping_sub(MIPS_KSEG0))
            .ok_or(KernelPanic::BadKernelFree { vaddr: kvaddr })?;
        let npages = inner.frames[pos].run_length;
        let end = (pos + npages).min(inner.frames.len());
        for frame in &mut inner.frames[pos..end] {
            frame.release();
        }
        Ok(true)
    }

    /// Free every non-kernel frame owned by `owner`
    pub fn free_all_for(&self, owner: AsId) {
        let mut inner = self.inner.lock();
        for frame in inner.frames.iter_mut() {
            if frame.owner == Some(owner) && frame.state != FrameState::Fixed {
                frame.release();
            }
        }
    }

    /// Free the single user frame at `paddr` if `owner` holds it
    ///
    /// Used to back out of a page-in that failed after the frame was
    /// taken. Returns whether a frame was released.
    pub fn free_frame(&self, paddr: Paddr, owner: AsId) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner.index_of(paddr) else {
            return false;
        };
        let frame = &mut inner.frames[index];
        if frame.owner != Some(owner) || frame.state == FrameState::Fixed {
            return false;
        }
        frame.release();
        true
    }

    /// Pick the oldest evictable frame of `owner` and detach it
    ///
    /// The victim is left `Loading` with no owner: it is mid-eviction and
    /// nobody else can claim it until [`Coremap::reassign`].
    /// Finding no candidate is fatal: the address space has nothing left
    /// to give up.
    pub fn select_victim(&self, owner: AsId) -> Result<Victim, KernelPanic> {
        let mut inner = self.inner.lock();

        let mut best: Option<(usize, u64)> = None;
        for (i, frame) in inner.frames.iter().enumerate() {
            if !frame.evictable_by(owner) {
                continue;
            }
            let stamp = frame.timestamp.unwrap_or(u64::MAX);
            if best.map_or(true, |(_, min)| stamp < min) {
                best = Some((i, stamp));
            }
        }
        let (index, _) = best.ok_or(KernelPanic::NoVictim { owner: owner.0 })?;

        let paddr = inner.paddr_of(index);
        let frame = &mut inner.frames[index];
        let vaddr = frame.vaddr;
        frame.owner = None;
        frame.state = FrameState::Loading;
        frame.run_length = 0;
        frame.vaddr = 0;
        frame.timestamp = None;

        Ok(Victim {
            vaddr,
            paddr,
            index,
        })
    }

    /// Give an evicted frame to page `vaddr` of `owner`
    pub fn reassign(&self, owner: AsId, index: usize, vaddr: Vaddr) {
        let mut inner = self.inner.lock();
        debug_assert!(index < inner.frames.len());
        let stamp = inner.next_stamp();
        let frame = &mut inner.frames[index];
        frame.state = FrameState::Loading;
        frame.owner = Some(owner);
        frame.vaddr = vaddr;
        frame.timestamp = Some(stamp);
        frame.run_length = 1;
    }

    /// Whether the frame at `paddr` is in `state`
    pub fn check_state(&self, paddr: Paddr, state: FrameState) -> bool {
        self.state_of(paddr) == Some(state)
    }

    /// State of the frame at `paddr`
    pub fn state_of(&self, paddr: Paddr) -> Option<FrameState> {
        let inner = self.inner.lock();
        let index = inner.index_of(paddr)?;
        Some(inner.frames[index].state)
    }

    /// Set the state of the frame at `paddr`
    pub fn update_state(&self, paddr: Paddr, state: FrameState) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.index_of(paddr) {
            inner.frames[index].state = state;
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of frames under management
    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Number of free frames
    pub fn free_count(&self) -> usize {
        self.count_where(|f| f.state == FrameState::Free)
    }

    /// Number of frames owned by `owner`
    pub fn owned_by(&self, owner: AsId) -> usize {
        self.count_where(|f| f.owner == Some(owner))
    }

    fn count_where(&self, pred: impl Fn(&FrameEntry) -> bool) -> usize {
        self.inner.lock().frames.iter().filter(|f| pred(f)).count()
    }

    /// Copy of entry `index`
    pub fn entry(&self, index: usize) -> Option<FrameEntry> {
        self.inner.lock().frames.get(index).copied()
    }

    /// Copy of the entry for the frame at `paddr`
    pub fn entry_at(&self, paddr: Paddr) -> Option<FrameEntry> {
        let inner = self.inner.lock();
        inner.index_of(paddr).map(|i| inner.frames[i])
    }

    /// Physical address of frame `index`
    pub fn paddr_of(&self, index: usize) -> Paddr {
        self.inner.lock().paddr_of(index)
    }

    /// Print state and stamp of the first `limit` frames
    pub fn dump(&self, caller: &str, limit: usize) {
        let inner = self.inner.lock();
        crate::kprintln!("caller: {}", caller);
        for frame in inner.frames.iter().take(limit) {
            match frame.timestamp {
                Some(t) => crate::kprintln!("[s: {:?} - t: {}]", frame.state, t),
                None => crate::kprintln!("[s: {:?} - t: -]", frame.state),
            }
        }
        crate::kprintln!("end");
    }

    /// Release the table
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.frames = Vec::new();
        inner.bootstrapped = false;
    }
}

impl Default for Coremap {
    fn default() -> Self {
        Self::new()
    }
}
