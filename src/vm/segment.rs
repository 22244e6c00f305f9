//! Segment Descriptors
//!
//! A segment is a page-aligned, contiguous region of an address space with
//! uniform permissions: code, data, or the stack. File-backed segments
//! remember where their content starts in the executable image; the stack
//! has no backing content and is always zero-filled.
//!
//! ## Partial Pages
//!
//! Neither the image offset nor the segment size has to be page-aligned,
//! so the first and last page of a segment may be short. For page `i`
//! (1-based) of `n`, with `mis = file_offset % PAGE_SIZE`:
//!
//! - size < one page: the whole size
//! - i == 1: `PAGE_SIZE - mis`, placed `mis` bytes into the frame
//! - i == n: `PAGE_SIZE - ((n * PAGE_SIZE - size) - mis)`
//! - otherwise: a full page
//!
//! Page 1 is read at the exact image offset; later pages are read at
//! `file_offset + (i - 1) * PAGE_SIZE` rounded down to a page boundary.

use alloc::vec::Vec;
use core::ops::Range;

use crate::config::{round_page, trunc_page, PAGE_SIZE};
use crate::Vaddr;

// ============================================================================
// Permissions
// ============================================================================

/// Access permissions of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u32);

impl Permissions {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);

    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        let mut bits = 0;
        if read {
            bits |= Self::READ.0;
        }
        if write {
            bits |= Self::WRITE.0;
        }
        if execute {
            bits |= Self::EXECUTE.0;
        }
        Self(bits)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Segment
// ============================================================================

/// One image read needed to fill a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadChunk {
    /// Byte offset in the image
    pub file_offset: u64,
    /// Bytes to read
    pub size: usize,
    /// Where the bytes land inside the frame
    pub dest_offset: usize,
}

/// A segment descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    first_vaddr: Vaddr,
    page_count: usize,
    exact_size: usize,
    /// Image offset of the content; `None` for zero-filled segments
    file_offset: Option<u64>,
    permissions: Permissions,
    /// Index of this segment's first page-table entry
    first_entry: usize,
}

impl Segment {
    /// Describe the region `[vaddr, vaddr + size)`, widened to whole pages
    pub fn new(
        vaddr: Vaddr,
        file_offset: Option<u64>,
        size: usize,
        permissions: Permissions,
        first_entry: usize,
    ) -> Self {
        let aligned = size as u32 + (vaddr - trunc_page(vaddr));
        let page_count = round_page(aligned) as usize / PAGE_SIZE;
        Self {
            first_vaddr: trunc_page(vaddr),
            page_count,
            exact_size: size,
            file_offset,
            permissions,
            first_entry,
        }
    }

    /// Describe a zero-filled region of `page_count` whole pages
    pub fn zero_fill(
        vaddr: Vaddr,
        page_count: usize,
        permissions: Permissions,
        first_entry: usize,
    ) -> Self {
        Self {
            first_vaddr: trunc_page(vaddr),
            page_count,
            exact_size: 0,
            file_offset: None,
            permissions,
            first_entry,
        }
    }

    pub const fn first_vaddr(&self) -> Vaddr {
        self.first_vaddr
    }

    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    pub const fn exact_size(&self) -> usize {
        self.exact_size
    }

    pub const fn file_offset(&self) -> Option<u64> {
        self.file_offset
    }

    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// One past the last address of the segment
    pub fn end(&self) -> u64 {
        self.first_vaddr as u64 + (self.page_count * PAGE_SIZE) as u64
    }

    /// Whether `vaddr` falls inside the segment
    pub fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.first_vaddr && (vaddr as u64) < self.end()
    }

    /// Page-table indices of the segment's entries
    pub fn entries(&self) -> Range<usize> {
        self.first_entry..self.first_entry + self.page_count
    }

    /// True if pages are zero-filled rather than read from the image
    pub const fn is_zero_fill(&self) -> bool {
        self.file_offset.is_none()
    }

    /// 1-based index of the page holding `vaddr`
    pub fn page_index(&self, vaddr: Vaddr) -> usize {
        (trunc_page(vaddr) - self.first_vaddr) as usize / PAGE_SIZE + 1
    }

    /// Number of bytes to load into page `i` (1-based)
    pub fn load_size(&self, i: usize) -> usize {
        let Some(offset) = self.file_offset else {
            return 0;
        };
        let misalign = (offset % PAGE_SIZE as u64) as i64;
        let page = PAGE_SIZE as i64;

        let size = if self.exact_size < PAGE_SIZE {
            self.exact_size as i64
        } else if i == 1 {
            page - misalign
        } else if i == self.page_count {
            let slack = (self.page_count * PAGE_SIZE) as i64 - self.exact_size as i64;
            page - (slack - misalign)
        } else {
            page
        };
        size.clamp(0, page) as usize
    }

    /// Image offset that page `i` (1-based) is read from
    pub fn load_offset(&self, i: usize) -> u64 {
        let Some(offset) = self.file_offset else {
            return 0;
        };
        let at = offset + ((i - 1) * PAGE_SIZE) as u64;
        if i == 1 {
            at
        } else {
            at & !(PAGE_SIZE as u64 - 1)
        }
    }

    /// The image read that fills page `i` (1-based), if any
    pub fn load_chunk(&self, i: usize) -> Option<LoadChunk> {
        let offset = self.file_offset?;
        let dest_offset = if i == 1 {
            (offset % PAGE_SIZE as u64) as usize
        } else {
            0
        };
        Some(LoadChunk {
            file_offset: self.load_offset(i),
            size: self.load_size(i).min(PAGE_SIZE - dest_offset),
            dest_offset,
        })
    }
}

// ============================================================================
// Segment List
// ============================================================================

/// The segments of one address space
///
/// Lookups go newest-first, so a later definition shadows an earlier one
/// where they overlap.
#[derive(Debug, Default)]
pub struct SegmentList {
    segments: Vec<Segment>,
}

impl SegmentList {
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Add a segment in front of the existing ones
    pub fn create(&mut self, segment: Segment) -> &Segment {
        self.segments.push(segment);
        &self.segments[self.segments.len() - 1]
    }

    /// The segment containing `vaddr`
    pub fn find(&self, vaddr: Vaddr) -> Option<&Segment> {
        self.segments.iter().rev().find(|s| s.contains(vaddr))
    }

    /// Segments, newest first
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().rev()
    }

    /// Drop every segment
    pub fn destroy_chain(&mut self) {
        self.segments = Vec::new();
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
