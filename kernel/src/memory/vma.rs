// kernel/src/memory/vma.rs
//
// Virtual Memory Areas: which virtual ranges a process may touch, and
// how.  The fault dispatcher uses them to tell legitimate faults (first
// touch, copy-on-write) from invalid ones (kill the process).
//
// Design:
//   - One ordered map per address space, keyed by start address
//   - Regions never overlap; lookups are a single `range(..=addr)` probe
//   - A VMA says what is *allowed*; the page table says what is *mapped*

use alloc::{collections::BTreeMap, vec::Vec};

use bitflags::bitflags;
use thiserror::Error;
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

use super::{page_fault::FaultKind, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Maximum VMAs per address space (code + stack + heap + mmaps).
pub const MAX_VMAS: usize = 64;

// ============================================================================
// VMA types
// ============================================================================

bitflags! {
    /// Access a region declares, independent of what is currently mapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmaFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// What kind of backing does this region have?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Zero-filled on first touch (stack, heap, anonymous mmap, and the
    /// frames an image loader installs eagerly).
    Anonymous,
}

impl VmaKind {
    /// Whether fork shares this region's frames copy-on-write.
    pub fn is_shareable(self) -> bool {
        match self {
            VmaKind::Anonymous => true,
        }
    }
}

/// Errors reported while editing the VMA set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmaError {
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("empty region")]
    Empty,
    #[error("region end overflows the canonical address space")]
    OutOfRange,
    #[error("region overlaps an existing VMA")]
    Overlap,
    #[error("range is not fully covered by VMAs")]
    NotMapped,
    #[error("VMA list full")]
    Full,
}

/// A single virtual memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    /// Page-aligned start address.
    pub start: VirtAddr,
    /// Number of 4 KiB pages in this region.
    pub pages: u64,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

impl Vma {
    /// Validated constructor.
    pub fn new(
        start: VirtAddr,
        pages: u64,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> Result<Self, VmaError> {
        let vma = Self { start, pages, flags, kind };
        region_end(start, pages)?;
        Ok(vma)
    }

    /// Exclusive end address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.as_u64() + self.pages * PAGE_SIZE as u64
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr.as_u64() < self.end()
    }

    /// Whether the region's declared access allows `kind`.
    pub fn permits(&self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::Read => self.flags.contains(VmaFlags::READ),
            FaultKind::Write => self.flags.contains(VmaFlags::WRITE),
            FaultKind::Fetch => self.flags.contains(VmaFlags::EXEC),
        }
    }

    /// Entry flags for a page this region owns exclusively.
    ///
    /// Shared pages must drop WRITABLE on top of this.
    pub fn page_table_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if self.flags.contains(VmaFlags::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.flags.contains(VmaFlags::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }

    /// The part of this VMA inside `[start, end)`, if any.
    fn clip(&self, start: u64, end: u64) -> Option<Vma> {
        let lo = start.max(self.start.as_u64());
        let hi = end.min(self.end());
        (lo < hi).then(|| Vma {
            start: VirtAddr::new(lo),
            pages: (hi - lo) / PAGE_SIZE as u64,
            ..*self
        })
    }
}

/// Checks alignment and size of `[start, start + pages * 4 KiB)` and
/// returns the exclusive end.
pub fn region_end(start: VirtAddr, pages: u64) -> Result<u64, VmaError> {
    if !start.is_aligned(PAGE_SIZE as u64) {
        return Err(VmaError::Unaligned(start.as_u64()));
    }
    if pages == 0 {
        return Err(VmaError::Empty);
    }
    let end = pages
        .checked_mul(PAGE_SIZE as u64)
        .and_then(|len| start.as_u64().checked_add(len))
        .ok_or(VmaError::OutOfRange)?;
    // The last byte must be canonical and on the same half as `start`.
    let last = VirtAddr::try_new(end - 1).map_err(|_| VmaError::OutOfRange)?;
    if (last.as_u64() >> 47) != (start.as_u64() >> 47) {
        return Err(VmaError::OutOfRange);
    }
    Ok(end)
}

// ============================================================================
// Per-address-space VMA list
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct VmaList {
    entries: BTreeMap<VirtAddr, Vma>,
}

impl VmaList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VMA.  Fails if it overlaps another one or the list is full.
    pub fn add(&mut self, vma: Vma) -> Result<(), VmaError> {
        let end = region_end(vma.start, vma.pages)?;
        if self.entries.len() >= MAX_VMAS {
            return Err(VmaError::Full);
        }
        if self.overlapping(vma.start.as_u64(), end).next().is_some() {
            return Err(VmaError::Overlap);
        }
        self.entries.insert(vma.start, vma);
        Ok(())
    }

    /// Find the VMA containing `addr`, if any.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Removes every VMA piece inside `[start, end)`, splitting regions that
    /// straddle the boundaries.  Returns the removed pieces in address order.
    /// Fails without touching the list if the split would exceed `MAX_VMAS`.
    pub fn remove_range(&mut self, start: u64, end: u64) -> Result<Vec<Vma>, VmaError> {
        if self.len_after_cut(start, end) > MAX_VMAS {
            return Err(VmaError::Full);
        }
        let hit: Vec<Vma> = self.overlapping(start, end).copied().collect();
        let mut removed = Vec::with_capacity(hit.len());
        for vma in hit {
            self.entries.remove(&vma.start);
            if let Some(head) = vma.clip(vma.start.as_u64(), start) {
                self.entries.insert(head.start, head);
            }
            if let Some(tail) = vma.clip(end, vma.end()) {
                self.entries.insert(tail.start, tail);
            }
            removed.extend(vma.clip(start, end));
        }
        Ok(removed)
    }

    /// Rewrites the flags of `[start, end)`, splitting at the boundaries.
    /// The range must be fully covered; on error nothing changes.
    pub fn protect_range(
        &mut self,
        start: u64,
        end: u64,
        flags: VmaFlags,
    ) -> Result<(), VmaError> {
        if !self.covers(start, end) {
            return Err(VmaError::NotMapped);
        }
        let pieces = self.overlapping(start, end).count();
        if self.len_after_cut(start, end) + pieces > MAX_VMAS {
            return Err(VmaError::Full);
        }
        for piece in self.remove_range(start, end)? {
            self.entries.insert(piece.start, Vma { flags, ..piece });
        }
        Ok(())
    }

    /// Whether `[start, end)` has no holes.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for vma in self.overlapping(start, end) {
            if vma.start.as_u64() > cursor {
                return false;
            }
            cursor = vma.end();
        }
        cursor >= end
    }

    /// Remove all VMAs (for process exit).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterator over registered VMAs in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Debug: print all VMAs.
    pub fn dump(&self, label: u64) {
        crate::serial_println!("VMAs for address space {}:", label);
        for vma in self.iter() {
            let kind_str = match vma.kind {
                VmaKind::Anonymous => "anon",
            };
            crate::serial_println!(
                "  {:#x}..{:#x} ({} pages) [{}] {:?}",
                vma.start.as_u64(),
                vma.end(),
                vma.pages,
                kind_str,
                vma.flags,
            );
        }
    }

    fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &Vma> {
        // The VMA containing `start` may begin before it.
        let first = self
            .find_start_before(start)
            .unwrap_or(VirtAddr::zero());
        self.entries
            .range(first..)
            .map(|(_, vma)| vma)
            .take_while(move |vma| vma.start.as_u64() < end)
            .filter(move |vma| vma.end() > start)
    }

    /// Number of VMAs left once `[start, end)` is cut out of the list.
    fn len_after_cut(&self, start: u64, end: u64) -> usize {
        self.overlapping(start, end).fold(self.entries.len(), |len, vma| {
            let head = vma.start.as_u64() < start;
            let tail = vma.end() > end;
            len - 1 + usize::from(head) + usize::from(tail)
        })
    }

    fn find_start_before(&self, addr: u64) -> Option<VirtAddr> {
        let probe = VirtAddr::try_new(addr).ok()?;
        self.entries.range(..=probe).next_back().map(|(start, _)| *start)
    }
}
