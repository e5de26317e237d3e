// kernel/src/memory/page_table.rs
//
// Per-address-space page table.
//
// Leaf entries only: virtual page → (frame, flags).  The entry flags use the
// x86-64 PTE layout so the bits mean the same thing the MMU would see:
//
//   PRESENT          mapping exists (and is readable)
//   WRITABLE         stores allowed; never set while the frame is shared
//   USER_ACCESSIBLE  ring 3 may touch it
//   NO_EXECUTE       instruction fetches fault
//
// The table never touches reference counts; callers that install or drop an
// entry own the matching incref/decref.

use alloc::collections::BTreeMap;
use core::ops::RangeBounds;

use thiserror::Error;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB};

use super::page_fault::FaultKind;

/// Errors reported by page-table edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// The page already has an entry.
    #[error("page {0:#x} is already mapped")]
    AlreadyMapped(u64),
    /// The page has no entry.
    #[error("page {0:#x} is not mapped")]
    NotMapped(u64),
    /// Leaf entries must carry PRESENT.
    #[error("mapping flags {0:?} lack PRESENT")]
    InvalidFlags(PageTableFlags),
}

/// One leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysFrame,
    pub flags: PageTableFlags,
}

impl Mapping {
    pub fn new(frame: PhysFrame, flags: PageTableFlags) -> Self {
        Self { frame, flags }
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageTableFlags::WRITABLE)
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        !self.flags.contains(PageTableFlags::NO_EXECUTE)
    }

    /// Same binding with the write bit cleared.
    pub fn read_only(self) -> Self {
        let mut flags = self.flags;
        flags.remove(PageTableFlags::WRITABLE);
        Self { flags, ..self }
    }

    /// Whether the hardware would let an access of `kind` through.
    pub fn permits(&self, kind: FaultKind) -> bool {
        if !self.flags.contains(PageTableFlags::PRESENT) {
            return false;
        }
        match kind {
            FaultKind::Read => true,
            FaultKind::Write => self.is_writable(),
            FaultKind::Fetch => self.is_executable(),
        }
    }
}

/// Leaf page table of one address space.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<Page<Size4KiB>, Mapping>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new entry; the page must be unmapped.
    pub fn map(&mut self, page: Page, mapping: Mapping) -> Result<(), MapError> {
        check_flags(mapping.flags)?;
        if self.entries.contains_key(&page) {
            return Err(MapError::AlreadyMapped(page.start_address().as_u64()));
        }
        self.entries.insert(page, mapping);
        Ok(())
    }

    /// Replaces an existing entry and returns the previous one.
    pub fn remap(&mut self, page: Page, mapping: Mapping) -> Result<Mapping, MapError> {
        check_flags(mapping.flags)?;
        let entry = self
            .entries
            .get_mut(&page)
            .ok_or(MapError::NotMapped(page.start_address().as_u64()))?;
        Ok(core::mem::replace(entry, mapping))
    }

    /// Removes an entry and returns it.
    pub fn unmap(&mut self, page: Page) -> Result<Mapping, MapError> {
        self.entries
            .remove(&page)
            .ok_or(MapError::NotMapped(page.start_address().as_u64()))
    }

    pub fn translate(&self, page: Page) -> Option<Mapping> {
        self.entries.get(&page).copied()
    }

    /// Entries whose page lies in `pages`, in address order.
    pub fn range<R>(&self, pages: R) -> impl Iterator<Item = (Page, Mapping)> + '_
    where
        R: RangeBounds<Page>,
    {
        self.entries.range(pages).map(|(page, mapping)| (*page, *mapping))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Page, Mapping)> + '_ {
        self.entries.iter().map(|(page, mapping)| (*page, *mapping))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_flags(flags: PageTableFlags) -> Result<(), MapError> {
    if flags.contains(PageTableFlags::PRESENT) {
        Ok(())
    } else {
        Err(MapError::InvalidFlags(flags))
    }
}
