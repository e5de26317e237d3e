// kernel/src/memory/address_space.rs
//
// AddressSpace: a process's page table + VMAs as a single unit.
//
// Owned exclusively by one process.  Every operation that creates, changes
// or removes a leaf entry here also
//   1. keeps the frame reference counts exact (incref/decref), and
//   2. invalidates the (space, page) translation before returning.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    VirtAddr,
};

use super::{
    frame_allocator::{FrameError, FramePool, PageBytes},
    page_table::{MapError, Mapping, PageTable},
    tlb::TlbShootdown,
    vma::{region_end, Vma, VmaError, VmaFlags, VmaKind, VmaList},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an address space's page-table root.  Never reused, so a
/// cached translation can never be attributed to the wrong space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(u64);

impl AsId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Where one virtual page stands in the copy-on-write state machine.
///
/// ```text
///   Unmapped ──first touch──▶ PrivateWritable ──fork──▶ SharedReadOnly
///      │                            ▲                        │
///      │                            └──── write fault ───────┘
///      └──first touch (read-only VMA)──▶ Protected ──fork──▶ Protected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// No leaf entry.
    Unmapped,
    /// Writable entry; the frame has exactly one reference.
    PrivateWritable,
    /// Read-only entry in a writable VMA: the next write copies (ref > 1)
    /// or just restores the write bit (ref == 1).
    SharedReadOnly,
    /// Read-only entry in a VMA that forbids writing.
    Protected,
}

/// Errors reported while managing an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    #[error(transparent)]
    Vma(#[from] VmaError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug)]
pub struct AddressSpace {
    pub(super) id: AsId,
    pub(super) page_table: PageTable,
    pub(super) vmas: VmaList,
}

impl AddressSpace {
    // ====================================================================
    // CONSTRUCTORS
    // ====================================================================

    /// Empty user address space with a fresh root identity.
    pub fn new() -> Self {
        Self::with_vmas(VmaList::new())
    }

    pub(super) fn with_vmas(vmas: VmaList) -> Self {
        Self {
            id: AsId::next(),
            page_table: PageTable::new(),
            vmas,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    // ====================================================================
    // VMA MANAGEMENT
    // ====================================================================

    /// Registers an anonymous region.  Nothing is mapped until first touch.
    pub fn map_anonymous(
        &mut self,
        start: VirtAddr,
        pages: u64,
        flags: VmaFlags,
    ) -> Result<(), AddressSpaceError> {
        let vma = Vma::new(start, pages, flags, VmaKind::Anonymous)?;
        self.vmas.add(vma)?;
        Ok(())
    }

    /// Find the VMA containing `addr`, if any.
    pub fn find_vma(&self, addr: VirtAddr) -> Option<Vma> {
        self.vmas.find(addr).copied()
    }

    /// Debug: print all VMAs.
    pub fn dump_vmas(&self) {
        self.vmas.dump(self.id.as_u64());
    }

    // ====================================================================
    // MAPPINGS
    // ====================================================================

    pub fn translate(&self, addr: VirtAddr) -> Option<Mapping> {
        self.page_table.translate(Page::containing_address(addr))
    }

    pub fn page_state(&self, addr: VirtAddr) -> PageState {
        let Some(mapping) = self.translate(addr) else {
            return PageState::Unmapped;
        };
        if mapping.is_writable() {
            return PageState::PrivateWritable;
        }
        match self.find_vma(addr) {
            Some(vma) if vma.flags.contains(VmaFlags::WRITE) => PageState::SharedReadOnly,
            _ => PageState::Protected,
        }
    }

    /// Eagerly backs the page at `addr` with a new frame, filled by `fill`
    /// and mapped with the covering VMA's access rights.  Used by the image
    /// loader.
    ///
    /// The frame is allocated here, so the new entry always holds its only
    /// reference: a frame that some space already maps can never be
    /// installed a second time.
    pub fn install_page<T, F>(
        &mut self,
        addr: VirtAddr,
        frames: &FramePool,
        tlb: &T,
        fill: F,
    ) -> Result<PhysFrame, AddressSpaceError>
    where
        T: TlbShootdown + ?Sized,
        F: FnOnce(&mut PageBytes),
    {
        let vma = self.find_vma(addr).ok_or(VmaError::NotMapped)?;
        let page = Page::containing_address(addr);
        if self.page_table.translate(page).is_some() {
            return Err(MapError::AlreadyMapped(page.start_address().as_u64()).into());
        }

        let frame = frames.allocate()?;
        let installed = frames
            .lock(frame)
            .map(|mut guard| fill(guard.bytes_mut()))
            .map_err(AddressSpaceError::from)
            .and_then(|()| {
                let mapping = Mapping::new(frame, vma.page_table_flags());
                Ok(self.page_table.map(page, mapping)?)
            });
        if let Err(err) = installed {
            frames.decref(frame)?;
            return Err(err);
        }
        tlb.invalidate(self.id, page);
        Ok(frame)
    }

    /// Removes `[start, start + pages * 4 KiB)`: VMAs are cut back, every
    /// mapping in the range drops its frame reference.  Holes are fine.
    /// Returns the number of mappings released.
    pub fn unmap<T: TlbShootdown + ?Sized>(
        &mut self,
        start: VirtAddr,
        pages: u64,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<usize, AddressSpaceError> {
        let end = region_end(start, pages)?;
        self.vmas.remove_range(start.as_u64(), end)?;

        let doomed = self.pages_in(start, end);
        for page in &doomed {
            self.unmap_page(*page, frames, tlb)?;
        }
        Ok(doomed.len())
    }

    /// Changes the declared access of `[start, start + pages * 4 KiB)`.
    ///
    /// The write bit is never granted here.  A region that gains WRITE gets
    /// its write bits back lazily through the fault path, which checks
    /// whether the frame is still shared.
    pub fn protect<T: TlbShootdown + ?Sized>(
        &mut self,
        start: VirtAddr,
        pages: u64,
        flags: VmaFlags,
        tlb: &T,
    ) -> Result<(), AddressSpaceError> {
        let end = region_end(start, pages)?;
        self.vmas.protect_range(start.as_u64(), end, flags)?;

        for page in self.pages_in(start, end) {
            let Some(mapping) = self.page_table.translate(page) else {
                continue;
            };
            let Some(vma) = self.vmas.find(page.start_address()) else {
                continue;
            };
            let mut updated = vma.page_table_flags();
            if !mapping.is_writable() {
                updated.remove(PageTableFlags::WRITABLE);
            }
            if updated != mapping.flags {
                self.page_table.remap(page, Mapping::new(mapping.frame, updated))?;
                tlb.invalidate(self.id, page);
            }
        }
        Ok(())
    }

    /// Tears everything down (process exit).  Every frame reference held
    /// by this space is dropped and every translation invalidated.
    pub fn release<T: TlbShootdown + ?Sized>(
        &mut self,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<(), FrameError> {
        let pages: Vec<Page> = self.page_table.iter().map(|(page, _)| page).collect();
        let mut first_error = None;
        for page in pages {
            if let Err(err) = self.unmap_page(page, frames, tlb) {
                first_error.get_or_insert(err);
            }
        }
        self.vmas.clear();
        first_error.map_or(Ok(()), Err)
    }

    // ====================================================================
    // INTERNAL
    // ====================================================================

    fn unmap_page<T: TlbShootdown + ?Sized>(
        &mut self,
        page: Page,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<(), FrameError> {
        let Ok(mapping) = self.page_table.unmap(page) else {
            return Ok(());
        };
        tlb.invalidate(self.id, page);
        frames.decref(mapping.frame)?;
        Ok(())
    }

    fn pages_in(&self, start: VirtAddr, end: u64) -> Vec<Page> {
        self.page_table
            .range(Page::containing_address(start)..)
            .map(|(page, _)| page)
            .take_while(|page| page.start_address().as_u64() < end)
            .collect()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{tlb::SoftTlb, vma::MAX_VMAS, PAGE_SIZE};
    use x86_64::PhysAddr;

    const BASE: u64 = 0x40_0000;
    const PG: u64 = PAGE_SIZE as u64;

    fn pool() -> FramePool {
        FramePool::new(PhysAddr::new(0x10_0000), 16)
    }

    fn addr(offset: u64) -> VirtAddr {
        VirtAddr::new(BASE + offset)
    }

    #[test]
    fn every_space_gets_its_own_root() {
        let a = AddressSpace::new();
        let b = AddressSpace::new();
        assert_ne!(a.id(), b.id());
    }

    fn zero(_: &mut PageBytes) {}

    #[test]
    fn install_page_fills_and_uses_vma_rights() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        space.map_anonymous(addr(0), 1, VmaFlags::READ | VmaFlags::EXEC).unwrap();

        let frame = space
            .install_page(addr(0), &frames, &tlb, |bytes| bytes[..4].copy_from_slice(b"\x7fELF"))
            .unwrap();

        let mapping = space.translate(addr(0x10)).unwrap();
        assert_eq!(mapping.frame, frame);
        assert!(!mapping.is_writable());
        assert!(mapping.is_executable());
        assert_eq!(frames.ref_count(frame), Ok(1));
        assert_eq!(space.page_state(addr(0)), PageState::Protected);
        assert_eq!(tlb.invalidation_count(), 1);

        let mut magic = [0; 4];
        frames.read(frame, 0, &mut magic).unwrap();
        assert_eq!(&magic, b"\x7fELF");
    }

    #[test]
    fn install_page_rejects_holes_and_mapped_pages() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        space.map_anonymous(addr(0), 1, VmaFlags::READ | VmaFlags::WRITE).unwrap();

        assert_eq!(
            space.install_page(addr(PG), &frames, &tlb, zero),
            Err(AddressSpaceError::Vma(VmaError::NotMapped))
        );
        space.install_page(addr(0), &frames, &tlb, zero).unwrap();
        assert_eq!(
            space.install_page(addr(0), &frames, &tlb, zero),
            Err(AddressSpaceError::Map(MapError::AlreadyMapped(BASE)))
        );
        assert_eq!(frames.stats().used, 1);
    }

    #[test]
    fn installs_in_two_spaces_never_share_a_frame() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut a = AddressSpace::new();
        let mut b = AddressSpace::new();
        for space in [&mut a, &mut b] {
            space.map_anonymous(addr(0), 1, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        }

        let fa = a.install_page(addr(0), &frames, &tlb, zero).unwrap();
        let fb = b.install_page(addr(0), &frames, &tlb, zero).unwrap();
        assert_ne!(fa, fb);
        assert_eq!(frames.ref_count(fa), Ok(1));
        assert_eq!(frames.ref_count(fb), Ok(1));

        frames.write(fa, 0, b"AAAA").unwrap();
        let mut seen = [0xff; 4];
        frames.read(fb, 0, &mut seen).unwrap();
        assert_eq!(seen, [0; 4]);

        assert_eq!(a.release(&frames, &tlb), Ok(()));
        assert_eq!(b.release(&frames, &tlb), Ok(()));
        assert_eq!(frames.stats().used, 0);
    }

    #[test]
    fn unmap_releases_frames_and_cuts_vmas() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        space.map_anonymous(addr(0), 3, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        for i in 0..3 {
            space.install_page(addr(i * PG), &frames, &tlb, zero).unwrap();
        }
        assert_eq!(frames.stats().used, 3);

        assert_eq!(space.unmap(addr(PG), 2, &frames, &tlb), Ok(2));
        assert_eq!(frames.stats().used, 1);
        assert_eq!(space.page_state(addr(PG)), PageState::Unmapped);
        assert!(space.find_vma(addr(PG)).is_none());
        assert!(space.find_vma(addr(0)).is_some());
    }

    #[test]
    fn unmap_that_would_overflow_the_vma_list_changes_nothing() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        // One three-page region followed by single pages up to the cap.
        space.map_anonymous(addr(0), 3, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        for i in 1..MAX_VMAS as u64 {
            space
                .map_anonymous(addr((2 + 2 * i) * PG), 1, VmaFlags::READ)
                .unwrap();
        }
        space.install_page(addr(PG), &frames, &tlb, zero).unwrap();

        // Punching the middle page would split one VMA into two.
        assert_eq!(
            space.unmap(addr(PG), 1, &frames, &tlb),
            Err(AddressSpaceError::Vma(VmaError::Full))
        );
        assert_eq!(space.vmas().len(), MAX_VMAS);
        assert_eq!(space.page_state(addr(PG)), PageState::PrivateWritable);
        assert_eq!(frames.stats().used, 1);

        // Trimming an edge does not split.
        assert_eq!(space.unmap(addr(0), 1, &frames, &tlb), Ok(0));
        assert_eq!(space.vmas().len(), MAX_VMAS);
    }

    #[test]
    fn protect_drops_write_but_never_grants_it() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        space.map_anonymous(addr(0), 1, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        space.install_page(addr(0), &frames, &tlb, zero).unwrap();
        assert_eq!(space.page_state(addr(0)), PageState::PrivateWritable);

        space.protect(addr(0), 1, VmaFlags::READ, &tlb).unwrap();
        assert_eq!(space.page_state(addr(0)), PageState::Protected);

        space.protect(addr(0), 1, VmaFlags::READ | VmaFlags::WRITE, &tlb).unwrap();
        assert_eq!(space.page_state(addr(0)), PageState::SharedReadOnly);
        assert!(!space.translate(addr(0)).unwrap().is_writable());
    }

    #[test]
    fn release_returns_every_frame() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut space = AddressSpace::new();
        space.map_anonymous(addr(0), 4, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        for i in 0..4 {
            space.install_page(addr(i * PG), &frames, &tlb, zero).unwrap();
        }

        space.release(&frames, &tlb).unwrap();
        assert_eq!(frames.stats().used, 0);
        assert!(space.page_table().is_empty());
        assert!(space.vmas().is_empty());
    }
}
