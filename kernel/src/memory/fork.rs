// kernel/src/memory/fork.rs
//
// Address-space duplication for fork.
//
// No page is copied here.  For every present leaf entry in the parent:
//   - the frame gains one reference (the child's mapping)
//   - the child gets the same frame, read-only, same other bits
//   - the parent entry loses its write bit too
//   - the translation of that page is invalidated in both spaces
//
// The first write from either side then faults and the fault path decides
// whether a copy is needed.  Downgrading only the child would let the
// parent keep writing into a frame the child still reads.

use alloc::vec::Vec;

use thiserror::Error;
use x86_64::structures::paging::Page;

use super::{
    address_space::AddressSpace,
    frame_allocator::{FrameError, FramePool},
    page_table::{MapError, Mapping},
    tlb::TlbShootdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForkError {
    /// A parent mapping points at a frame the pool cannot share
    /// (freed or foreign).
    #[error("cannot share frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Builds a child address space sharing every present page of `parent`
/// copy-on-write.
///
/// On failure the partially built child is torn down (its references are
/// dropped again) and the parent is left consistent: pages already visited
/// are read-only in the parent, which the fault path undoes on the next
/// write since their count is back to 1.
pub fn duplicate_address_space<T: TlbShootdown + ?Sized>(
    parent: &mut AddressSpace,
    frames: &FramePool,
    tlb: &T,
) -> Result<AddressSpace, ForkError> {
    let mut child = AddressSpace::with_vmas(parent.vmas.clone());

    if let Err(err) = share_pages(parent, &mut child, frames, tlb) {
        crate::serial_println!(
            "fork: space {} failed ({}), rolling back child {}",
            parent.id.as_u64(),
            err,
            child.id.as_u64()
        );
        // Every child entry holds exactly one reference taken above.
        if let Err(release_err) = child.release(frames, tlb) {
            crate::serial_println!(
                "fork: rollback of child {} left references behind: {}",
                child.id.as_u64(),
                release_err
            );
        }
        return Err(err);
    }

    crate::serial_println!(
        "fork: space {} → {} ({} pages shared)",
        parent.id.as_u64(),
        child.id.as_u64(),
        child.page_table.len()
    );
    Ok(child)
}

fn share_pages<T: TlbShootdown + ?Sized>(
    parent: &mut AddressSpace,
    child: &mut AddressSpace,
    frames: &FramePool,
    tlb: &T,
) -> Result<(), ForkError> {
    let entries: Vec<(Page, Mapping)> = parent.page_table.iter().collect();

    for (page, mapping) in entries {
        let shareable = parent
            .vmas
            .find(page.start_address())
            .is_some_and(|vma| vma.kind.is_shareable());
        if !shareable {
            continue;
        }

        frames.incref(mapping.frame)?;
        let shared = mapping.read_only();
        if let Err(err) = child.page_table.map(page, shared) {
            frames.decref(mapping.frame)?;
            return Err(err.into());
        }
        tlb.invalidate(child.id, page);

        if mapping.is_writable() {
            parent.page_table.remap(page, shared)?;
        }
        tlb.invalidate(parent.id, page);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        address_space::PageState,
        page_fault::{resolve_fault, FaultKind},
        tlb::SoftTlb,
        vma::VmaFlags,
        PAGE_SIZE,
    };
    use x86_64::{PhysAddr, VirtAddr};

    const BASE: u64 = 0x40_0000;
    const PG: u64 = PAGE_SIZE as u64;

    fn pool() -> FramePool {
        FramePool::new(PhysAddr::new(0x10_0000), 8)
    }

    fn touched_parent(frames: &FramePool, tlb: &SoftTlb, pages: u64) -> AddressSpace {
        let mut parent = AddressSpace::new();
        parent
            .map_anonymous(VirtAddr::new(BASE), pages, VmaFlags::READ | VmaFlags::WRITE)
            .unwrap();
        for i in 0..pages {
            resolve_fault(&mut parent, BASE + i * PG, FaultKind::Write, frames, tlb).unwrap();
        }
        parent
    }

    #[test]
    fn child_shares_every_frame_read_only() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut parent = touched_parent(&frames, &tlb, 3);
        let used = frames.stats().used;

        let child = duplicate_address_space(&mut parent, &frames, &tlb).unwrap();

        assert_eq!(frames.stats().used, used, "fork must not allocate");
        assert_eq!(child.page_table().len(), 3);
        for i in 0..3 {
            let addr = VirtAddr::new(BASE + i * PG);
            let p = parent.translate(addr).unwrap();
            let c = child.translate(addr).unwrap();
            assert_eq!(p.frame, c.frame);
            assert_eq!(frames.ref_count(p.frame), Ok(2));
            assert_eq!(parent.page_state(addr), PageState::SharedReadOnly);
            assert_eq!(child.page_state(addr), PageState::SharedReadOnly);
        }
        assert_eq!(child.vmas().len(), parent.vmas().len());
    }

    #[test]
    fn fork_invalidates_both_spaces() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut parent = touched_parent(&frames, &tlb, 1);
        let page = Page::containing_address(VirtAddr::new(BASE));
        let stale = parent.translate(VirtAddr::new(BASE)).unwrap();
        tlb.fill(parent.id(), page, stale);

        let child = duplicate_address_space(&mut parent, &frames, &tlb).unwrap();

        assert_eq!(tlb.lookup(parent.id(), page), None);
        assert_eq!(tlb.lookup(child.id(), page), None);
    }

    #[test]
    fn fork_of_empty_space_shares_nothing() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut parent = AddressSpace::new();
        parent
            .map_anonymous(VirtAddr::new(BASE), 4, VmaFlags::READ | VmaFlags::WRITE)
            .unwrap();

        let child = duplicate_address_space(&mut parent, &frames, &tlb).unwrap();
        assert!(child.page_table().is_empty());
        assert!(child.find_vma(VirtAddr::new(BASE + 3 * PG)).is_some());
        assert_eq!(frames.stats().used, 0);
    }

    #[test]
    fn failed_fork_rolls_back_child_references() {
        let frames = pool();
        let tlb = SoftTlb::new();
        let mut parent = touched_parent(&frames, &tlb, 3);
        let broken = parent.translate(VirtAddr::new(BASE + 2 * PG)).unwrap().frame;
        // Corrupt the last entry's frame so sharing it fails midway.
        frames.decref(broken).unwrap();

        let err = duplicate_address_space(&mut parent, &frames, &tlb).unwrap_err();
        assert_eq!(
            err,
            ForkError::Frame(FrameError::NotAllocated(broken.start_address().as_u64()))
        );

        for i in 0..2 {
            let frame = parent.translate(VirtAddr::new(BASE + i * PG)).unwrap().frame;
            assert_eq!(frames.ref_count(frame), Ok(1));
        }
        // The downgraded parent pages come back writable without a copy.
        let used = frames.stats().used;
        resolve_fault(&mut parent, BASE, FaultKind::Write, &frames, &tlb).unwrap();
        assert_eq!(frames.stats().used, used);
    }
}
