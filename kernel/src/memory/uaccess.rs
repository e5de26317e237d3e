// kernel/src/memory/uaccess.rs
//
// Kernel-side access to user memory through a software MMU.
//
// Every access goes translation cache → page table, exactly like the
// hardware walk: a cached translation is trusted as-is.  When the walk
// refuses the access a `PageFault` is raised, handed to the fault
// dispatcher, and the access is retried, the way the CPU re-executes the
// faulting instruction after `iretq`.
//
// Because stale cache entries are trusted, a missing invalidation shows up
// here as a real bug (a write landing in a frame another space still
// shares), not as a silent no-op.

use thiserror::Error;
use x86_64::{structures::paging::Page, VirtAddr};

use super::{
    address_space::AddressSpace,
    frame_allocator::{FrameError, FramePool},
    page_fault::{resolve_fault, FaultError, FaultKind},
    page_table::Mapping,
    tlb::SoftTlb,
    PAGE_SIZE,
};

/// A single access can fault at most this many times in a row before the
/// dispatcher is considered stuck (first touch + COW needs two).
pub const MAX_FAULT_RETRIES: usize = 4;

/// What the MMU reports when a walk refuses an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: u64,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UaccessError {
    /// The fault dispatcher refused the access.
    #[error(transparent)]
    Fault(#[from] FaultError),
    /// The same access kept faulting after being "resolved".
    #[error("access at {0:#x} keeps faulting after resolution")]
    FaultLoop(u64),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One MMU walk for an access of `kind` at `addr`.
pub fn probe(
    space: &AddressSpace,
    tlb: &SoftTlb,
    addr: u64,
    kind: FaultKind,
) -> Result<Mapping, PageFault> {
    let fault = PageFault { addr, kind };
    let vaddr = VirtAddr::try_new(addr).map_err(|_| fault)?;
    let page: Page = Page::containing_address(vaddr);

    let mapping = match tlb.lookup(space.id(), page) {
        Some(cached) => cached,
        None => {
            let walked = space.page_table().translate(page).ok_or(fault)?;
            tlb.fill(space.id(), page, walked);
            walked
        }
    };

    if mapping.permits(kind) {
        Ok(mapping)
    } else {
        Err(fault)
    }
}

/// Writes `data` into user memory at `addr`, faulting pages in (and
/// breaking copy-on-write sharing) as needed.
pub fn copy_to_user(
    space: &mut AddressSpace,
    addr: u64,
    data: &[u8],
    frames: &FramePool,
    tlb: &SoftTlb,
) -> Result<(), UaccessError> {
    for (cursor, range) in chunks(addr, data.len())? {
        let mapping = access(space, cursor, FaultKind::Write, frames, tlb)?;
        frames.write(mapping.frame, page_offset(cursor), &data[range])?;
    }
    Ok(())
}

/// Reads user memory at `addr` into `buf`.
pub fn copy_from_user(
    space: &mut AddressSpace,
    addr: u64,
    buf: &mut [u8],
    frames: &FramePool,
    tlb: &SoftTlb,
) -> Result<(), UaccessError> {
    for (cursor, range) in chunks(addr, buf.len())? {
        let mapping = access(space, cursor, FaultKind::Read, frames, tlb)?;
        frames.read(mapping.frame, page_offset(cursor), &mut buf[range])?;
    }
    Ok(())
}

/// Probe → fault → retry until the walk allows the access.
fn access(
    space: &mut AddressSpace,
    addr: u64,
    kind: FaultKind,
    frames: &FramePool,
    tlb: &SoftTlb,
) -> Result<Mapping, UaccessError> {
    for _ in 0..=MAX_FAULT_RETRIES {
        match probe(space, tlb, addr, kind) {
            Ok(mapping) => return Ok(mapping),
            Err(fault) => {
                resolve_fault(space, fault.addr, fault.kind, frames, tlb)?;
            }
        }
    }
    Err(UaccessError::FaultLoop(addr))
}

#[inline]
fn page_offset(addr: u64) -> usize {
    (addr % PAGE_SIZE as u64) as usize
}

/// Splits `[addr, addr + len)` at page boundaries: (user address, range in
/// the caller's buffer).
fn chunks(
    addr: u64,
    len: usize,
) -> Result<impl Iterator<Item = (u64, core::ops::Range<usize>)>, UaccessError> {
    addr.checked_add(len as u64)
        .ok_or(FaultError::AddressNotMapped(addr))?;

    let mut done = 0usize;
    Ok(core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let cursor = addr + done as u64;
        let take = (PAGE_SIZE - page_offset(cursor)).min(len - done);
        let range = done..done + take;
        done += take;
        Some((cursor, range))
    }))
}
