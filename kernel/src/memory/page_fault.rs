// kernel/src/memory/page_fault.rs
//
// Page fault dispatcher: first-touch allocation and copy-on-write.
//
// Flow:
//   1. Trap layer delivers (address, kind) for the faulting address space
//   2. Find the VMA covering the address          → else AddressNotMapped
//   3. Check the VMA allows this kind of access   → else ProtectionViolation
//   4. No leaf entry  → first touch: zeroed frame, VMA rights, ref = 1
//   5. Entry already allows the access → Spurious
//   6. Write on a read-only entry, under the frame's lock:
//        ref > 1   → copy into a new frame, remap writable, drop old ref
//        ref == 1  → restore the write bit in place
//   7. Read/fetch on an existing entry the bits refuse → ProtectionViolation
//   8. Invalidate the (space, page) translation, return, CPU retries
//
// Lock order: address space (held by the caller through `&mut`) → target
// frame → freshly allocated frame.  The fresh frame is unreachable from any
// other space until this function returns, so the order never inverts.

use thiserror::Error;
use x86_64::{
    structures::{idt::PageFaultErrorCode, paging::{Page, PhysFrame}},
    VirtAddr,
};

use super::{
    address_space::AddressSpace,
    frame_allocator::{FrameError, FramePool},
    page_table::{MapError, Mapping},
    tlb::TlbShootdown,
    vma::Vma,
};

/// Kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Instruction fetch.
    Fetch,
    Read,
    Write,
}

impl FaultKind {
    /// Decodes the hardware error code pushed with vector 14.
    pub fn from_error_code(code: PageFaultErrorCode) -> Self {
        if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            FaultKind::Fetch
        } else if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            FaultKind::Write
        } else {
            FaultKind::Read
        }
    }
}

/// Why a fault could not be resolved.  Every variant is terminal for the
/// faulting process; nothing here is retried by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// No VMA covers the address.
    #[error("segmentation fault: no VMA covers {0:#x}")]
    AddressNotMapped(u64),
    /// The VMA (or the live entry) does not allow this access.
    #[error("protection violation: {kind:?} at {addr:#x}")]
    ProtectionViolation { addr: u64, kind: FaultKind },
    /// No frame left for first touch or the private copy.
    #[error("out of memory resolving fault at {0:#x}")]
    OutOfMemory(u64),
    /// A live entry points at a frame the pool does not consider in use.
    #[error("mapping targets a bad frame: {0}")]
    BadFrame(FrameError),
    /// The leaf entry changed under the address-space lock.
    #[error("page table edit failed: {0}")]
    PageTable(MapError),
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Unmapped page backed by a fresh zeroed frame.
    FirstTouch(PhysFrame),
    /// Shared page replaced by a private copy.
    Copied { from: PhysFrame, to: PhysFrame },
    /// Sole owner; write bit restored without allocating.
    WriteRestored(PhysFrame),
    /// The entry already allowed the access (stale translation).
    Spurious,
}

/// Resolves a page fault at `addr` in `space`.
///
/// Returns once the mapping allows the access and the stale translation is
/// gone; the caller then re-executes the faulting access.
pub fn resolve_fault<T: TlbShootdown + ?Sized>(
    space: &mut AddressSpace,
    addr: u64,
    kind: FaultKind,
    frames: &FramePool,
    tlb: &T,
) -> Result<Resolution, FaultError> {
    // ── 1. Find the VMA for the faulting address ─────────────────────
    let vaddr = VirtAddr::try_new(addr).map_err(|_| FaultError::AddressNotMapped(addr))?;
    let vma = space.find_vma(vaddr).ok_or(FaultError::AddressNotMapped(addr))?;

    // ── 2. Declared permission ───────────────────────────────────────
    if !vma.permits(kind) {
        return Err(FaultError::ProtectionViolation { addr, kind });
    }

    // ── 3. Leaf entry for the containing page ────────────────────────
    let page: Page = Page::containing_address(vaddr);
    let resolution = match space.page_table.translate(page) {
        None => first_touch(space, page, &vma, frames, addr)?,
        // Another thread of this space resolved it first, or the cached
        // translation was stale.
        Some(mapping) if mapping.permits(kind) => Resolution::Spurious,
        Some(mapping) if kind == FaultKind::Write => {
            copy_on_write(space, page, mapping, &vma, frames, addr)?
        }
        Some(_) => return Err(FaultError::ProtectionViolation { addr, kind }),
    };

    // ── 4. Commit ────────────────────────────────────────────────────
    tlb.invalidate(space.id, page);

    #[cfg(feature = "log_faults")]
    crate::serial_println!(
        "page fault: space {} {:?} at {:#x} → {:?}",
        space.id.as_u64(),
        kind,
        addr,
        resolution
    );

    Ok(resolution)
}

fn first_touch(
    space: &mut AddressSpace,
    page: Page,
    vma: &Vma,
    frames: &FramePool,
    addr: u64,
) -> Result<Resolution, FaultError> {
    // `allocate` hands out zero-filled frames.
    let frame = frames.allocate().map_err(|err| oom_or_bad(err, addr))?;
    if let Err(err) = space
        .page_table
        .map(page, Mapping::new(frame, vma.page_table_flags()))
    {
        frames.decref(frame).map_err(FaultError::BadFrame)?;
        return Err(FaultError::PageTable(err));
    }
    Ok(Resolution::FirstTouch(frame))
}

fn copy_on_write(
    space: &mut AddressSpace,
    page: Page,
    mapping: Mapping,
    vma: &Vma,
    frames: &FramePool,
    addr: u64,
) -> Result<Resolution, FaultError> {
    // The whole inspect → copy → remap → decref sequence runs under the
    // old frame's lock.  A second writer to the same frame from another
    // space waits here and then finds ref == 1.
    let old = frames.lock(mapping.frame).map_err(FaultError::BadFrame)?;
    let private = Mapping::new(mapping.frame, vma.page_table_flags());

    if old.ref_count() == 1 {
        space
            .page_table
            .remap(page, private)
            .map_err(FaultError::PageTable)?;
        return Ok(Resolution::WriteRestored(mapping.frame));
    }

    let copy = frames.allocate().map_err(|err| oom_or_bad(err, addr))?;
    if let Err(err) = frames.write(copy, 0, old.bytes()) {
        frames.decref(copy).map_err(FaultError::BadFrame)?;
        return Err(FaultError::BadFrame(err));
    }
    if let Err(err) = space.page_table.remap(page, Mapping::new(copy, private.flags)) {
        frames.decref(copy).map_err(FaultError::BadFrame)?;
        return Err(FaultError::PageTable(err));
    }
    // A concurrent exit may have dropped the other reference meanwhile, so
    // this can free the frame; `allocate` waits for our guard before
    // scrubbing it.
    frames.decref(mapping.frame).map_err(FaultError::BadFrame)?;
    drop(old);

    Ok(Resolution::Copied {
        from: mapping.frame,
        to: copy,
    })
}

fn oom_or_bad(err: FrameError, addr: u64) -> FaultError {
    match err {
        FrameError::Exhausted => FaultError::OutOfMemory(addr),
        other => FaultError::BadFrame(other),
    }
}
