// kernel/src/memory/frame_allocator.rs
//
// Reference-counted frame pool.
//
// Every frame the copy-on-write core hands out lives in one arena: a
// contiguous physical window [base, base + count * 4 KiB) backed by a
// table of slots.  A slot carries
//
//   - `refs`      number of present mappings targeting the frame
//                 (0 ⇔ the frame sits on the free list)
//   - `contents`  the page bytes, behind the frame's exclusive lock
//
// Mappings only ever store the `PhysFrame` identifier; the pool is the
// single owner of the bytes.
//
// Invariants:
//   - `allocate` zero-fills before the frame becomes reachable, so a
//     recycled frame never exposes its previous owner's data.
//   - `incref` refuses a free frame (0 → 1 only happens in `allocate`).
//   - `decref` that reaches 0 pushes the slot back onto the free list
//     exactly once.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};
use thiserror::Error;
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use super::PAGE_SIZE;

/// Raw contents of one 4 KiB frame.
pub type PageBytes = [u8; PAGE_SIZE];

/// Errors reported by the frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Every frame in the pool is referenced.
    #[error("frame pool exhausted")]
    Exhausted,
    /// The frame does not belong to this pool.
    #[error("frame {0:#x} is outside the pool")]
    OutOfPool(u64),
    /// The frame is on the free list; nobody may reference it.
    #[error("frame {0:#x} is not allocated")]
    NotAllocated(u64),
    /// A byte range does not fit inside one frame.
    #[error("range {offset:#x}+{len:#x} crosses the frame boundary")]
    OutOfBounds { offset: usize, len: usize },
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

struct FrameSlot {
    refs: AtomicUsize,
    contents: Mutex<Box<PageBytes>>,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            refs: AtomicUsize::new(0),
            contents: Mutex::new(Box::new([0; PAGE_SIZE])),
        }
    }
}

/// Arena of reference-counted physical frames.
pub struct FramePool {
    base: PhysAddr,
    slots: Vec<FrameSlot>,
    free: Mutex<Vec<usize>>,
}

impl FramePool {
    /// Builds a pool of `count` frames whose physical window starts at the
    /// frame containing `base`.
    pub fn new(base: PhysAddr, count: usize) -> Self {
        let base = PhysFrame::<Size4KiB>::containing_address(base).start_address();
        let slots = (0..count).map(|_| FrameSlot::new()).collect();
        // Pop order hands out the lowest frame first.
        let free = (0..count).rev().collect();
        Self {
            base,
            slots,
            free: Mutex::new(free),
        }
    }

    /// Number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether `frame` falls inside this pool's physical window.
    pub fn contains(&self, frame: PhysFrame) -> bool {
        self.index(frame).is_ok()
    }

    // ====================================================================
    // ALLOCATION / REFERENCE COUNTING
    // ====================================================================

    /// Takes a frame off the free list with `ref = 1` and zeroed contents.
    pub fn allocate(&self) -> Result<PhysFrame, FrameError> {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                crate::serial_println_raw!("frame pool: exhausted ({} frames)", self.capacity());
                return Err(FrameError::Exhausted);
            }
        };

        let slot = &self.slots[index];
        slot.contents.lock().fill(0);
        slot.refs.store(1, Ordering::Release);
        Ok(self.frame_at(index))
    }

    /// Adds one reference to an allocated frame.  Returns the new count.
    pub fn incref(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        let slot = self.slot(frame)?;
        slot.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == 0 {
                    None
                } else {
                    Some(refs + 1)
                }
            })
            .map(|prev| prev + 1)
            .map_err(|_| FrameError::NotAllocated(frame.start_address().as_u64()))
    }

    /// Drops one reference.  Returns the remaining count; at 0 the frame is
    /// back on the free list.
    pub fn decref(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        let index = self.index(frame)?;
        let prev = self.slots[index]
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map_err(|_| FrameError::NotAllocated(frame.start_address().as_u64()))?;

        if prev == 1 {
            self.free.lock().push(index);
        }
        Ok(prev - 1)
    }

    /// Current reference count (0 for a free frame).
    pub fn ref_count(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        Ok(self.slot(frame)?.refs.load(Ordering::Acquire))
    }

    // ====================================================================
    // CONTENT ACCESS
    // ====================================================================

    /// Takes the frame's exclusive lock.
    ///
    /// While the guard lives, no other CPU can lock, copy from or write to
    /// this frame, which is what serializes the copy-on-write decision.
    pub fn lock(&self, frame: PhysFrame) -> Result<FrameGuard<'_>, FrameError> {
        let slot = self.slot(frame)?;
        let contents = slot.contents.lock();
        // Checked after acquiring: the frame may have been released while
        // we were spinning.
        if slot.refs.load(Ordering::Acquire) == 0 {
            return Err(FrameError::NotAllocated(frame.start_address().as_u64()));
        }
        Ok(FrameGuard {
            frame,
            refs: &slot.refs,
            contents,
        })
    }

    /// Copies `buf.len()` bytes out of `frame` starting at `offset`.
    pub fn read(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) -> Result<(), FrameError> {
        check_bounds(offset, buf.len())?;
        let guard = self.lock(frame)?;
        buf.copy_from_slice(&guard.bytes()[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copies `data` into `frame` starting at `offset`.
    pub fn write(&self, frame: PhysFrame, offset: usize, data: &[u8]) -> Result<(), FrameError> {
        check_bounds(offset, data.len())?;
        let mut guard = self.lock(frame)?;
        guard.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> FrameStats {
        let free = self.free.lock().len();
        FrameStats {
            total: self.capacity(),
            free,
            used: self.capacity() - free,
        }
    }

    // ====================================================================
    // INTERNAL
    // ====================================================================

    fn index(&self, frame: PhysFrame) -> Result<usize, FrameError> {
        let addr = frame.start_address().as_u64();
        let out_of_pool = FrameError::OutOfPool(addr);
        let offset = addr.checked_sub(self.base.as_u64()).ok_or(out_of_pool)?;
        let index = (offset / PAGE_SIZE as u64) as usize;
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(out_of_pool)
        }
    }

    fn slot(&self, frame: PhysFrame) -> Result<&FrameSlot, FrameError> {
        self.index(frame).map(|index| &self.slots[index])
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(self.base + (index * PAGE_SIZE) as u64)
    }
}

fn check_bounds(offset: usize, len: usize) -> Result<(), FrameError> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE => Ok(()),
        _ => Err(FrameError::OutOfBounds { offset, len }),
    }
}

/// Exclusive access to one frame's bytes and a stable view of its
/// reference count.
pub struct FrameGuard<'a> {
    frame: PhysFrame,
    refs: &'a AtomicUsize,
    contents: MutexGuard<'a, Box<PageBytes>>,
}

impl FrameGuard<'_> {
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Reference count observed under the lock.
    ///
    /// Only holders of a mapping to this frame can change it, and any
    /// such holder that wants to copy or restore must take this lock
    /// first, so a count of 1 seen here stays 1 until the guard drops.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> &PageBytes {
        &self.contents
    }

    pub fn bytes_mut(&mut self) -> &mut PageBytes {
        &mut self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> FramePool {
        FramePool::new(PhysAddr::new(0x10_0000), count)
    }

    #[test]
    fn allocate_starts_with_one_reference() {
        let frames = pool(4);
        let frame = frames.allocate().unwrap();
        assert_eq!(frame.start_address().as_u64(), 0x10_0000);
        assert_eq!(frames.ref_count(frame), Ok(1));
        assert_eq!(frames.stats(), FrameStats { total: 4, free: 3, used: 1 });
    }

    #[test]
    fn decref_to_zero_returns_frame() {
        let frames = pool(2);
        let frame = frames.allocate().unwrap();
        assert_eq!(frames.incref(frame), Ok(2));
        assert_eq!(frames.decref(frame), Ok(1));
        assert_eq!(frames.stats().free, 1);
        assert_eq!(frames.decref(frame), Ok(0));
        assert_eq!(frames.stats().free, 2);
        assert_eq!(frames.ref_count(frame), Ok(0));
    }

    #[test]
    fn free_frames_reject_reference_changes() {
        let frames = pool(1);
        let frame = frames.allocate().unwrap();
        frames.decref(frame).unwrap();

        let addr = frame.start_address().as_u64();
        assert_eq!(frames.incref(frame), Err(FrameError::NotAllocated(addr)));
        assert_eq!(frames.decref(frame), Err(FrameError::NotAllocated(addr)));
        assert!(matches!(frames.lock(frame), Err(FrameError::NotAllocated(_))));
    }

    #[test]
    fn exhaustion_is_reported() {
        let frames = pool(2);
        frames.allocate().unwrap();
        frames.allocate().unwrap();
        assert_eq!(frames.allocate(), Err(FrameError::Exhausted));
    }

    #[test]
    fn recycled_frame_is_scrubbed() {
        let frames = pool(1);
        let frame = frames.allocate().unwrap();
        frames.write(frame, 100, b"secret").unwrap();
        frames.decref(frame).unwrap();

        let reused = frames.allocate().unwrap();
        assert_eq!(reused, frame);
        let mut buf = [0xffu8; 6];
        frames.read(reused, 100, &mut buf).unwrap();
        assert_eq!(&buf, &[0; 6]);
    }

    #[test]
    fn foreign_frames_are_rejected() {
        let frames = pool(2);
        let below = PhysFrame::containing_address(PhysAddr::new(0x1000));
        let above = PhysFrame::containing_address(PhysAddr::new(0x10_0000 + 2 * PAGE_SIZE as u64));
        assert_eq!(frames.ref_count(below), Err(FrameError::OutOfPool(0x1000)));
        assert!(!frames.contains(above));
    }

    #[test]
    fn writes_must_stay_inside_the_frame() {
        let frames = pool(1);
        let frame = frames.allocate().unwrap();
        assert_eq!(
            frames.write(frame, PAGE_SIZE - 2, b"abc"),
            Err(FrameError::OutOfBounds { offset: PAGE_SIZE - 2, len: 3 })
        );
    }

    #[test]
    fn concurrent_reference_traffic_balances() {
        use std::sync::Arc;
        use std::thread;

        let frames = Arc::new(pool(1));
        let frame = frames.allocate().unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let frames = Arc::clone(&frames);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        frames.incref(frame).unwrap();
                        frames.decref(frame).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(frames.ref_count(frame), Ok(1));
        assert_eq!(frames.stats().free, 0);
    }
}
