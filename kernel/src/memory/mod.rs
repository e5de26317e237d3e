// kernel/src/memory/mod.rs
//
// Copy-on-write virtual memory core.
//
//   frame_allocator  ref-counted frame arena
//   page_table       per-address-space page → frame bindings
//   vma              declared regions and their permissions
//   address_space    page table + VMAs, owned by one process
//   fork             fork-time duplication with shared COW mappings
//   page_fault       fault classification and resolution
//   tlb              translation-cache invalidation
//   uaccess          software MMU for user-memory copies

use spin::Once;
use x86_64::PhysAddr;

pub mod address_space;
pub mod fork;
pub mod frame_allocator;
pub mod page_fault;
pub mod page_table;
pub mod tlb;
pub mod uaccess;
pub mod vma;

pub use address_space::{AddressSpace, AddressSpaceError, AsId, PageState};
pub use fork::{duplicate_address_space, ForkError};
pub use frame_allocator::{FrameError, FramePool, FrameStats};
pub use page_fault::{resolve_fault, FaultError, FaultKind, Resolution};
pub use page_table::{MapError, Mapping, PageTable};
pub use tlb::{HardwareTlb, RemoteShootdown, SingleCpu, SoftTlb, TlbShootdown};
pub use vma::{Vma, VmaError, VmaFlags, VmaKind};

/// Size of every frame and page handled by the core.
pub const PAGE_SIZE: usize = 4096;

static FRAME_POOL: Once<FramePool> = Once::new();

/// Sets up the kernel-wide frame pool.  Only the first call has an effect;
/// later calls return the pool built by the first one.
pub fn init(base: PhysAddr, frames: usize) -> &'static FramePool {
    FRAME_POOL.call_once(|| {
        crate::serial_println!("memory: frame pool at {:#x}, {} frames", base.as_u64(), frames);
        FramePool::new(base, frames)
    })
}

/// The kernel-wide frame pool, once `init` has run.
pub fn frame_pool() -> Option<&'static FramePool> {
    FRAME_POOL.get()
}
