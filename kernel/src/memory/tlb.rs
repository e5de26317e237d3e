// kernel/src/memory/tlb.rs
//
// Translation-cache consistency.
//
// Every time a leaf entry is created, loses or gains a permission bit, or
// is removed, the cached translation for that exact (address space, page)
// pair must go before the faulting instruction is retried.  Otherwise the
// retry either faults forever (the fix is never seen) or writes straight
// into a frame that is still shared.
//
// Two implementations:
//   - `HardwareTlb`: `invlpg` on this CPU, then a `RemoteShootdown` for
//                    every other CPU that may run the same address space
//   - `SoftTlb`:     the cache consulted by the software MMU in `uaccess`

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use x86_64::structures::paging::Page;

use super::{address_space::AsId, page_table::Mapping};

/// Invalidates cached translations after a mapping change.
pub trait TlbShootdown: Sync {
    /// Drops any cached translation of `page` in address space `space`.
    fn invalidate(&self, space: AsId, page: Page);
}

/// Cross-CPU half of a hardware shootdown.
///
/// Threads of one process share an address space, so a page can be cached
/// on every CPU currently running that space.  The scheduler knows which
/// CPUs those are; its implementation sends them an IPI that makes each one
/// `invlpg` the page, and returns once all of them have acknowledged.
pub trait RemoteShootdown: Sync {
    fn shoot(&self, space: AsId, page: Page);
}

/// No remote CPUs.  Only valid while a single CPU ever runs user code.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleCpu;

impl RemoteShootdown for SingleCpu {
    fn shoot(&self, _space: AsId, _page: Page) {}
}

/// `invlpg` on this CPU plus a remote shootdown.
///
/// Without PCIDs a CR3 switch already drops every non-global entry, so the
/// local flush only matters for the running space; the remote half covers
/// the other CPUs running it.
pub struct HardwareTlb<R: RemoteShootdown = SingleCpu> {
    remote: R,
}

impl<R: RemoteShootdown> HardwareTlb<R> {
    pub const fn new(remote: R) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }
}

impl HardwareTlb<SingleCpu> {
    pub const fn single_cpu() -> Self {
        Self::new(SingleCpu)
    }
}

impl<R: RemoteShootdown> TlbShootdown for HardwareTlb<R> {
    fn invalidate(&self, space: AsId, page: Page) {
        flush_local(page);
        self.remote.shoot(space, page);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn flush_local(page: Page) {
    x86_64::instructions::tlb::flush(page.start_address());
}

// Hosted builds have no hardware TLB to flush.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn flush_local(_page: Page) {}

/// Software translation cache keyed by (address space, page).
#[derive(Default)]
pub struct SoftTlb {
    entries: Mutex<BTreeMap<(AsId, Page), Mapping>>,
    invalidations: AtomicUsize,
}

impl SoftTlb {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn lookup(&self, space: AsId, page: Page) -> Option<Mapping> {
        self.entries.lock().get(&(space, page)).copied()
    }

    /// Caches a translation the MMU just walked.
    pub fn fill(&self, space: AsId, page: Page, mapping: Mapping) {
        self.entries.lock().insert((space, page), mapping);
    }

    /// Number of `invalidate` calls so far.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Number of cached translations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TlbShootdown for SoftTlb {
    fn invalidate(&self, space: AsId, page: Page) {
        self.entries.lock().remove(&(space, page));
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}
