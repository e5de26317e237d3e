// kernel/src/process/mod.rs
// Arquitectura basada en xv6: the process owns its address space, fork
// duplicates it, exit tears it down.

use spin::{Mutex, MutexGuard};
use x86_64::{structures::idt::PageFaultErrorCode, VirtAddr};

use crate::memory::{
    duplicate_address_space, resolve_fault,
    uaccess::{copy_from_user, copy_to_user, UaccessError},
    AddressSpace, FaultError, FaultKind, ForkError, FrameError, FramePool, Resolution, SoftTlb,
    TlbShootdown,
};

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

/// Process lifecycle as far as memory is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited; the address space is empty.
    Zombie,
}

/// Process Control Block (memory side).
///
/// The address-space lock is the outermost lock of the fault path: threads
/// of the same process fault one at a time, while different processes
/// only meet on per-frame locks.
pub struct Process {
    pub pid: Pid,
    state: Mutex<ProcessState>,
    address_space: Mutex<AddressSpace>,
}

impl Process {
    /// New process with an empty address space.
    pub fn new(pid: Pid) -> Self {
        Self::with_address_space(pid, AddressSpace::new())
    }

    pub fn with_address_space(pid: Pid, address_space: AddressSpace) -> Self {
        Self {
            pid,
            state: Mutex::new(ProcessState::Running),
            address_space: Mutex::new(address_space),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Locks the address space.
    pub fn address_space(&self) -> MutexGuard<'_, AddressSpace> {
        self.address_space.lock()
    }

    /// fork(): the child shares every present page copy-on-write.
    pub fn fork<T: TlbShootdown + ?Sized>(
        &self,
        child_pid: Pid,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<Process, ForkError> {
        let mut parent = self.address_space.lock();
        let child = duplicate_address_space(&mut parent, frames, tlb)?;
        crate::serial_println!("process: fork {} → {}", self.pid.0, child_pid.0);
        Ok(Process::with_address_space(child_pid, child))
    }

    /// Entry point for vector 14 once the trap layer has decoded CR2 and
    /// the error code.  An `Err` is terminal for this process.
    pub fn handle_page_fault<T: TlbShootdown + ?Sized>(
        &self,
        addr: VirtAddr,
        code: PageFaultErrorCode,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<Resolution, FaultError> {
        let kind = FaultKind::from_error_code(code);
        let mut space = self.address_space.lock();
        resolve_fault(&mut space, addr.as_u64(), kind, frames, tlb).map_err(|err| {
            crate::serial_println!(
                "process {}: fatal page fault ({:?}): {}",
                self.pid.0,
                code,
                err
            );
            err
        })
    }

    /// Releases every frame reference and marks the process a zombie.
    pub fn exit<T: TlbShootdown + ?Sized>(
        &self,
        frames: &FramePool,
        tlb: &T,
    ) -> Result<(), FrameError> {
        let result = self.address_space.lock().release(frames, tlb);
        *self.state.lock() = ProcessState::Zombie;
        crate::serial_println!("process {}: exited", self.pid.0);
        result
    }

    /// copyout(): kernel → user.
    pub fn write_user(
        &self,
        addr: VirtAddr,
        data: &[u8],
        frames: &FramePool,
        tlb: &SoftTlb,
    ) -> Result<(), UaccessError> {
        copy_to_user(&mut self.address_space.lock(), addr.as_u64(), data, frames, tlb)
    }

    /// copyin(): user → kernel.
    pub fn read_user(
        &self,
        addr: VirtAddr,
        buf: &mut [u8],
        frames: &FramePool,
        tlb: &SoftTlb,
    ) -> Result<(), UaccessError> {
        copy_from_user(&mut self.address_space.lock(), addr.as_u64(), buf, frames, tlb)
    }
}
