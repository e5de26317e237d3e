// kernel/src/lib.rs
//
// Copy-on-write virtual memory core.
//
// Builds as `no_std` + `alloc` for the kernel; unit tests run hosted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod memory;
pub mod process;

pub use memory::{
    duplicate_address_space, resolve_fault, AddressSpace, FaultError, FaultKind, FramePool,
    Resolution,
};
pub use process::{Pid, Process};
