//! EmberOS Kernel Library
//!
//! Core of a 32-bit x86 teaching kernel. The interesting part is the
//! layered memory-management stack under [`mm`]: buddy allocator, frame
//! reference counting, slab caches, the kmalloc facade, two-level paging
//! with PSE, per-process VMA trees, and fault-tolerant user-memory access.
//!
//! The crate builds both for bare metal (`target_os = "none"`) and for the
//! host, where the hardware-touching paths compile out and the whole stack
//! runs against an arena so the unit and integration tests exercise real
//! allocator behavior.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host target: use the system allocator so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// On bare metal the Rust `alloc` crate is backed by the kernel heap, which
// bridges onto the kmalloc facade once mm::init has run.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::heap::KernelHeap = mm::heap::KernelHeap::new();

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod klog;
pub mod mm;
pub mod sync;

pub use error::{KernelError, KernelResult, MmError};
pub use mm::{PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};
