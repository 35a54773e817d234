//! Synchronization primitives
//!
//! Every allocator, cache and address space in the memory stack is guarded
//! by an [`IrqSpinLock`], which pairs a spinlock with interrupt-flag
//! save/restore so fault-context code can take the same locks as thread
//! context without deadlocking on this single-CPU design.

mod spinlock;

pub use spinlock::{IrqSpinLock, IrqSpinLockGuard};
