//! IRQ-save/restore spinlock

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use spin::{Mutex, MutexGuard};

use crate::arch;

/// A spinlock that disables interrupts for the duration of the critical
/// section and restores the previous interrupt state on unlock.
///
/// The memory subsystem's locks are all of this kind: the page-fault path
/// runs with the same locks as ordinary kernel code, so letting an IRQ
/// preempt a critical section and re-enter the allocator would deadlock.
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let flags = arch::interrupts_save_disable();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            flags,
        }
    }

    /// Access without locking. Only sound before secondary contexts exist
    /// (single-threaded init) or in test harness teardown.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    flags: u32,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before interrupts come back on, or an
        // IRQ taken here could spin on a lock its own CPU still holds.
        // SAFETY: `guard` is never touched again after this drop.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        arch::interrupts_restore(self.flags);
    }
}
