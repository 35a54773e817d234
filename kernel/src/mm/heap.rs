//! Kernel heap bridge
//!
//! Connects Rust's `alloc` machinery to the memory stack. Before
//! `mm::init` completes, allocations come from a small static boot region
//! managed by `linked_list_allocator`; afterwards everything with standard
//! alignment goes through the kmalloc facade, and oversized alignments go
//! straight to the buddy. `dealloc` routes by provenance: pointers inside
//! the boot region always go back to the boot heap, whenever they are
//! freed.

use core::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use linked_list_allocator::Heap;

use super::kmalloc::MIN_ALIGN;
use crate::sync::IrqSpinLock;

/// Boot heap: enough for early metadata (the leaked allocator structs,
/// log buffers) before the buddy exists.
const BOOT_HEAP_SIZE: usize = 256 * 1024;

struct BootSpace(UnsafeCell<MaybeUninit<[u8; BOOT_HEAP_SIZE]>>);

// SAFETY: The backing bytes are only handed to the boot Heap, which is
// behind a lock.
unsafe impl Sync for BootSpace {}

static BOOT_SPACE: BootSpace = BootSpace(UnsafeCell::new(MaybeUninit::uninit()));

/// Flipped by `mm::init` once the kmalloc facade is usable.
static USE_KMALLOC: AtomicBool = AtomicBool::new(false);

/// Route post-boot allocations to the kmalloc facade.
pub fn switch_to_kmalloc() {
    USE_KMALLOC.store(true, Ordering::Release);
}

/// The bare-metal global allocator.
pub struct KernelHeap {
    boot: IrqSpinLock<Heap>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            boot: IrqSpinLock::new(Heap::empty()),
        }
    }

    fn boot_range(&self) -> (usize, usize) {
        let base = BOOT_SPACE.0.get() as usize;
        (base, base + BOOT_HEAP_SIZE)
    }

    fn boot_alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.boot.lock();
        if heap.size() == 0 {
            let (base, _) = self.boot_range();
            // SAFETY: BOOT_SPACE is static, exclusively owned by this heap,
            // and initialized exactly once under the lock.
            unsafe {
                heap.init(base as *mut u8, BOOT_HEAP_SIZE);
            }
        }
        heap.allocate_first_fit(layout)
            .map(NonNull::as_ptr)
            .unwrap_or(core::ptr::null_mut())
    }

    /// Order of the raw buddy block used for an oversized-alignment layout.
    fn oversized_order(layout: Layout) -> usize {
        let size = layout.size().max(layout.align()).max(1);
        let order = size.next_power_of_two().trailing_zeros() as usize;
        order.max(super::buddy::MIN_ORDER)
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: alloc/dealloc keep the three backing allocators' invariants:
// every pointer is returned to the allocator that produced it, routed by
// boot-region provenance, alignment class, and init state.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !USE_KMALLOC.load(Ordering::Acquire) || !super::is_initialized() {
            return self.boot_alloc(layout);
        }
        let stack = super::memory();
        if layout.align() <= MIN_ALIGN {
            return stack
                .kmalloc
                .kmalloc(layout.size().max(1))
                .map(NonNull::as_ptr)
                .unwrap_or(core::ptr::null_mut());
        }
        // Oversized alignment: a naturally-aligned raw buddy block.
        stack
            .buddy
            .alloc_raw(Self::oversized_order(layout))
            .map(NonNull::as_ptr)
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as usize;
        let (boot_start, boot_end) = self.boot_range();
        if addr >= boot_start && addr < boot_end {
            // SAFETY: The pointer came from the boot heap with this layout.
            unsafe {
                self.boot
                    .lock()
                    .deallocate(NonNull::new_unchecked(ptr), layout);
            }
            return;
        }
        let stack = super::memory();
        let nn = match NonNull::new(ptr) {
            Some(p) => p,
            None => return,
        };
        if layout.align() <= MIN_ALIGN {
            // SAFETY: Same routing as alloc: this pointer came from kmalloc.
            unsafe { stack.kmalloc.kfree(nn) }
        } else {
            stack.buddy.free_raw(nn, Self::oversized_order(layout));
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn boot_heap_serves_before_init() {
        let heap = KernelHeap::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let a = heap.boot_alloc(layout);
        assert!(!a.is_null());
        let b = heap.boot_alloc(layout);
        assert!(!b.is_null());
        assert_ne!(a, b);
        // SAFETY: Both came from the boot heap with this layout.
        unsafe {
            heap.boot
                .lock()
                .deallocate(NonNull::new_unchecked(a), layout);
            heap.boot
                .lock()
                .deallocate(NonNull::new_unchecked(b), layout);
        }
    }

    #[test]
    fn oversized_order_covers_alignment() {
        let layout = Layout::from_size_align(100, 4096).unwrap();
        assert_eq!(KernelHeap::oversized_order(layout), 12);
        let layout = Layout::from_size_align(10000, 16).unwrap();
        assert_eq!(KernelHeap::oversized_order(layout), 14);
    }
}
