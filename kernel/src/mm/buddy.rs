//! Buddy allocator
//!
//! Power-of-two block allocator over a single virtually contiguous region
//! of the kernel heap, mapped in the higher half at a fixed offset from its
//! physical backing. Free blocks of each order live on intrusive free lists
//! threaded through the free memory itself; a buddy pair differs only in
//! the bit `1 << order` of its address, which is what makes the coalescing
//! walk in [`BuddyAllocator::free_raw`] work.
//!
//! `alloc`/`free` carry an order tag in a small header ahead of the user
//! pointer so callers do not need to remember sizes; `alloc_raw`/`free_raw`
//! skip the header for callers that track the order themselves (page-table
//! frames, slab pages).

use core::ptr::NonNull;

use log::debug;
#[cfg(debug_assertions)]
use log::{error, warn};

use super::{PhysMap, PhysicalAddress, VirtualAddress};
use crate::sync::IrqSpinLock;

/// Smallest block: 32 bytes.
pub const MIN_ORDER: usize = 5;
/// Largest block: 4 MiB.
pub const MAX_ORDER: usize = 22;
/// Order of one 4 KiB page.
pub const PAGE_ORDER: usize = 12;

const NUM_ORDERS: usize = MAX_ORDER - MIN_ORDER + 1;

/// Space reserved ahead of `alloc` pointers. Only the first byte (the order
/// tag) and, in debug builds, the start canary are used; the full slot
/// keeps user pointers 8-aligned.
const HEADER_SIZE: usize = 8;

/// Debug builds reserve the block's last four bytes for the end canary.
const FOOTER_SIZE: usize = if cfg!(debug_assertions) { 4 } else { 0 };

#[cfg(debug_assertions)]
const CANARY_START: u32 = 0xDEAD_BEEF;
#[cfg(debug_assertions)]
const CANARY_END: u32 = 0xCAFE_BABE;

/// Intrusive free-list node written into the first bytes of a free block.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Allocator statistics. `free_per_order` is a snapshot of free-list
/// lengths, cheap enough to recompute on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub managed_bytes: usize,
    pub free_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub failed_allocs: u64,
    pub free_per_order: [usize; NUM_ORDERS],
}

#[cfg(debug_assertions)]
const TRACKER_CAPACITY: usize = 1024;

/// Debug-build allocation tracker: records the allocation site of every
/// live `alloc` pointer so leaks can be dumped by address.
#[cfg(debug_assertions)]
struct DebugTracker {
    entries: [Option<TrackerRecord>; TRACKER_CAPACITY],
    overflowed: bool,
}

#[cfg(debug_assertions)]
#[derive(Clone, Copy)]
struct TrackerRecord {
    user_ptr: usize,
    order: u8,
    location: &'static core::panic::Location<'static>,
}

#[cfg(debug_assertions)]
impl DebugTracker {
    const fn new() -> Self {
        Self {
            entries: [None; TRACKER_CAPACITY],
            overflowed: false,
        }
    }

    fn record(
        &mut self,
        user_ptr: usize,
        order: usize,
        location: &'static core::panic::Location<'static>,
    ) {
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(TrackerRecord {
                    user_ptr,
                    order: order as u8,
                    location,
                });
                return;
            }
        }
        if !self.overflowed {
            self.overflowed = true;
            warn!("buddy: debug tracker full, further allocations untracked");
        }
    }

    /// Removes the record for `user_ptr`. Returns false when the pointer
    /// was never recorded (or already released): a double free, unless the
    /// tracker overflowed earlier.
    fn release(&mut self, user_ptr: usize) -> bool {
        for slot in self.entries.iter_mut() {
            if let Some(rec) = slot {
                if rec.user_ptr == user_ptr {
                    *slot = None;
                    return true;
                }
            }
        }
        self.overflowed
    }

    fn dump(&self) {
        for rec in self.entries.iter().flatten() {
            error!(
                "buddy: leaked {:#x} (order {}) allocated at {}",
                rec.user_ptr, rec.order, rec.location
            );
        }
    }
}

struct BuddyInner {
    /// Managed virtual range, aligned up to `MAX_ORDER` block alignment.
    virt_base: usize,
    virt_end: usize,
    /// Physical address backing `virt_base`.
    phys_base: usize,
    free_lists: [*mut FreeNode; NUM_ORDERS],
    managed_bytes: usize,
    free_bytes: usize,
    alloc_count: u64,
    free_count: u64,
    failed_allocs: u64,
    #[cfg(debug_assertions)]
    tracker: DebugTracker,
}

// SAFETY: All access to the raw free-list pointers goes through the
// enclosing IrqSpinLock; the pointed-to memory is the allocator's own
// managed region.
unsafe impl Send for BuddyInner {}

/// Size of a block of the given order.
const fn block_size(order: usize) -> usize {
    1 << order
}

/// Smallest order whose block fits `size` bytes.
fn order_for(size: usize) -> Option<usize> {
    if size == 0 || size > block_size(MAX_ORDER) {
        return None;
    }
    let order = size.next_power_of_two().trailing_zeros() as usize;
    Some(order.max(MIN_ORDER))
}

impl BuddyInner {
    fn list_index(order: usize) -> usize {
        debug_assert!((MIN_ORDER..=MAX_ORDER).contains(&order));
        order - MIN_ORDER
    }

    /// Push a block onto its free list.
    ///
    /// # Safety
    ///
    /// `addr` must be an aligned, unused block of `order` inside the
    /// managed range.
    unsafe fn push_free(&mut self, addr: usize, order: usize) {
        let idx = Self::list_index(order);
        let node = addr as *mut FreeNode;
        // SAFETY: The block is free, so the allocator owns its bytes.
        unsafe {
            (*node).next = self.free_lists[idx];
        }
        self.free_lists[idx] = node;
    }

    /// Pop the head of the free list for `order`, if any.
    fn pop_free(&mut self, order: usize) -> Option<usize> {
        let idx = Self::list_index(order);
        let head = self.free_lists[idx];
        if head.is_null() {
            return None;
        }
        // SAFETY: Non-null nodes on a free list always point into managed,
        // free memory written by push_free.
        self.free_lists[idx] = unsafe { (*head).next };
        Some(head as usize)
    }

    /// Unlink a specific block from the free list for `order`. Returns
    /// whether the block was present.
    fn unlink_free(&mut self, addr: usize, order: usize) -> bool {
        let idx = Self::list_index(order);
        let mut cursor: *mut *mut FreeNode = &mut self.free_lists[idx];
        // SAFETY: `cursor` always points either at the list head slot or at
        // the `next` field of a node on the list, both owned by us under
        // the allocator lock.
        unsafe {
            while !(*cursor).is_null() {
                if *cursor as usize == addr {
                    *cursor = (**cursor).next;
                    return true;
                }
                cursor = &mut (**cursor).next;
            }
        }
        false
    }

    /// Core allocation: find a block of at least `order`, splitting larger
    /// blocks downward.
    fn alloc_order(&mut self, order: usize) -> Option<usize> {
        let mut found = None;
        for o in order..=MAX_ORDER {
            if let Some(addr) = self.pop_free(o) {
                found = Some((addr, o));
                break;
            }
        }
        let (addr, mut have) = match found {
            Some(f) => f,
            None => {
                self.failed_allocs += 1;
                return None;
            }
        };
        // Split down, parking the upper halves.
        while have > order {
            have -= 1;
            let upper = addr + block_size(have);
            // SAFETY: `upper` is the second half of a block we own.
            unsafe {
                self.push_free(upper, have);
            }
        }
        self.free_bytes -= block_size(order);
        self.alloc_count += 1;
        Some(addr)
    }

    /// Core free: coalesce with free buddies as far as possible, then park
    /// the result.
    fn free_order(&mut self, addr: usize, order: usize) {
        let mut addr = addr;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = addr ^ block_size(order);
            if buddy < self.virt_base || buddy + block_size(order) > self.virt_end {
                break;
            }
            if !self.unlink_free(buddy, order) {
                break;
            }
            addr = addr.min(buddy);
            order += 1;
        }
        // SAFETY: The caller passed ownership of the block; coalescing only
        // grew it by absorbing blocks popped off our own free lists.
        unsafe {
            self.push_free(addr, order);
        }
        self.free_bytes += block_size(order);
        self.free_count += 1;
    }

    fn check_block(&self, addr: usize, order: usize) {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            panic!("buddy: free with invalid order {}", order);
        }
        if addr < self.virt_base || addr + block_size(order) > self.virt_end {
            panic!("buddy: free of out-of-range block {:#x}", addr);
        }
        if addr & (block_size(order) - 1) != 0 {
            panic!("buddy: free of {:#x} misaligned for order {}", addr, order);
        }
    }
}

/// The buddy allocator. One instance manages the kernel heap; tests build
/// instances over host arenas.
pub struct BuddyAllocator {
    inner: IrqSpinLock<BuddyInner>,
}

impl BuddyAllocator {
    /// Build an allocator over `[virt_base, virt_base + size)`, backed by
    /// physical memory starting at `phys_base`.
    ///
    /// The base is aligned up to `MAX_ORDER` block alignment and the range
    /// is carved greedily into the largest aligned power-of-two blocks;
    /// residual bytes below `MIN_ORDER` granularity are abandoned.
    ///
    /// # Safety
    ///
    /// The virtual range must be mapped, writable, and exclusively owned by
    /// the new allocator for its entire lifetime.
    pub unsafe fn init(virt_base: usize, phys_base: usize, size: usize) -> Self {
        let align = block_size(MAX_ORDER);
        let aligned_base = (virt_base + align - 1) & !(align - 1);
        let skipped = aligned_base - virt_base;
        let end = virt_base + size;
        if skipped > 0 {
            debug!("buddy: skipping {} bytes below aligned base", skipped);
        }

        let mut inner = BuddyInner {
            virt_base: aligned_base,
            virt_end: end.max(aligned_base),
            phys_base: phys_base + skipped,
            free_lists: [core::ptr::null_mut(); NUM_ORDERS],
            managed_bytes: 0,
            free_bytes: 0,
            alloc_count: 0,
            free_count: 0,
            failed_allocs: 0,
            #[cfg(debug_assertions)]
            tracker: DebugTracker::new(),
        };

        // Greedy carve: at each step take the largest block that is both
        // aligned at `cursor` and fits in the remainder.
        let mut cursor = aligned_base;
        while cursor + block_size(MIN_ORDER) <= end {
            let align_order = (cursor.trailing_zeros() as usize).min(MAX_ORDER);
            let mut order = align_order;
            while order > MIN_ORDER && cursor + block_size(order) > end {
                order -= 1;
            }
            if cursor + block_size(order) > end {
                break;
            }
            // SAFETY: [cursor, cursor + 2^order) is unused managed memory.
            unsafe {
                inner.push_free(cursor, order);
            }
            inner.managed_bytes += block_size(order);
            inner.free_bytes += block_size(order);
            cursor += block_size(order);
        }
        let residual = end.saturating_sub(cursor);
        if residual > 0 {
            debug!("buddy: abandoning {} residual bytes", residual);
        }

        Self {
            inner: IrqSpinLock::new(inner),
        }
    }

    /// Allocate at least `size` bytes. The returned pointer is offset past
    /// an internal header recording the block order. Returns `None` on OOM
    /// or a zero/oversized request.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        #[cfg(debug_assertions)]
        let location = core::panic::Location::caller();
        if size == 0 {
            return None;
        }
        let order = match size
            .checked_add(HEADER_SIZE + FOOTER_SIZE)
            .and_then(order_for)
        {
            Some(o) => o,
            None => {
                self.inner.lock().failed_allocs += 1;
                return None;
            }
        };
        let mut inner = self.inner.lock();
        let base = inner.alloc_order(order)?;
        // SAFETY: `base` is an exclusively owned block of 2^order bytes.
        unsafe {
            (base as *mut u8).write(order as u8);
            #[cfg(debug_assertions)]
            {
                ((base + 4) as *mut u32).write(CANARY_START);
                ((base + block_size(order) - 4) as *mut u32).write(CANARY_END);
                inner.tracker.record(base + HEADER_SIZE, order, location);
            }
        }
        drop(inner);
        NonNull::new((base + HEADER_SIZE) as *mut u8)
    }

    /// Free a pointer obtained from [`Self::alloc`].
    ///
    /// Panics on an out-of-range pointer, a block misaligned for its
    /// recorded order, or (debug builds) canary mismatch and double free.
    pub fn free(&self, ptr: NonNull<u8>) {
        let user = ptr.as_ptr() as usize;
        let base = user - HEADER_SIZE;
        let mut inner = self.inner.lock();
        if base < inner.virt_base || base >= inner.virt_end {
            panic!("buddy: free of out-of-range pointer {:#x}", user);
        }
        // SAFETY: `base` is in the managed range; the header byte was
        // written by alloc.
        let order = unsafe { (base as *const u8).read() } as usize;
        inner.check_block(base, order);
        #[cfg(debug_assertions)]
        {
            // SAFETY: check_block verified the extents.
            let (start, end_canary) = unsafe {
                (
                    ((base + 4) as *const u32).read(),
                    ((base + block_size(order) - 4) as *const u32).read(),
                )
            };
            if start != CANARY_START || end_canary != CANARY_END {
                panic!(
                    "buddy: canary mismatch on {:#x} (start {:#x}, end {:#x})",
                    user, start, end_canary
                );
            }
            if !inner.tracker.release(user) {
                panic!("buddy: double free of {:#x}", user);
            }
        }
        inner.free_order(base, order);
    }

    /// Allocate one naturally-aligned block of exactly `2^order` bytes, no
    /// header. The caller must remember the order for [`Self::free_raw`].
    pub fn alloc_raw(&self, order: usize) -> Option<NonNull<u8>> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            self.inner.lock().failed_allocs += 1;
            return None;
        }
        let addr = self.inner.lock().alloc_order(order)?;
        NonNull::new(addr as *mut u8)
    }

    /// Free a block obtained from [`Self::alloc_raw`].
    pub fn free_raw(&self, ptr: NonNull<u8>, order: usize) {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();
        inner.check_block(addr, order);
        inner.free_order(addr, order);
    }

    /// Allocate one 4 KiB page (a raw order-12 block).
    pub fn alloc_page(&self) -> Option<NonNull<u8>> {
        self.alloc_raw(PAGE_ORDER)
    }

    /// Free one 4 KiB page.
    pub fn free_page(&self, ptr: NonNull<u8>) {
        self.free_raw(ptr, PAGE_ORDER);
    }

    pub fn stats(&self) -> BuddyStats {
        let inner = self.inner.lock();
        let mut free_per_order = [0usize; NUM_ORDERS];
        for (idx, head) in inner.free_lists.iter().enumerate() {
            let mut node = *head;
            while !node.is_null() {
                free_per_order[idx] += 1;
                // SAFETY: Free-list nodes are valid while the lock is held.
                node = unsafe { (*node).next };
            }
        }
        BuddyStats {
            managed_bytes: inner.managed_bytes,
            free_bytes: inner.free_bytes,
            alloc_count: inner.alloc_count,
            free_count: inner.free_count,
            failed_allocs: inner.failed_allocs,
            free_per_order,
        }
    }

    /// The fixed virt/phys offset mapping covering the managed region.
    pub fn phys_map(&self) -> PhysMap {
        let inner = self.inner.lock();
        PhysMap::new(inner.virt_base, inner.phys_base)
    }

    /// Physical range backing the managed region.
    pub fn phys_range(&self) -> core::ops::Range<usize> {
        let inner = self.inner.lock();
        inner.phys_base..inner.phys_base + (inner.virt_end - inner.virt_base)
    }

    /// Whether `ptr` points into the managed region.
    pub fn contains(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        addr >= inner.virt_base && addr < inner.virt_end
    }

    /// Physical address backing a pointer into the managed region.
    pub fn virt_to_phys(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let inner = self.inner.lock();
        let addr = vaddr.as_usize();
        if addr < inner.virt_base || addr >= inner.virt_end {
            return None;
        }
        Some(PhysicalAddress::new(addr - inner.virt_base + inner.phys_base))
    }

    /// Virtual address of a physical location inside the managed region.
    pub fn phys_to_virt(&self, paddr: PhysicalAddress) -> Option<VirtualAddress> {
        let inner = self.inner.lock();
        let addr = paddr.as_usize();
        let size = inner.virt_end - inner.virt_base;
        if addr < inner.phys_base || addr >= inner.phys_base + size {
            return None;
        }
        Some(VirtualAddress::new(addr - inner.phys_base + inner.virt_base))
    }

    /// Log every live tracked allocation. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn dump_leaks(&self) {
        self.inner.lock().tracker.dump();
    }
}
