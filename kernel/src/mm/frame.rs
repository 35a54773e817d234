//! Physical frame reference counting
//!
//! One `u32` counter per 4 KiB frame of physical memory, allocated out of
//! the buddy heap at init. A frame is free exactly when its counter is
//! zero; the 1→0 transition hands the frame back to the buddy. Counters
//! saturate instead of wrapping, and a saturated counter pins its frame
//! forever (losing a frame beats freeing one that is still referenced).

use core::ops::Range;

use log::{debug, error, warn};

use super::{
    buddy::{BuddyAllocator, MIN_ORDER},
    FrameNumber, PhysicalAddress, FRAME_SIZE,
};
use crate::{boot::BootInfo, sync::IrqSpinLock};

struct FrameTableInner {
    /// Counter array, one per frame, allocated from the buddy.
    counts: *mut u32,
    /// Number of frames covered (PFN 0 up to the highest available frame).
    len: usize,
}

// SAFETY: The raw counter array is only touched under the table lock.
unsafe impl Send for FrameTableInner {}

/// Global frame reference-count table.
pub struct FrameTable {
    buddy: &'static BuddyAllocator,
    inner: IrqSpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Build the table from the boot memory map.
    ///
    /// Every frame starts reserved (count 1); frames inside `AVAILABLE`
    /// regions are then cleared to 0; finally the first MiB, the kernel
    /// image, the counter array itself, and anything else already spoken
    /// for are re-marked reserved. Frames inside `heap` stay at 0: they
    /// are under buddy control and the free-iff-zero invariant has to hold
    /// for them.
    pub fn init(
        buddy: &'static BuddyAllocator,
        boot: &BootInfo<'_>,
        heap: Range<usize>,
    ) -> Self {
        let max_phys = boot.memory_map.highest_available_addr().min(u32::MAX as u64);
        let len = max_phys.div_ceil(FRAME_SIZE as u64) as usize;
        let bytes = len * core::mem::size_of::<u32>();
        let order = bytes
            .next_power_of_two()
            .trailing_zeros()
            .max(MIN_ORDER as u32) as usize;
        let block = buddy
            .alloc_raw(order)
            .expect("no room for the frame refcount table");
        let counts = block.as_ptr() as *mut u32;

        // SAFETY: The block spans at least `len` u32 slots and is
        // exclusively ours.
        unsafe {
            // (i) everything reserved
            for i in 0..len {
                counts.add(i).write(1);
            }
            // (ii) available regions become free
            for entry in boot.memory_map.entries() {
                if !entry.is_available() {
                    continue;
                }
                let first = entry.base_addr.div_ceil(FRAME_SIZE as u64) as usize;
                let last = (entry.end().min(u32::MAX as u64) / FRAME_SIZE as u64) as usize;
                for pfn in first..last.min(len) {
                    counts.add(pfn).write(0);
                }
            }
        }

        let table = Self {
            buddy,
            inner: IrqSpinLock::new(FrameTableInner { counts, len }),
        };

        // (iii) re-reserve what is already in use. The heap itself is
        // deliberately left free; see the type-level comment.
        table.mark_range_reserved(0..0x10_0000);
        table.mark_range_reserved(boot.kernel_start..boot.kernel_end);
        debug!(
            "frame: heap {:#x}..{:#x} stays under buddy control",
            heap.start, heap.end
        );
        if let Some(table_phys) = buddy.virt_to_phys(super::VirtualAddress::new(counts as usize)) {
            let table_start = table_phys.as_usize();
            table.mark_range_reserved(table_start..table_start + (1usize << order));
        }

        debug!(
            "frame: tracking {} frames ({} KiB of counters)",
            len,
            bytes / 1024
        );
        table
    }

    /// Force every frame covering `phys_range` to the reserved state.
    pub fn mark_range_reserved(&self, phys_range: Range<usize>) {
        let inner = self.inner.lock();
        let first = phys_range.start / FRAME_SIZE;
        let last = phys_range.end.div_ceil(FRAME_SIZE);
        for pfn in first..last.min(inner.len) {
            // SAFETY: pfn < len, so the slot is inside the counter array.
            unsafe {
                inner.counts.add(pfn).write(1);
            }
        }
    }

    /// Allocate one frame: take a page from the buddy and mark it owned.
    pub fn frame_alloc(&self) -> Option<PhysicalAddress> {
        let page = self.buddy.alloc_page()?;
        let phys = self
            .buddy
            .virt_to_phys(super::VirtualAddress::new(page.as_ptr() as usize))
            .expect("buddy page must map back to a physical address");
        let inner = self.inner.lock();
        let pfn = phys.frame_number().as_usize();
        if pfn < inner.len {
            // SAFETY: pfn bounds-checked against the array length.
            unsafe {
                let slot = inner.counts.add(pfn);
                if slot.read() != 0 {
                    warn!(
                        "frame: {:#x} had refcount {} on alloc",
                        phys.as_usize(),
                        slot.read()
                    );
                }
                slot.write(1);
            }
        }
        Some(phys)
    }

    /// Take another reference on a frame. Saturates at `u32::MAX`.
    pub fn get_frame(&self, phys: PhysicalAddress) {
        let inner = self.inner.lock();
        let pfn = phys.frame_number().as_usize();
        if pfn >= inner.len {
            return;
        }
        // SAFETY: pfn bounds-checked.
        unsafe {
            let slot = inner.counts.add(pfn);
            let count = slot.read();
            if count == u32::MAX {
                error!("frame: refcount saturated for {:#x}", phys.as_usize());
            } else {
                slot.write(count + 1);
            }
        }
    }

    /// Drop a reference; on 1→0 the frame goes back to the buddy.
    pub fn put_frame(&self, phys: PhysicalAddress) {
        let inner = self.inner.lock();
        let pfn = phys.frame_number().as_usize();
        if pfn >= inner.len {
            return;
        }
        // SAFETY: pfn bounds-checked.
        let now_free = unsafe {
            let slot = inner.counts.add(pfn);
            let count = slot.read();
            match count {
                0 => {
                    error!("frame: put_frame on free frame {:#x}", phys.as_usize());
                    false
                }
                u32::MAX => {
                    // Saturated counters are pinned for good.
                    false
                }
                _ => {
                    slot.write(count - 1);
                    count == 1
                }
            }
        };
        drop(inner);
        if now_free {
            if let Some(vaddr) = self.buddy.phys_to_virt(phys) {
                if let Some(ptr) = core::ptr::NonNull::new(vaddr.as_usize() as *mut u8) {
                    self.buddy.free_page(ptr);
                }
            } else {
                // A counted frame outside the heap (e.g. boot-mapped) has
                // nowhere to go; it just stays unusable.
                warn!(
                    "frame: freed frame {:#x} is outside the buddy heap",
                    phys.as_usize()
                );
            }
        }
    }

    /// Drop one reference on each frame of a physically contiguous region.
    /// Used for 4 MiB mappings, which are torn down as a unit.
    pub fn put_frame_region(&self, start: PhysicalAddress, size: usize) {
        let mut phys = start.as_usize();
        let end = phys + size;
        while phys < end {
            self.put_frame(PhysicalAddress::new(phys));
            phys += FRAME_SIZE;
        }
    }

    /// Current reference count, or 0 for out-of-range addresses.
    pub fn refcount(&self, phys: PhysicalAddress) -> u32 {
        let inner = self.inner.lock();
        let pfn = phys.frame_number().as_usize();
        if pfn >= inner.len {
            return 0;
        }
        // SAFETY: pfn bounds-checked.
        unsafe { inner.counts.add(pfn).read() }
    }

    /// Number of frames the table covers.
    pub fn frame_count(&self) -> usize {
        self.inner.lock().len
    }

    pub fn frame_number(&self, phys: PhysicalAddress) -> FrameNumber {
        phys.frame_number()
    }
}
