//! Host-side test scaffolding
//!
//! Compiled only off-target. Provides an aligned arena standing in for the
//! higher-half-mapped kernel heap, a synthetic Multiboot2 memory map
//! describing it, and a helper that wires up the full memory stack the way
//! `mm::init` does on hardware. Unit tests and the integration tests both
//! build on this, so the allocators run against real, dereferencable
//! memory on the host too.

use core::alloc::Layout;

use crate::boot::{BootInfo, MemoryMapTag};

use super::{frame::FrameTable, kmalloc::KernelAllocator, paging::Paging, BuddyAllocator};

/// Fake physical base for the arena: 16 MiB, comfortably above the
/// synthetic kernel image.
pub const TEST_PHYS_BASE: usize = 0x0100_0000;

/// A page-aligned block of host memory posing as the kernel heap region.
pub struct TestArena {
    ptr: *mut u8,
    layout: Layout,
}

impl TestArena {
    pub fn new(size: usize) -> Self {
        // 4 MiB alignment keeps virt/phys congruent modulo the large-page
        // size, exactly as the fixed higher-half offset does on hardware.
        let layout =
            Layout::from_size_align(size, super::paging::LARGE_PAGE_SIZE).expect("arena layout");
        // SAFETY: size is non-zero in every caller; the allocation is owned
        // by the returned arena and freed in Drop.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "test arena allocation failed");
        Self { ptr, layout }
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn fake_phys_base(&self) -> usize {
        TEST_PHYS_BASE
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        // SAFETY: Allocated in new() with the stored layout.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

// SAFETY: The arena is plain memory; the allocators built over it do their
// own locking.
unsafe impl Send for TestArena {}
unsafe impl Sync for TestArena {}

/// Build a leaked Multiboot2 memory-map tag image: a low 640 KiB region
/// plus one available region covering `[TEST_PHYS_BASE, TEST_PHYS_BASE +
/// arena_len)`.
pub fn leaked_boot_info(arena_len: usize) -> BootInfo<'static> {
    let stride = 24usize;
    let entries: [(u64, u64, u32); 2] = [
        (0, 0x9F000, 1),
        (TEST_PHYS_BASE as u64, arena_len as u64, 1),
    ];
    let size = 16 + stride * entries.len();
    // u64 storage keeps the tag 8-aligned like a real info block.
    let mut words = std::vec![0u64; size.div_ceil(8)];
    // SAFETY: Viewing owned u64 storage as bytes.
    let buf = unsafe {
        core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8)
    };
    buf[0..4].copy_from_slice(&6u32.to_le_bytes());
    buf[4..8].copy_from_slice(&(size as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&(stride as u32).to_le_bytes());
    for (i, &(base, len, typ)) in entries.iter().enumerate() {
        let off = 16 + i * stride;
        buf[off..off + 8].copy_from_slice(&base.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&len.to_le_bytes());
        buf[off + 16..off + 20].copy_from_slice(&typ.to_le_bytes());
    }
    let leaked: &'static [u64] = std::vec::Vec::leak(words);
    // SAFETY: The leaked buffer holds a complete tag and lives forever.
    let tag = unsafe { MemoryMapTag::from_ptr(leaked.as_ptr() as *const u8) };
    BootInfo {
        memory_map: tag,
        kernel_start: 0x10_0000,
        kernel_end: 0x30_0000,
    }
}

/// The full memory stack over a fresh arena, wired the same way
/// `mm::init` wires it on hardware.
pub struct TestStack {
    pub buddy: &'static BuddyAllocator,
    pub frames: &'static FrameTable,
    pub paging: &'static Paging,
    pub kmalloc: &'static KernelAllocator,
}

impl TestStack {
    pub fn new(arena_bytes: usize) -> Self {
        let arena = TestArena::new(arena_bytes);
        let boot = leaked_boot_info(arena.len());
        // SAFETY: The arena is exclusively owned and leaked below, so the
        // buddy's claim on it holds for 'static.
        let buddy: &'static BuddyAllocator = std::boxed::Box::leak(std::boxed::Box::new(unsafe {
            BuddyAllocator::init(arena.base(), arena.fake_phys_base(), arena.len())
        }));
        std::mem::forget(arena);

        let heap = TEST_PHYS_BASE..TEST_PHYS_BASE + arena_bytes;
        let frames: &'static FrameTable =
            std::boxed::Box::leak(std::boxed::Box::new(FrameTable::init(buddy, &boot, heap)));
        let kmalloc: &'static KernelAllocator =
            std::boxed::Box::leak(std::boxed::Box::new(KernelAllocator::new(buddy)));
        let paging: &'static Paging =
            std::boxed::Box::leak(std::boxed::Box::new(Paging::init(buddy, frames)));
        Self {
            buddy,
            frames,
            paging,
            kmalloc,
        }
    }
}
