//! Memory management
//!
//! The layered memory stack, leaves first:
//!
//! - [`buddy`] — power-of-two block allocator over the kernel heap
//! - [`frame`] — per-frame reference counts for all of physical memory
//! - [`slab`] — fixed-size object caches on top of the buddy
//! - [`kmalloc`] — the general-purpose allocator facade
//! - [`heap`] — bridges Rust `alloc` onto the facade
//! - [`paging`] — IA-32 two-level page tables with PSE
//! - [`rbtree`] / [`vma`] — per-process address spaces as interval trees
//! - [`fault`] — the page-fault dispatcher
//! - [`user`] — validated, fault-tolerant user-memory access

pub mod buddy;
pub mod fault;
pub mod frame;
pub mod heap;
pub mod kmalloc;
pub mod paging;
pub mod rbtree;
pub mod slab;
pub mod user;
pub mod vma;

#[cfg(not(target_os = "none"))]
pub mod test_support;

use core::sync::atomic::{AtomicPtr, Ordering};

use log::info;

pub use buddy::{BuddyAllocator, BuddyStats, MAX_ORDER, MIN_ORDER, PAGE_ORDER};
pub use frame::FrameTable;
pub use kmalloc::KernelAllocator;
pub use paging::{Paging, PteFlags};
pub use vma::{AddressSpace, VmFlags};

use crate::boot::BootInfo;

/// Size of one page / physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = PAGE_SIZE;

/// Base of the kernel half of every address space. Physical memory is
/// mapped here at a fixed offset, so `virt = phys + KERNEL_VIRT_BASE` for
/// everything the kernel heap manages.
pub const KERNEL_VIRT_BASE: usize = 0xC000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn frame_number(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_kernel(&self) -> bool {
        self.0 >= KERNEL_VIRT_BASE
    }
}

/// Physical frame number: `phys / 4096`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn new(num: usize) -> Self {
        Self(num)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE)
    }
}

/// Fixed-offset translation between kernel virtual addresses and the
/// physical memory backing them.
///
/// On hardware the offset is [`KERNEL_VIRT_BASE`]; host tests derive one
/// from their arena so frame contents are real, dereferencable memory
/// either way. Only addresses inside the buddy-managed region round-trip;
/// the translation itself is a pure offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMap {
    offset: usize,
}

impl PhysMap {
    pub fn new(virt_base: usize, phys_base: usize) -> Self {
        Self {
            offset: virt_base.wrapping_sub(phys_base),
        }
    }

    /// The hardware mapping: physical memory at `KERNEL_VIRT_BASE`.
    pub const fn kernel() -> Self {
        Self {
            offset: KERNEL_VIRT_BASE,
        }
    }

    pub fn phys_to_virt(&self, paddr: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(paddr.as_usize().wrapping_add(self.offset))
    }

    pub fn virt_to_phys(&self, vaddr: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(vaddr.as_usize().wrapping_sub(self.offset))
    }
}

/// The initialized memory stack: every subsystem, wired together.
pub struct MemoryStack {
    pub buddy: &'static BuddyAllocator,
    pub frames: &'static FrameTable,
    pub paging: &'static Paging,
    pub kmalloc: &'static KernelAllocator,
}

static MEMORY: spin::Once<MemoryStack> = spin::Once::new();

/// The address space of the currently running process, consulted by the
/// fault dispatcher and the user-access layer. Set by the scheduler on
/// address-space switch.
static CURRENT_MM: AtomicPtr<AddressSpace> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_current_mm(mm: &'static AddressSpace) {
    CURRENT_MM.store(mm as *const _ as *mut _, Ordering::Release);
}

pub fn current_mm() -> Option<&'static AddressSpace> {
    let ptr = CURRENT_MM.load(Ordering::Acquire);
    // SAFETY: The pointer is only ever set from a &'static AddressSpace.
    unsafe { ptr.cast_const().as_ref() }
}

/// Access the initialized memory stack.
///
/// Panics before [`init`] has run; the memory stack is the first subsystem
/// brought up after the console.
pub fn memory() -> &'static MemoryStack {
    MEMORY
        .get()
        .expect("mm::memory() called before mm::init()")
}

pub fn is_initialized() -> bool {
    MEMORY.get().is_some()
}

/// Bring up the whole memory stack from the boot memory map.
///
/// Order matters and mirrors the dependency graph: buddy over the largest
/// usable region, frame table (which reserves everything already spoken
/// for), kmalloc caches, then kernel paging.
///
/// # Safety
///
/// Must be called exactly once, on the boot CPU, while the boot identity
/// and higher-half mappings from the loader are still active.
pub unsafe fn init(boot: &BootInfo<'_>) -> &'static MemoryStack {
    // Pick the largest available region that starts at or above 1 MiB for
    // the kernel heap; carve out the part the kernel image occupies.
    let mut heap_start = 0usize;
    let mut heap_size = 0usize;
    for entry in boot.memory_map.entries() {
        if !entry.is_available() || entry.end() <= 0x10_0000 {
            continue;
        }
        let start = (entry.base_addr as usize).max(0x10_0000).max(boot.kernel_end);
        // The higher-half window covers physical memory below 1 GiB, and
        // the top 4 MiB of virtual space is the temp-mapping band.
        let end = entry.end().min(0x3FC0_0000) as usize;
        if end > start && end - start > heap_size {
            heap_start = start;
            heap_size = end - start;
        }
    }
    assert!(heap_size > 0, "no usable memory region for the kernel heap");

    info!(
        "mm: kernel heap at {:#x}..{:#x} ({} KiB)",
        heap_start,
        heap_start + heap_size,
        heap_size / 1024
    );

    // SAFETY: The region is available RAM, excluded from the kernel image,
    // and mapped at KERNEL_VIRT_BASE + phys by the boot stage.
    let buddy: &'static BuddyAllocator = leak(unsafe {
        BuddyAllocator::init(KERNEL_VIRT_BASE + heap_start, heap_start, heap_size)
    });

    let frames: &'static FrameTable = leak(FrameTable::init(
        buddy,
        boot,
        heap_start..heap_start + heap_size,
    ));

    let kmalloc: &'static KernelAllocator = leak(KernelAllocator::new(buddy));

    let paging: &'static Paging = leak(Paging::init(buddy, frames));

    let stack = MEMORY.call_once(|| MemoryStack {
        buddy,
        frames,
        paging,
        kmalloc,
    });

    #[cfg(target_os = "none")]
    heap::switch_to_kmalloc();

    info!("mm: memory stack initialized");
    stack
}

/// Leak a value into a `'static` reference through the (boot) heap.
fn leak<T>(value: T) -> &'static T {
    #[cfg(feature = "alloc")]
    {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(value))
    }
    #[cfg(not(feature = "alloc"))]
    {
        let _ = value;
        unimplemented!("mm::init requires the alloc feature")
    }
}
