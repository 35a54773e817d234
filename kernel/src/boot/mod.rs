//! Boot-stage interface
//!
//! The bootloader protocol itself is out of scope; the memory stack only
//! consumes the Multiboot2 memory-map tag plus the kernel image extents,
//! which the boot stage packages into a [`BootInfo`].

pub mod multiboot;

pub use multiboot::{MemoryMapEntry, MemoryMapEntryIter, MemoryMapTag, MEMORY_AVAILABLE};

/// Everything the memory subsystem needs from the boot stage.
#[derive(Clone, Copy)]
pub struct BootInfo<'a> {
    /// Parsed Multiboot2 memory-map tag.
    pub memory_map: &'a MemoryMapTag,
    /// Physical start of the kernel image.
    pub kernel_start: usize,
    /// Physical end of the kernel image (exclusive).
    pub kernel_end: usize,
}
