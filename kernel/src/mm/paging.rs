//! Two-level IA-32 paging
//!
//! A page directory holds 1024 entries; each either maps a 4 MiB page
//! directly (PSE) or points to a page table of 1024 4 KiB entries. The
//! kernel half starts at [`super::KERNEL_VIRT_BASE`] (directory index 768)
//! and is shared by every address space: a new user directory copies the
//! kernel PDEs verbatim, so kernel page tables are edited once and seen
//! everywhere.
//!
//! All raw entry arithmetic stays inside [`Entry`], [`PageTable`] and the
//! [`Paging`] context; callers deal in [`PageDir`] handles and flags.

use core::ops::{Index, IndexMut};
use core::ptr::NonNull;

use bitflags::bitflags;
use log::{debug, warn};

use super::{
    buddy::BuddyAllocator, frame::FrameTable, PhysMap, PhysicalAddress, VirtualAddress,
    KERNEL_VIRT_BASE, PAGE_SIZE,
};
use crate::{
    arch,
    error::{KernelResult, MmError},
    sync::IrqSpinLock,
};

/// Entries per directory or table.
pub const TABLE_ENTRIES: usize = 1024;

/// Span of one PDE: 4 MiB.
pub const LARGE_PAGE_SIZE: usize = TABLE_ENTRIES * PAGE_SIZE;

/// First directory index of the kernel half.
const KERNEL_PDE_START: usize = KERNEL_VIRT_BASE / LARGE_PAGE_SIZE;

/// Reserved band of kernel virtual addresses for temporary mappings: the
/// top 4 MiB, backed by one shared page table.
pub const TEMP_WINDOW_BASE: usize = 0xFFC0_0000;
const TEMP_SLOTS: usize = 8;

bitflags! {
    /// IA-32 PDE/PTE flag bits. Bits 9–11 are OS-available; bit 9 marks a
    /// copy-on-write page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// In a PDE: this entry maps a 4 MiB page.
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// OS bit: write faults here mean copy-on-write.
        const COW           = 1 << 9;
    }
}

impl PteFlags {
    /// Kernel read/write data.
    pub const KERNEL_DATA: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);
    /// User-visible read/write data.
    pub const USER_DATA: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER);
    /// User-visible read-only data.
    pub const USER_RO: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);
}

const ADDR_MASK: u32 = 0xFFFF_F000;
/// Frame mask of a 4 MiB PDE.
const LARGE_ADDR_MASK: u32 = 0xFFC0_0000;

/// One PDE or PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(addr: PhysicalAddress, flags: PteFlags) -> Self {
        debug_assert!(addr.is_page_aligned());
        Self(addr.as_usize() as u32 & ADDR_MASK | flags.bits() & !ADDR_MASK)
    }

    pub fn new_large(addr: PhysicalAddress, flags: PteFlags) -> Self {
        debug_assert_eq!(addr.as_usize() % LARGE_PAGE_SIZE, 0);
        Self(addr.as_usize() as u32 & LARGE_ADDR_MASK | (flags | PteFlags::LARGE).bits())
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub const fn is_large(&self) -> bool {
        self.0 & PteFlags::LARGE.bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn addr(&self) -> PhysicalAddress {
        if self.is_large() {
            PhysicalAddress::new((self.0 & LARGE_ADDR_MASK) as usize)
        } else {
            PhysicalAddress::new((self.0 & ADDR_MASK) as usize)
        }
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        let keep_large = self.0 & PteFlags::LARGE.bits();
        self.0 = self.0 & ADDR_MASK | flags.bits() & !ADDR_MASK | keep_large;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A page table or page directory: 1024 entries, one page, page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// True when no entry is present (the table can be freed).
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

impl Index<usize> for PageTable {
    type Output = Entry;

    fn index(&self, index: usize) -> &Entry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Entry {
        &mut self.entries[index]
    }
}

/// Directory index of a virtual address.
const fn pd_index(vaddr: usize) -> usize {
    vaddr >> 22
}

/// Table index of a virtual address.
const fn pt_index(vaddr: usize) -> usize {
    (vaddr >> 12) & 0x3FF
}

/// Handle to one page directory, identified by its physical address. The
/// CR3 value for [`Paging::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDir {
    phys: PhysicalAddress,
}

impl PageDir {
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }
}

struct TempWindows {
    /// Physical address of the band's shared page table.
    pt_phys: PhysicalAddress,
    used: [Option<PhysicalAddress>; TEMP_SLOTS],
}

/// A temporarily mapped frame. Unmaps (and invalidates) on drop.
pub struct TempMapping<'a> {
    paging: &'a Paging,
    slot: usize,
    phys: PhysicalAddress,
}

impl TempMapping<'_> {
    /// Kernel-virtual pointer to the mapped frame.
    pub fn ptr(&self) -> *mut u8 {
        #[cfg(target_os = "none")]
        {
            (TEMP_WINDOW_BASE + self.slot * PAGE_SIZE) as *mut u8
        }
        #[cfg(not(target_os = "none"))]
        {
            // Off-target the window PTEs are bookkeeping only; the frame is
            // reachable through the arena mapping.
            self.paging
                .phys_map
                .phys_to_virt(self.phys)
                .as_usize() as *mut u8
        }
    }
}

impl Drop for TempMapping<'_> {
    fn drop(&mut self) {
        let mut windows = self.paging.temp.lock();
        debug_assert_eq!(windows.used[self.slot], Some(self.phys));
        let pt = self.paging.table_mut(windows.pt_phys);
        pt[self.slot].clear();
        windows.used[self.slot] = None;
        arch::invalidate_page(TEMP_WINDOW_BASE + self.slot * PAGE_SIZE);
    }
}

/// The paging context: everything needed to build, edit and retire page
/// directories.
pub struct Paging {
    buddy: &'static BuddyAllocator,
    frames: &'static FrameTable,
    phys_map: PhysMap,
    pse: bool,
    kernel_pd: PageDir,
    temp: IrqSpinLock<TempWindows>,
}

impl Paging {
    /// Build the kernel page directory: the whole buddy heap mapped at its
    /// higher-half home (4 MiB pages where PSE allows) plus the temporary
    /// mapping band.
    pub fn init(buddy: &'static BuddyAllocator, frames: &'static FrameTable) -> Self {
        let phys_map = buddy.phys_map();
        let pse = arch::pse_supported();
        if pse {
            arch::set_cr4_pse();
        }
        debug!("paging: PSE {}", if pse { "enabled" } else { "unavailable" });

        let kernel_pd_phys = Self::alloc_table_frame(buddy, phys_map)
            .expect("no memory for the kernel page directory");
        // Temp-window page table, shared by every address space.
        let temp_pt_phys = Self::alloc_table_frame(buddy, phys_map)
            .expect("no memory for the temp-window page table");

        let paging = Self {
            buddy,
            frames,
            phys_map,
            pse,
            kernel_pd: PageDir {
                phys: kernel_pd_phys,
            },
            temp: IrqSpinLock::new(TempWindows {
                pt_phys: temp_pt_phys,
                used: [None; TEMP_SLOTS],
            }),
        };

        // Wire the temp band's PDE into the kernel directory so it is
        // inherited by every user directory.
        {
            let pd = paging.table_mut(kernel_pd_phys);
            pd[pd_index(TEMP_WINDOW_BASE)] =
                Entry::new(temp_pt_phys, PteFlags::PRESENT | PteFlags::WRITABLE);
        }

        // Map the kernel heap at its higher-half home. Directory contents
        // always use the hardware model (KERNEL_VIRT_BASE + phys), even
        // when the table frames themselves live in a host arena.
        let heap = buddy.phys_range();
        let vstart = paging.kernel_virt(PhysicalAddress::new(heap.start));
        paging
            .map_range(
                paging.kernel_pd,
                vstart,
                PhysicalAddress::new(heap.start),
                heap.end - heap.start,
                PteFlags::KERNEL_DATA | PteFlags::GLOBAL,
            )
            .expect("mapping the kernel heap cannot fail on a fresh directory");

        // The kernel directory and temp table frames stay out of frame
        // refcounting; pin them anyway so nothing ever hands them out.
        frames.mark_range_reserved(
            kernel_pd_phys.as_usize()..kernel_pd_phys.as_usize() + PAGE_SIZE,
        );
        frames.mark_range_reserved(temp_pt_phys.as_usize()..temp_pt_phys.as_usize() + PAGE_SIZE);

        paging
    }

    pub fn kernel_pd(&self) -> PageDir {
        self.kernel_pd
    }

    pub fn pse_supported(&self) -> bool {
        self.pse
    }

    pub fn phys_map(&self) -> PhysMap {
        self.phys_map
    }

    /// Where a physical address lives in the kernel half of the 32-bit
    /// address-space model (what goes *into* page tables; only valid for
    /// physical memory below 1 GiB).
    pub fn kernel_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(KERNEL_VIRT_BASE + phys.as_usize())
    }

    /// Borrow a directory/table frame as a [`PageTable`].
    ///
    /// The returned reference aliases the frame's memory; every use site
    /// is single-threaded over a given directory (mm lock or init).
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, phys: PhysicalAddress) -> &mut PageTable {
        let vaddr = self.phys_map.phys_to_virt(phys);
        // SAFETY: Table frames come from the buddy heap, which is mapped at
        // the phys_map offset, and are exclusively owned by the paging
        // layer. Concurrent mutation is excluded by the owning mm's lock
        // (user directories) or by init-time single threading (kernel PD).
        unsafe { &mut *(vaddr.as_usize() as *mut PageTable) }
    }

    /// Allocate and zero one table frame from the buddy.
    fn alloc_table_frame(
        buddy: &BuddyAllocator,
        phys_map: PhysMap,
    ) -> Option<PhysicalAddress> {
        let page = buddy.alloc_page()?;
        // SAFETY: Fresh page, exclusively ours.
        unsafe {
            core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE);
        }
        Some(phys_map.virt_to_phys(VirtualAddress::new(page.as_ptr() as usize)))
    }

    /// Create a user page directory with the kernel half shared in.
    pub fn new_user_pd(&self) -> KernelResult<PageDir> {
        let pd_phys = Self::alloc_table_frame(self.buddy, self.phys_map)
            .ok_or(MmError::OutOfMemory {
                requested: PAGE_SIZE,
            })?;
        let kernel = self.table_mut(self.kernel_pd.phys);
        let new = self.table_mut(pd_phys);
        for i in KERNEL_PDE_START..TABLE_ENTRIES {
            new[i] = kernel[i];
        }
        Ok(PageDir { phys: pd_phys })
    }

    /// Map one 4 KiB page.
    pub fn map_single(
        &self,
        pd: PageDir,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let paddr = paddr.align_down();
        let dir = self.table_mut(pd.phys);
        let pde = &mut dir[pd_index(vaddr.as_usize())];

        if pde.is_present() && pde.is_large() {
            return Err(MmError::AlreadyMapped {
                addr: vaddr.as_usize(),
            }
            .into());
        }
        if !pde.is_present() {
            let pt_phys = Self::alloc_table_frame(self.buddy, self.phys_map).ok_or(
                MmError::OutOfMemory {
                    requested: PAGE_SIZE,
                },
            )?;
            *pde = Entry::new(
                pt_phys,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            );
        }

        let pt = self.table_mut(pde.addr());
        let pte = &mut pt[pt_index(vaddr.as_usize())];
        if pte.is_present() {
            return Err(MmError::AlreadyMapped {
                addr: vaddr.as_usize(),
            }
            .into());
        }
        *pte = Entry::new(paddr, flags | PteFlags::PRESENT);
        arch::invalidate_page(vaddr.as_usize());
        Ok(())
    }

    /// Map a contiguous range, page by page, using 4 MiB directory entries
    /// wherever alignment and PSE permit.
    pub fn map_range(
        &self,
        pd: PageDir,
        vstart: VirtualAddress,
        pstart: PhysicalAddress,
        size: usize,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let mut vaddr = vstart.align_down().as_usize();
        let mut paddr = pstart.align_down().as_usize();
        let end = vstart
            .as_usize()
            .checked_add(size)
            .ok_or(MmError::InvalidSize { size })?;
        while vaddr < end {
            let large_ok = self.pse
                && vaddr % LARGE_PAGE_SIZE == 0
                && paddr % LARGE_PAGE_SIZE == 0
                && end - vaddr >= LARGE_PAGE_SIZE;
            if large_ok {
                let dir = self.table_mut(pd.phys);
                let pde = &mut dir[pd_index(vaddr)];
                if pde.is_present() {
                    return Err(MmError::AlreadyMapped { addr: vaddr }.into());
                }
                *pde = Entry::new_large(PhysicalAddress::new(paddr), flags | PteFlags::PRESENT);
                arch::invalidate_page(vaddr);
                vaddr += LARGE_PAGE_SIZE;
                paddr += LARGE_PAGE_SIZE;
            } else {
                self.map_single(
                    pd,
                    VirtualAddress::new(vaddr),
                    PhysicalAddress::new(paddr),
                    flags,
                )?;
                vaddr += PAGE_SIZE;
                paddr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Map a range at `vaddr == paddr`.
    pub fn identity_map_range(
        &self,
        pd: PageDir,
        start: PhysicalAddress,
        size: usize,
        flags: PteFlags,
    ) -> KernelResult<()> {
        self.map_range(pd, VirtualAddress::new(start.as_usize()), start, size, flags)
    }

    /// Unmap a range. Every unmapped 4 KiB frame gets a `put_frame`; a
    /// 4 MiB entry is torn down as one unit with one `put_frame_region`.
    /// A page table whose last entry goes away is returned to the buddy
    /// (user half only; kernel tables are shared).
    pub fn unmap_range(&self, pd: PageDir, vstart: VirtualAddress, size: usize) {
        let mut vaddr = vstart.align_down().as_usize();
        let end = vstart.as_usize().saturating_add(size);
        while vaddr < end {
            let dir = self.table_mut(pd.phys);
            let pde = &mut dir[pd_index(vaddr)];
            if !pde.is_present() {
                // Skip to the next directory slot.
                match (vaddr & !(LARGE_PAGE_SIZE - 1)).checked_add(LARGE_PAGE_SIZE) {
                    Some(next) => vaddr = next,
                    None => break,
                }
                continue;
            }
            if pde.is_large() {
                // The whole 4 MiB region goes at once.
                let region = pde.addr();
                pde.clear();
                self.frames.put_frame_region(region, LARGE_PAGE_SIZE);
                let base = vaddr & !(LARGE_PAGE_SIZE - 1);
                arch::invalidate_page(base);
                match base.checked_add(LARGE_PAGE_SIZE) {
                    Some(next) => vaddr = next,
                    None => break,
                }
                continue;
            }

            let pt_phys = pde.addr();
            let pt = self.table_mut(pt_phys);
            let pte = &mut pt[pt_index(vaddr)];
            if pte.is_present() {
                let frame = pte.addr();
                pte.clear();
                self.frames.put_frame(frame);
                arch::invalidate_page(vaddr);
            }
            // Free the table once it holds nothing, unless it is a shared
            // kernel-half table.
            if pd_index(vaddr) < KERNEL_PDE_START && pt.is_empty() {
                pde.clear();
                self.free_table_frame(pt_phys);
            }
            vaddr += PAGE_SIZE;
        }
    }

    fn free_table_frame(&self, phys: PhysicalAddress) {
        let vaddr = self.phys_map.phys_to_virt(phys);
        if let Some(ptr) = NonNull::new(vaddr.as_usize() as *mut u8) {
            self.buddy.free_page(ptr);
        }
    }

    /// Software page-table walk.
    pub fn translate(
        &self,
        pd: PageDir,
        vaddr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PteFlags)> {
        let dir = self.table_mut(pd.phys);
        let pde = dir[pd_index(vaddr.as_usize())];
        if !pde.is_present() {
            return None;
        }
        if pde.is_large() {
            let base = pde.addr().as_usize();
            return Some((
                PhysicalAddress::new(base + (vaddr.as_usize() & (LARGE_PAGE_SIZE - 1))),
                pde.flags(),
            ));
        }
        let pt = self.table_mut(pde.addr());
        let pte = pt[pt_index(vaddr.as_usize())];
        if !pte.is_present() {
            return None;
        }
        Some((
            PhysicalAddress::new(pte.addr().as_usize() + vaddr.page_offset()),
            pte.flags(),
        ))
    }

    /// Read the leaf entry covering `vaddr`, if any.
    pub fn pte(&self, pd: PageDir, vaddr: VirtualAddress) -> Option<Entry> {
        let dir = self.table_mut(pd.phys);
        let pde = dir[pd_index(vaddr.as_usize())];
        if !pde.is_present() {
            return None;
        }
        if pde.is_large() {
            return Some(pde);
        }
        let pt = self.table_mut(pde.addr());
        let pte = pt[pt_index(vaddr.as_usize())];
        pte.is_present().then_some(pte)
    }

    /// Rewrite the flags of an existing 4 KiB mapping (the COW flip).
    pub fn update_flags(
        &self,
        pd: PageDir,
        vaddr: VirtualAddress,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let dir = self.table_mut(pd.phys);
        let pde = dir[pd_index(vaddr.as_usize())];
        if !pde.is_present() || pde.is_large() {
            return Err(MmError::UnmappedMemory {
                addr: vaddr.as_usize(),
            }
            .into());
        }
        let pt = self.table_mut(pde.addr());
        let pte = &mut pt[pt_index(vaddr.as_usize())];
        if !pte.is_present() {
            return Err(MmError::UnmappedMemory {
                addr: vaddr.as_usize(),
            }
            .into());
        }
        pte.set_flags(flags | PteFlags::PRESENT);
        arch::invalidate_page(vaddr.as_usize());
        Ok(())
    }

    /// Point an existing or empty slot at a new frame, replacing whatever
    /// mapping was there. Used by the COW break to install the copy.
    pub fn remap_single(
        &self,
        pd: PageDir,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let dir = self.table_mut(pd.phys);
        let pde = dir[pd_index(vaddr.as_usize())];
        if !pde.is_present() || pde.is_large() {
            return Err(MmError::UnmappedMemory {
                addr: vaddr.as_usize(),
            }
            .into());
        }
        let pt = self.table_mut(pde.addr());
        pt[pt_index(vaddr.as_usize())] = Entry::new(paddr, flags | PteFlags::PRESENT);
        arch::invalidate_page(vaddr.as_usize());
        Ok(())
    }

    /// Load the directory into CR3 (and set CR0.PG on first use).
    pub fn activate(&self, pd: PageDir) {
        arch::write_cr3_and_enable_paging(pd.phys.as_usize());
    }

    // Frame-table passthroughs, so the VMA layer drives paging and frames
    // through one handle.

    pub fn frame_alloc(&self) -> Option<PhysicalAddress> {
        self.frames.frame_alloc()
    }

    /// Allocate a frame and zero it through a temp window.
    pub fn frame_alloc_zeroed(&self) -> Option<PhysicalAddress> {
        let frame = self.frames.frame_alloc()?;
        self.zero_frame(frame);
        Some(frame)
    }

    pub fn get_frame(&self, phys: PhysicalAddress) {
        self.frames.get_frame(phys);
    }

    pub fn put_frame(&self, phys: PhysicalAddress) {
        self.frames.put_frame(phys);
    }

    pub fn frame_refcount(&self, phys: PhysicalAddress) -> u32 {
        self.frames.refcount(phys)
    }

    /// Single-page TLB invalidation.
    pub fn invalidate_page(&self, vaddr: VirtualAddress) {
        arch::invalidate_page(vaddr.as_usize());
    }

    /// Map a frame into a free temp-window slot.
    pub fn map_temp(&self, phys: PhysicalAddress) -> Option<TempMapping<'_>> {
        let mut windows = self.temp.lock();
        let slot = windows.used.iter().position(Option::is_none)?;
        windows.used[slot] = Some(phys);
        let pt_phys = windows.pt_phys;
        let pt = self.table_mut(pt_phys);
        pt[slot] = Entry::new(phys, PteFlags::KERNEL_DATA);
        arch::invalidate_page(TEMP_WINDOW_BASE + slot * PAGE_SIZE);
        Some(TempMapping {
            paging: self,
            slot,
            phys,
        })
    }

    /// Zero a frame through a temporary mapping.
    pub fn zero_frame(&self, phys: PhysicalAddress) {
        let mapping = self
            .map_temp(phys)
            .expect("temp-window slots exhausted while zeroing");
        // SAFETY: The window maps exactly this frame.
        unsafe {
            core::ptr::write_bytes(mapping.ptr(), 0, PAGE_SIZE);
        }
    }

    /// Copy one frame into another through two temporary mappings.
    pub fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        let dst_map = self
            .map_temp(dst)
            .expect("temp-window slots exhausted for copy destination");
        let src_map = self
            .map_temp(src)
            .expect("temp-window slots exhausted for copy source");
        // SAFETY: The two windows map the two distinct frames.
        unsafe {
            core::ptr::copy_nonoverlapping(src_map.ptr(), dst_map.ptr(), PAGE_SIZE);
        }
    }

    /// Retire a user directory: free any user-half page tables (and
    /// `put_frame` whatever leaf mappings are still present), then free
    /// the directory frame itself.
    pub fn free_user_pd(&self, pd: PageDir) {
        let dir = self.table_mut(pd.phys);
        for i in 0..KERNEL_PDE_START {
            let pde = dir[i];
            if !pde.is_present() {
                continue;
            }
            if pde.is_large() {
                self.frames.put_frame_region(pde.addr(), LARGE_PAGE_SIZE);
                continue;
            }
            let pt_phys = pde.addr();
            let pt = self.table_mut(pt_phys);
            let mut stale = 0;
            for j in 0..TABLE_ENTRIES {
                let pte = pt[j];
                if pte.is_present() {
                    self.frames.put_frame(pte.addr());
                    stale += 1;
                }
            }
            if stale > 0 {
                warn!("paging: {} stale mappings in retired directory", stale);
            }
            self.free_table_frame(pt_phys);
        }
        self.free_table_frame(pd.phys);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::TestStack;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn map_and_translate_single_page() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        let frame = stack.frames.frame_alloc().expect("frame");
        let va = VirtualAddress::new(0x1000_0000);

        stack
            .paging
            .map_single(pd, va, frame, PteFlags::USER_DATA)
            .expect("map");
        let (phys, flags) = stack.paging.translate(pd, va).expect("translate");
        assert_eq!(phys, frame);
        assert!(flags.contains(PteFlags::USER | PteFlags::WRITABLE));

        // Offsets carry through the walk.
        let (phys2, _) = stack
            .paging
            .translate(pd, VirtualAddress::new(0x1000_0234))
            .expect("translate offset");
        assert_eq!(phys2.as_usize(), frame.as_usize() + 0x234);
    }

    #[test]
    fn double_map_is_rejected() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        let frame = stack.frames.frame_alloc().expect("frame");
        let va = VirtualAddress::new(0x2000_0000);
        stack
            .paging
            .map_single(pd, va, frame, PteFlags::USER_DATA)
            .expect("first map");
        assert!(stack
            .paging
            .map_single(pd, va, frame, PteFlags::USER_DATA)
            .is_err());
    }

    #[test]
    fn unmap_puts_frames_and_frees_empty_tables() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        let frame = stack.frames.frame_alloc().expect("frame");
        let va = VirtualAddress::new(0x0800_0000);

        let buddy_free_before_map = stack.buddy.stats().free_bytes;
        stack
            .paging
            .map_single(pd, va, frame, PteFlags::USER_DATA)
            .expect("map");
        stack.paging.unmap_range(pd, va, PAGE_SIZE);

        assert!(stack.paging.translate(pd, va).is_none());
        assert_eq!(stack.frames.refcount(frame), 0);
        // Frame and the PT both returned: free space is back above the
        // pre-map level (the frame itself was allocated earlier).
        assert_eq!(
            stack.buddy.stats().free_bytes,
            buddy_free_before_map + PAGE_SIZE
        );
    }

    #[test]
    fn kernel_half_is_shared_into_user_dirs() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        // A heap address translates identically through the kernel PD and
        // a fresh user PD.
        let heap = stack.buddy.phys_range();
        let probe = stack
            .paging
            .kernel_virt(PhysicalAddress::new(heap.start + 0x5000));
        let via_kernel = stack.paging.translate(stack.paging.kernel_pd(), probe);
        let via_user = stack.paging.translate(pd, probe);
        assert!(via_kernel.is_some());
        assert_eq!(via_kernel, via_user);
    }

    #[test]
    fn large_pages_used_for_aligned_kernel_heap() {
        let stack = TestStack::new(16 * MIB);
        // The heap mapping built in init should contain at least one 4 MiB
        // entry when PSE is on (the host stub reports PSE).
        let heap = stack.buddy.phys_range();
        let heap_aligned = (heap.start + LARGE_PAGE_SIZE - 1) & !(LARGE_PAGE_SIZE - 1);
        if heap_aligned + LARGE_PAGE_SIZE <= heap.end {
            let probe = stack
                .paging
                .kernel_virt(PhysicalAddress::new(heap_aligned));
            let entry = stack
                .paging
                .pte(stack.paging.kernel_pd(), probe)
                .expect("heap is mapped");
            assert!(entry.is_large());
        }
    }

    #[test]
    fn temp_mapping_reaches_frame_contents() {
        let stack = TestStack::new(16 * MIB);
        let frame = stack.frames.frame_alloc().expect("frame");
        stack.paging.zero_frame(frame);
        {
            let mapping = stack.paging.map_temp(frame).expect("temp slot");
            // SAFETY: The window maps this frame.
            unsafe {
                assert_eq!(mapping.ptr().read(), 0);
                mapping.ptr().write(0xA5);
            }
        }
        let copy = stack.frames.frame_alloc().expect("frame 2");
        stack.paging.copy_frame(copy, frame);
        let mapping = stack.paging.map_temp(copy).expect("temp slot");
        unsafe {
            assert_eq!(mapping.ptr().read(), 0xA5);
        }
    }

    #[test]
    fn identity_map_covers_range() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        // A device-style identity mapping: virt == phys across pages.
        let base = PhysicalAddress::new(0x00A0_0000);
        stack
            .paging
            .identity_map_range(pd, base, 3 * PAGE_SIZE, PteFlags::KERNEL_DATA)
            .expect("identity map");
        for i in 0..3 {
            let probe = VirtualAddress::new(base.as_usize() + i * PAGE_SIZE + 0x10);
            let (phys, _) = stack.paging.translate(pd, probe).expect("mapped");
            assert_eq!(phys.as_usize(), probe.as_usize());
        }
        assert!(stack
            .paging
            .translate(pd, VirtualAddress::new(base.as_usize() + 3 * PAGE_SIZE))
            .is_none());
    }

    #[test]
    fn update_flags_flips_writability() {
        let stack = TestStack::new(16 * MIB);
        let pd = stack.paging.new_user_pd().expect("new pd");
        let frame = stack.frames.frame_alloc().expect("frame");
        let va = VirtualAddress::new(0x3000_0000);
        stack
            .paging
            .map_single(pd, va, frame, PteFlags::USER_RO | PteFlags::COW)
            .expect("map");
        let (_, flags) = stack.paging.translate(pd, va).expect("translate");
        assert!(!flags.contains(PteFlags::WRITABLE));
        assert!(flags.contains(PteFlags::COW));

        stack
            .paging
            .update_flags(pd, va, PteFlags::USER_DATA)
            .expect("update");
        let (_, flags) = stack.paging.translate(pd, va).expect("translate");
        assert!(flags.contains(PteFlags::WRITABLE));
        assert!(!flags.contains(PteFlags::COW));
    }

    #[test]
    fn free_user_pd_reclaims_tables() {
        let stack = TestStack::new(16 * MIB);
        let before = stack.buddy.stats().free_bytes;
        let pd = stack.paging.new_user_pd().expect("new pd");
        let frame = stack.frames.frame_alloc().expect("frame");
        stack
            .paging
            .map_single(pd, VirtualAddress::new(0x4000_0000), frame, PteFlags::USER_DATA)
            .expect("map");
        stack.paging.free_user_pd(pd);
        assert_eq!(stack.buddy.stats().free_bytes, before);
    }
}
