//! Virtual memory areas
//!
//! A process's address space is a set of non-overlapping page-aligned
//! intervals (VMAs) held in an interval red-black tree, plus the page
//! directory realizing whatever subset of them has been touched. Pages
//! materialize lazily in [`AddressSpace::handle_fault`]: anonymous zero
//! pages, file-backed reads, copy-on-write breaks and downward stack
//! growth all start as page faults.
//!
//! The per-address-space lock covers every tree walk and mutation and the
//! page-table edits made on its behalf; on this single-CPU design that is
//! all the synchronization page tables need.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::sync::Arc;

use bitflags::bitflags;
use log::debug;

use super::{
    fault::PageFaultInfo,
    paging::{PageDir, Paging, PteFlags},
    rbtree::{IntervalNode, IntervalTree, NIL},
    VirtualAddress, KERNEL_VIRT_BASE, PAGE_SIZE,
};
use crate::{
    error::{KernelError, KernelResult, MmError},
    sync::IrqSpinLock,
};

/// How far below a `GROWS_DOWN` area a fault may land and still grow the
/// stack (128 KiB).
const MAX_STACK_GROWTH: usize = 128 * 1024;

/// Gap kept between a grown stack and the next area below it.
const STACK_GUARD_GAP: usize = PAGE_SIZE;

bitflags! {
    /// VMA capability and kind bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        const SHARED     = 1 << 3;
        const PRIVATE    = 1 << 4;
        const GROWS_DOWN = 1 << 5;
        const ANONYMOUS  = 1 << 6;
        const FILEBACKED = 1 << 7;
        const HEAP       = 1 << 8;
        const STACK      = 1 << 9;
    }
}

/// Collaborator interface to the VFS read path: fill one page of backing
/// data. Short reads leave the tail for the caller to zero.
pub trait VmFile: Send + Sync {
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
}

/// A file handle plus the offset this mapping starts at.
#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<dyn VmFile>,
    pub offset: u64,
}

/// One virtual memory area.
pub struct VmArea {
    start: usize,
    end: usize,
    flags: VmFlags,
    prot: PteFlags,
    file: Option<FileMapping>,
}

impl IntervalNode for VmArea {
    fn start(&self) -> usize {
        self.start
    }
    fn end(&self) -> usize {
        self.end
    }
}

impl VmArea {
    fn file_offset_at(&self, addr: usize) -> u64 {
        let mapping = self.file.as_ref().expect("file offset of anonymous area");
        mapping.offset + (addr - self.start) as u64
    }

    fn can_merge_before(&self, other: &NewArea) -> bool {
        if self.end != other.start || self.flags != other.flags || self.prot != other.prot {
            return false;
        }
        match (&self.file, &other.file) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                Arc::ptr_eq(&a.file, &b.file)
                    && a.offset + (self.end - self.start) as u64 == b.offset
            }
            _ => false,
        }
    }
}

/// Insert request, before it becomes a node.
struct NewArea {
    start: usize,
    end: usize,
    flags: VmFlags,
    prot: PteFlags,
    file: Option<FileMapping>,
}

/// Caller-visible snapshot of one VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaInfo {
    pub start: usize,
    pub end: usize,
    pub flags: VmFlags,
    pub prot: PteFlags,
}

struct MmInner {
    tree: IntervalTree<VmArea>,
    map_count: usize,
    /// Tracking ranges for the classic segments.
    code: core::ops::Range<usize>,
    data: core::ops::Range<usize>,
    heap_start: usize,
    heap_break: usize,
    stack_top: usize,
    destroyed: bool,
}

/// Per-process address-space descriptor (the mm_struct).
pub struct AddressSpace {
    paging: &'static Paging,
    /// The page directory; immutable for the life of the address space.
    pd: PageDir,
    inner: IrqSpinLock<MmInner>,
}

impl AddressSpace {
    /// Create an empty address space with a fresh page directory (kernel
    /// half shared in).
    pub fn new(paging: &'static Paging) -> KernelResult<Self> {
        let pd = paging.new_user_pd()?;
        Ok(Self {
            paging,
            pd,
            inner: IrqSpinLock::new(MmInner {
                tree: IntervalTree::new(),
                map_count: 0,
                code: 0..0,
                data: 0..0,
                heap_start: 0,
                heap_break: 0,
                stack_top: 0,
                destroyed: false,
            }),
        })
    }

    pub fn page_dir(&self) -> PageDir {
        self.pd
    }

    /// The paging context this address space lives in.
    pub fn paging(&self) -> &'static Paging {
        self.paging
    }

    pub fn map_count(&self) -> usize {
        self.inner.lock().map_count
    }

    /// Make this the active address space.
    pub fn activate(&self) {
        self.paging.activate(self.pd);
    }

    /// The VMA containing `addr`, if any.
    pub fn find_vma(&self, addr: usize) -> Option<VmaInfo> {
        let inner = self.inner.lock();
        let idx = inner.tree.find(addr)?;
        let area = inner.tree.get(idx);
        Some(VmaInfo {
            start: area.start,
            end: area.end,
            flags: area.flags,
            prot: area.prot,
        })
    }

    /// Any VMA overlapping `[start, end)`.
    pub fn find_overlap(&self, start: usize, end: usize) -> Option<VmaInfo> {
        let inner = self.inner.lock();
        let idx = inner.tree.find_overlap(start, end)?;
        let area = inner.tree.get(idx);
        Some(VmaInfo {
            start: area.start,
            end: area.end,
            flags: area.flags,
            prot: area.prot,
        })
    }

    /// Insert a new area. Rejects overlap; merges with adjacent areas of
    /// identical flags and contiguous backing.
    pub fn insert_vma(
        &self,
        start: usize,
        end: usize,
        flags: VmFlags,
        prot: PteFlags,
        file: Option<FileMapping>,
    ) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 || start >= end {
            return Err(KernelError::InvalidArgument { name: "vma range" });
        }
        if end > KERNEL_VIRT_BASE {
            return Err(MmError::InvalidAddress { addr: end }.into());
        }
        let mut inner = self.inner.lock();
        if inner.tree.find_overlap(start, end).is_some() {
            return Err(MmError::VmaOverlap { start, end }.into());
        }

        let new = NewArea {
            start,
            end,
            flags,
            prot,
            file,
        };

        // Try merging with the predecessor (its end touching our start).
        if let Some(prev_idx) = inner.tree.find(start.wrapping_sub(1)) {
            if inner.tree.get(prev_idx).can_merge_before(&new) {
                // Also check whether the merged area now touches the
                // successor and can swallow it too.
                inner.tree.get_mut(prev_idx).end = end;
                self.try_merge_with_next(&mut inner, prev_idx);
                return Ok(());
            }
        }

        let idx = inner.tree.insert(VmArea {
            start: new.start,
            end: new.end,
            flags: new.flags,
            prot: new.prot,
            file: new.file,
        });
        inner.map_count += 1;
        self.try_merge_with_next(&mut inner, idx);
        Ok(())
    }

    /// Merge `idx` with its in-order successor when compatible.
    fn try_merge_with_next(&self, inner: &mut MmInner, idx: u32) {
        let next = inner.tree.next(idx);
        if next == NIL {
            return;
        }
        let mergeable = {
            let area = inner.tree.get(idx);
            let succ = inner.tree.get(next);
            area.can_merge_before(&NewArea {
                start: succ.start,
                end: succ.end,
                flags: succ.flags,
                prot: succ.prot,
                file: succ.file.clone(),
            })
        };
        if mergeable {
            let succ = inner.tree.remove(next);
            inner.tree.get_mut(idx).end = succ.end;
            inner.map_count -= 1;
        }
    }

    /// Carve `[start, start + len)` out of the address space, unmapping
    /// whatever pages were materialized there. Areas straddling the
    /// boundary are split.
    pub fn remove_vma_range(&self, start: usize, len: usize) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 || len == 0 || len % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument { name: "unmap range" });
        }
        let end = start.checked_add(len).ok_or(MmError::InvalidSize { size: len })?;
        let mut inner = self.inner.lock();

        while let Some(idx) = inner.tree.find_overlap(start, end) {
            let (a_start, a_end) = {
                let area = inner.tree.get(idx);
                (area.start, area.end)
            };
            let cut_start = a_start.max(start);
            let cut_end = a_end.min(end);

            if a_start < cut_start && a_end > cut_end {
                // Middle carve: keep the head, spawn a tail.
                let tail_file = {
                    let area = inner.tree.get(idx);
                    area.file.as_ref().map(|f| FileMapping {
                        file: f.file.clone(),
                        offset: area.file_offset_at(cut_end),
                    })
                };
                let (flags, prot) = {
                    let area = inner.tree.get_mut(idx);
                    area.end = cut_start;
                    (area.flags, area.prot)
                };
                inner.tree.insert(VmArea {
                    start: cut_end,
                    end: a_end,
                    flags,
                    prot,
                    file: tail_file,
                });
                inner.map_count += 1;
            } else if a_start < cut_start {
                inner.tree.get_mut(idx).end = cut_start;
            } else if a_end > cut_end {
                let area = inner.tree.get_mut(idx);
                if area.file.is_some() {
                    let new_offset = area.file_offset_at(cut_end);
                    area.file.as_mut().expect("checked above").offset = new_offset;
                }
                area.start = cut_end;
            } else {
                inner.tree.remove(idx);
                inner.map_count -= 1;
            }

            self.paging.unmap_range(
                self.pd,
                VirtualAddress::new(cut_start),
                cut_end - cut_start,
            );
        }
        Ok(())
    }

    /// Service a page fault at `info.addr` against this address space.
    ///
    /// Resolution order: permission check, copy-on-write break, demand
    /// paging (anonymous or file-backed), downward stack growth.
    pub fn handle_fault(&self, info: &PageFaultInfo) -> KernelResult<()> {
        let addr = info.addr;
        if addr >= KERNEL_VIRT_BASE {
            return Err(KernelError::FaultUnhandled {
                addr,
                user_mode: info.user,
            });
        }
        let page = VirtualAddress::new(addr).align_down();
        let mut inner = self.inner.lock();

        let idx = match inner.tree.find(addr) {
            Some(idx) => idx,
            None => self.try_grow_stack(&mut inner, addr)?,
        };
        let (flags, prot) = {
            let area = inner.tree.get(idx);
            (area.flags, area.prot)
        };

        // The access must be one the area allows.
        if info.write && !flags.contains(VmFlags::WRITE) {
            return Err(MmError::BadAccess { addr }.into());
        }
        if info.instruction_fetch && !flags.contains(VmFlags::EXEC) {
            return Err(MmError::BadAccess { addr }.into());
        }
        if !info.write && !info.instruction_fetch && !flags.contains(VmFlags::READ) {
            return Err(MmError::BadAccess { addr }.into());
        }

        if info.present {
            // Present + write on a private writable area: copy-on-write.
            if info.write
                && flags.contains(VmFlags::WRITE)
                && flags.contains(VmFlags::PRIVATE)
            {
                return self.break_cow(page, prot);
            }
            // Any other present fault is a protection error the checks
            // above should have caught.
            return Err(MmError::BadAccess { addr }.into());
        }

        // Demand paging. The mm lock is released first: nothing below
        // walks the tree, and allocator calls are never made under
        // another subsystem's lock.
        let file = {
            let area = inner.tree.get(idx);
            area.file
                .as_ref()
                .map(|f| (f.file.clone(), area.file_offset_at(page.as_usize())))
        };
        drop(inner);

        let frame = self
            .paging
            .frame_alloc_zeroed()
            .ok_or(MmError::OutOfMemory {
                requested: PAGE_SIZE,
            })?;

        if let Some((file, offset)) = file {
            let read = {
                let mapping = self
                    .paging
                    .map_temp(frame)
                    .expect("temp window for file read");
                // SAFETY: The window maps exactly this zeroed frame.
                let buf =
                    unsafe { core::slice::from_raw_parts_mut(mapping.ptr(), PAGE_SIZE) };
                file.read_page(offset, buf)
            };
            if let Err(e) = read {
                self.paging.put_frame(frame);
                return Err(e);
            }
        }

        if let Err(e) = self.paging.map_single(self.pd, page, frame, prot) {
            self.paging.put_frame(frame);
            return Err(e);
        }
        debug!(
            "vma: demand-mapped {:#x} -> {:#x} ({})",
            page.as_usize(),
            frame.as_usize(),
            if flags.contains(VmFlags::ANONYMOUS) {
                "anon"
            } else {
                "file"
            }
        );
        Ok(())
    }

    /// Write fault on a present read-only page of a private writable
    /// area: flip or copy.
    fn break_cow(&self, page: VirtualAddress, prot: PteFlags) -> KernelResult<()> {
        let pte = self
            .paging
            .pte(self.pd, page)
            .ok_or(MmError::UnmappedMemory {
                addr: page.as_usize(),
            })?;
        let src = pte.addr();

        if self.paging.frame_refcount(src) == 1 {
            // Sole owner: just make it writable again.
            self.paging
                .update_flags(self.pd, page, prot | PteFlags::WRITABLE)?;
            return Ok(());
        }

        let copy = self
            .paging
            .frame_alloc()
            .ok_or(MmError::OutOfMemory {
                requested: PAGE_SIZE,
            })?;
        self.paging.copy_frame(copy, src);
        self.paging
            .remap_single(self.pd, page, copy, prot | PteFlags::WRITABLE)?;
        self.paging.put_frame(src);
        debug!(
            "vma: cow break at {:#x}: {:#x} -> {:#x}",
            page.as_usize(),
            src.as_usize(),
            copy.as_usize()
        );
        Ok(())
    }

    /// A fault below a `GROWS_DOWN` area within the growth bound extends
    /// the area down to the faulting page.
    fn try_grow_stack(
        &self,
        inner: &mut MmInner,
        addr: usize,
    ) -> Result<u32, KernelError> {
        let above = inner
            .tree
            .lower_bound(addr)
            .ok_or(MmError::UnmappedMemory { addr })?;
        let (a_start, growable) = {
            let area = inner.tree.get(above);
            (
                area.start,
                area.flags.contains(VmFlags::GROWS_DOWN) && addr < area.start,
            )
        };
        if !growable || a_start - addr > MAX_STACK_GROWTH {
            return Err(MmError::UnmappedMemory { addr }.into());
        }
        let new_start = VirtualAddress::new(addr).align_down().as_usize();

        // Keep a guard gap above whatever lies below.
        if let Some(below) = inner.tree.lower_bound(addr.wrapping_sub(MAX_STACK_GROWTH)) {
            let below_end = inner.tree.get(below).end();
            if below != above && new_start < below_end + STACK_GUARD_GAP {
                return Err(MmError::UnmappedMemory { addr }.into());
            }
        }

        inner.tree.get_mut(above).start = new_start;
        debug!("vma: stack grown down to {:#x}", new_start);
        Ok(above)
    }

    /// Duplicate this address space for a fork: same VMAs, and every
    /// materialized private page shared read-only copy-on-write between
    /// parent and child.
    pub fn clone_address_space(&self) -> KernelResult<AddressSpace> {
        let child = AddressSpace::new(self.paging)?;
        let inner = self.inner.lock();
        {
            let mut child_inner = child.inner.lock();
            child_inner.code = inner.code.clone();
            child_inner.data = inner.data.clone();
            child_inner.heap_start = inner.heap_start;
            child_inner.heap_break = inner.heap_break;
            child_inner.stack_top = inner.stack_top;

            let mut idx = inner.tree.first();
            while idx != NIL {
                let area = inner.tree.get(idx);
                child_inner.tree.insert(VmArea {
                    start: area.start,
                    end: area.end,
                    flags: area.flags,
                    prot: area.prot,
                    file: area.file.clone(),
                });
                child_inner.map_count += 1;

                let share_cow =
                    area.flags.contains(VmFlags::PRIVATE) && area.flags.contains(VmFlags::WRITE);

                // Walk the materialized pages of this area.
                let mut page = area.start;
                while page < area.end {
                    let vaddr = VirtualAddress::new(page);
                    if let Some(pte) = self.paging.pte(self.pd, vaddr) {
                        let phys = pte.addr();
                        if share_cow {
                            let ro = (area.prot - PteFlags::WRITABLE) | PteFlags::COW;
                            self.paging.update_flags(self.pd, vaddr, ro)?;
                            self.paging.map_single(child.pd, vaddr, phys, ro)?;
                        } else {
                            self.paging
                                .map_single(child.pd, vaddr, phys, pte.flags())?;
                        }
                        self.paging.get_frame(phys);
                    }
                    page += PAGE_SIZE;
                }
                idx = inner.tree.next(idx);
            }
        }
        Ok(child)
    }

    /// Tear everything down: unmap every area (dropping frame refs), free
    /// the user page tables and the directory.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        let paging = self.paging;
        let pd = self.pd;
        inner.tree.drain_post_order(|area| {
            paging.unmap_range(pd, VirtualAddress::new(area.start), area.end - area.start);
        });
        inner.map_count = 0;
        drop(inner);
        paging.free_user_pd(pd);
    }

    // --- segment tracking -------------------------------------------------

    pub fn set_code_range(&self, range: core::ops::Range<usize>) {
        self.inner.lock().code = range;
    }

    pub fn set_data_range(&self, range: core::ops::Range<usize>) {
        self.inner.lock().data = range;
    }

    /// Establish the heap base. The break starts equal to it.
    pub fn set_heap_start(&self, start: usize) {
        let mut inner = self.inner.lock();
        inner.heap_start = start;
        inner.heap_break = start;
    }

    pub fn heap_break(&self) -> usize {
        self.inner.lock().heap_break
    }

    /// Move the program break, growing or shrinking the heap area.
    pub fn brk(&self, new_break: usize) -> KernelResult<usize> {
        let (heap_start, old_break) = {
            let inner = self.inner.lock();
            (inner.heap_start, inner.heap_break)
        };
        if heap_start == 0 || new_break < heap_start {
            return Err(KernelError::InvalidArgument { name: "brk" });
        }
        let old_top = VirtualAddress::new(old_break).align_up().as_usize();
        let new_top = VirtualAddress::new(new_break).align_up().as_usize();

        if new_top > old_top {
            self.insert_vma(
                old_top,
                new_top,
                VmFlags::READ
                    | VmFlags::WRITE
                    | VmFlags::PRIVATE
                    | VmFlags::ANONYMOUS
                    | VmFlags::HEAP,
                PteFlags::USER_DATA,
                None,
            )?;
        } else if new_top < old_top {
            self.remove_vma_range(new_top, old_top - new_top)?;
        }
        self.inner.lock().heap_break = new_break;
        Ok(new_break)
    }

    pub fn stack_top(&self) -> usize {
        self.inner.lock().stack_top
    }

    /// Create the main stack: a `GROWS_DOWN` anonymous area of `size`
    /// bytes ending at `top`.
    pub fn setup_stack(&self, top: usize, size: usize) -> KernelResult<()> {
        self.insert_vma(
            top - size,
            top,
            VmFlags::READ
                | VmFlags::WRITE
                | VmFlags::PRIVATE
                | VmFlags::ANONYMOUS
                | VmFlags::GROWS_DOWN
                | VmFlags::STACK,
            PteFlags::USER_DATA,
            None,
        )?;
        self.inner.lock().stack_top = top;
        Ok(())
    }

    /// Validate the tree invariants (tests and debugging).
    pub fn check_invariants(&self) {
        self.inner.lock().tree.assert_valid();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::TestStack;

    const MIB: usize = 1024 * 1024;

    const RW_ANON: VmFlags = VmFlags::READ
        .union(VmFlags::WRITE)
        .union(VmFlags::PRIVATE)
        .union(VmFlags::ANONYMOUS);

    fn anon_mm(stack: &TestStack) -> AddressSpace {
        AddressSpace::new(stack.paging).expect("address space")
    }

    fn write_fault(mm: &AddressSpace, addr: usize) {
        let info = PageFaultInfo::from_error_code(addr, 0b110, 0);
        mm.handle_fault(&info).expect("write fault should resolve");
    }

    fn present_write_fault(mm: &AddressSpace, addr: usize) {
        let info = PageFaultInfo::from_error_code(addr, 0b111, 0);
        mm.handle_fault(&info)
            .expect("present write fault should resolve");
    }

    /// Read one byte through the page tables, the way the MMU would.
    fn read_user_byte(stack: &TestStack, mm: &AddressSpace, addr: usize) -> u8 {
        let (phys, _) = stack
            .paging
            .translate(mm.page_dir(), VirtualAddress::new(addr))
            .expect("address should be mapped");
        let ptr = stack.paging.phys_map().phys_to_virt(phys).as_usize() as *const u8;
        // SAFETY: translate proved the arena-backed frame exists.
        unsafe { ptr.read() }
    }

    fn write_user_byte(stack: &TestStack, mm: &AddressSpace, addr: usize, value: u8) {
        let (phys, _) = stack
            .paging
            .translate(mm.page_dir(), VirtualAddress::new(addr))
            .expect("address should be mapped");
        let ptr = stack.paging.phys_map().phys_to_virt(phys).as_usize() as *mut u8;
        // SAFETY: As above; tests only write pages they faulted in.
        unsafe { ptr.write(value) }
    }

    #[test]
    fn insert_rejects_overlap() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x14000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("first insert");
        assert!(mm
            .insert_vma(0x12000, 0x16000, RW_ANON, PteFlags::USER_DATA, None)
            .is_err());
        assert_eq!(mm.map_count(), 1);
        mm.check_invariants();
    }

    #[test]
    fn insert_rejects_kernel_half_and_misalignment() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        assert!(mm
            .insert_vma(
                KERNEL_VIRT_BASE - 0x1000,
                KERNEL_VIRT_BASE + 0x1000,
                RW_ANON,
                PteFlags::USER_DATA,
                None
            )
            .is_err());
        assert!(mm
            .insert_vma(0x1234, 0x4000, RW_ANON, PteFlags::USER_DATA, None)
            .is_err());
    }

    #[test]
    fn adjacent_compatible_areas_merge() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x14000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("first");
        mm.insert_vma(0x14000, 0x18000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("second");
        assert_eq!(mm.map_count(), 1, "adjacent identical areas should merge");
        let vma = mm.find_vma(0x15000).expect("merged area");
        assert_eq!(vma.start, 0x10000);
        assert_eq!(vma.end, 0x18000);

        // A gap-filling insert merges all three into one.
        mm.insert_vma(0x20000, 0x24000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("third");
        assert_eq!(mm.map_count(), 2);
        mm.insert_vma(0x18000, 0x20000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("filler");
        assert_eq!(mm.map_count(), 1);
        mm.check_invariants();
    }

    #[test]
    fn incompatible_neighbors_do_not_merge() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x14000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("first");
        mm.insert_vma(
            0x14000,
            0x18000,
            VmFlags::READ | VmFlags::PRIVATE | VmFlags::ANONYMOUS,
            PteFlags::USER_RO,
            None,
        )
        .expect("second");
        assert_eq!(mm.map_count(), 2);
    }

    #[test]
    fn remove_range_splits_straddling_area() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x20000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("insert");

        // Carve the middle out: [0x14000, 0x18000).
        mm.remove_vma_range(0x14000, 0x4000).expect("carve");
        assert_eq!(mm.map_count(), 2);
        assert!(mm.find_vma(0x15000).is_none());
        assert_eq!(mm.find_vma(0x10000).expect("head").end, 0x14000);
        assert_eq!(mm.find_vma(0x18000).expect("tail").start, 0x18000);
        mm.check_invariants();

        // Trim the head area's front.
        mm.remove_vma_range(0x10000, 0x1000).expect("trim");
        assert!(mm.find_vma(0x10000).is_none());
        assert_eq!(mm.find_vma(0x11000).expect("rest").start, 0x11000);

        // Remove across both remaining areas at once.
        mm.remove_vma_range(0x11000, 0x20000 - 0x11000).expect("rest");
        assert_eq!(mm.map_count(), 0);
        mm.check_invariants();
    }

    #[test]
    fn remove_range_releases_materialized_frames() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x14000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("insert");
        write_fault(&mm, 0x10000);
        write_fault(&mm, 0x11000);
        let (phys, _) = stack
            .paging
            .translate(mm.page_dir(), VirtualAddress::new(0x10000))
            .expect("mapped");
        assert_eq!(stack.frames.refcount(phys), 1);

        mm.remove_vma_range(0x10000, 0x4000).expect("remove");
        assert_eq!(stack.frames.refcount(phys), 0);
        assert!(stack
            .paging
            .translate(mm.page_dir(), VirtualAddress::new(0x10000))
            .is_none());
    }

    #[test]
    fn anonymous_demand_fault_maps_zeroed_page() {
        // Scenario S3.
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(0x10000, 0x14000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("insert");

        let info = PageFaultInfo::from_error_code(0x11234, 0b110, 0);
        mm.handle_fault(&info).expect("demand fault");

        let vma = mm.find_vma(0x11234).expect("same vma");
        assert_eq!((vma.start, vma.end), (0x10000, 0x14000));
        for probe in [0x11000, 0x11234, 0x11FFF] {
            assert_eq!(read_user_byte(&stack, &mm, probe), 0);
        }
        // Only the faulted page materialized.
        assert!(stack
            .paging
            .translate(mm.page_dir(), VirtualAddress::new(0x10000))
            .is_none());
    }

    #[test]
    fn fault_against_missing_area_fails() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        let info = PageFaultInfo::from_error_code(0x7000_0000, 0b110, 0);
        assert!(mm.handle_fault(&info).is_err());
    }

    #[test]
    fn write_fault_on_readonly_area_is_denied() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(
            0x10000,
            0x11000,
            VmFlags::READ | VmFlags::PRIVATE | VmFlags::ANONYMOUS,
            PteFlags::USER_RO,
            None,
        )
        .expect("insert");
        let info = PageFaultInfo::from_error_code(0x10500, 0b110, 0);
        assert!(mm.handle_fault(&info).is_err());
    }

    #[test]
    fn cow_after_clone() {
        // Scenario S4.
        let stack = TestStack::new(32 * MIB);
        let parent = anon_mm(&stack);
        parent
            .insert_vma(0x10000, 0x12000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("insert");
        write_fault(&parent, 0x10000);
        write_user_byte(&stack, &parent, 0x10000, 0x42);

        let child = parent.clone_address_space().expect("fork");
        let (orig_phys, parent_flags) = stack
            .paging
            .translate(parent.page_dir(), VirtualAddress::new(0x10000))
            .expect("parent mapped");
        let (child_phys, child_flags) = stack
            .paging
            .translate(child.page_dir(), VirtualAddress::new(0x10000))
            .expect("child mapped");
        assert_eq!(orig_phys.align_down(), child_phys.align_down());
        assert_eq!(stack.frames.refcount(orig_phys.align_down()), 2);
        assert!(!parent_flags.contains(PteFlags::WRITABLE));
        assert!(!child_flags.contains(PteFlags::WRITABLE));
        assert!(parent_flags.contains(PteFlags::COW));

        // Parent writes: a private copy appears, the child keeps the
        // original bytes.
        present_write_fault(&parent, 0x10000);
        write_user_byte(&stack, &parent, 0x10000, 0x99);

        let (new_phys, new_flags) = stack
            .paging
            .translate(parent.page_dir(), VirtualAddress::new(0x10000))
            .expect("parent remapped");
        assert_ne!(new_phys.align_down(), orig_phys.align_down());
        assert!(new_flags.contains(PteFlags::WRITABLE));
        assert_eq!(stack.frames.refcount(orig_phys.align_down()), 1);
        assert_eq!(read_user_byte(&stack, &child, 0x10000), 0x42);
        assert_eq!(read_user_byte(&stack, &parent, 0x10000), 0x99);

        // Child's write now finds itself sole owner: PTE flips in place.
        present_write_fault(&child, 0x10000);
        let (child_phys2, child_flags2) = stack
            .paging
            .translate(child.page_dir(), VirtualAddress::new(0x10000))
            .expect("child still mapped");
        assert_eq!(child_phys2.align_down(), orig_phys.align_down());
        assert!(child_flags2.contains(PteFlags::WRITABLE));
    }

    #[test]
    fn stack_grows_downward_within_bound() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.setup_stack(0x0100_0000, 0x4000).expect("stack");

        // Fault one page below the stack area.
        let below = 0x0100_0000 - 0x4000 - 0x800;
        let info = PageFaultInfo::from_error_code(below, 0b110, 0);
        mm.handle_fault(&info).expect("growth fault");
        let vma = mm.find_vma(below).expect("grown stack");
        assert!(vma.flags.contains(VmFlags::GROWS_DOWN));
        assert_eq!(vma.end, 0x0100_0000);

        // Far below the growth bound (measured from the grown start):
        // denied.
        let grown_start = mm.find_vma(below).expect("grown").start;
        let far = grown_start - MAX_STACK_GROWTH - PAGE_SIZE;
        let info = PageFaultInfo::from_error_code(far, 0b110, 0);
        assert!(mm.handle_fault(&info).is_err());
        mm.check_invariants();
    }

    #[test]
    fn file_backed_fault_reads_through_collaborator() {
        struct PatternFile;
        impl VmFile for PatternFile {
            fn read_page(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = ((offset as usize + i) % 251) as u8;
                }
                Ok(buf.len())
            }
        }

        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.insert_vma(
            0x10000,
            0x13000,
            VmFlags::READ | VmFlags::PRIVATE | VmFlags::FILEBACKED,
            PteFlags::USER_RO,
            Some(FileMapping {
                file: Arc::new(PatternFile),
                offset: 0x2000,
            }),
        )
        .expect("insert");

        let info = PageFaultInfo::from_error_code(0x11800, 0b100, 0);
        mm.handle_fault(&info).expect("file fault");
        // Page 0x11000 maps file offset 0x3000.
        assert_eq!(read_user_byte(&stack, &mm, 0x11000), (0x3000 % 251) as u8);
        assert_eq!(
            read_user_byte(&stack, &mm, 0x11007),
            ((0x3000 + 7) % 251) as u8
        );
    }

    #[test]
    fn brk_grows_and_shrinks_heap() {
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        mm.set_heap_start(0x0080_0000);
        mm.brk(0x0080_3000).expect("grow");
        assert!(mm.find_vma(0x0080_1000).is_some());
        write_fault(&mm, 0x0080_1000);

        mm.brk(0x0080_1000).expect("shrink");
        assert!(mm.find_vma(0x0080_1000).is_none());
        assert_eq!(mm.heap_break(), 0x0080_1000);
        assert!(mm.brk(0x0070_0000).is_err(), "below heap start");
    }

    #[test]
    fn destroy_returns_every_frame_and_table() {
        let stack = TestStack::new(16 * MIB);
        let free_before = stack.buddy.stats().free_bytes;
        {
            let mm = anon_mm(&stack);
            mm.insert_vma(0x10000, 0x18000, RW_ANON, PteFlags::USER_DATA, None)
                .expect("insert");
            mm.setup_stack(0x0100_0000, 0x8000).expect("stack");
            for page in (0x10000..0x18000).step_by(PAGE_SIZE) {
                write_fault(&mm, page);
            }
            write_fault(&mm, 0x0100_0000 - 0x1000);
            // Dropping the address space runs destroy().
        }
        assert_eq!(stack.buddy.stats().free_bytes, free_before);
    }

    #[test]
    fn destroy_after_clone_respects_sharing() {
        let stack = TestStack::new(32 * MIB);
        let parent = anon_mm(&stack);
        parent
            .insert_vma(0x10000, 0x12000, RW_ANON, PteFlags::USER_DATA, None)
            .expect("insert");
        write_fault(&parent, 0x10000);
        let (phys, _) = stack
            .paging
            .translate(parent.page_dir(), VirtualAddress::new(0x10000))
            .expect("mapped");

        let child = parent.clone_address_space().expect("fork");
        assert_eq!(stack.frames.refcount(phys.align_down()), 2);

        drop(child);
        assert_eq!(stack.frames.refcount(phys.align_down()), 1);
        assert_eq!(read_user_byte(&stack, &parent, 0x10000), 0);
        drop(parent);
        assert_eq!(stack.frames.refcount(phys.align_down()), 0);
    }

    #[test]
    fn many_areas_keep_tree_valid() {
        // Property 6 exercised across a longer insert/remove sequence.
        let stack = TestStack::new(16 * MIB);
        let mm = anon_mm(&stack);
        for i in 0..128usize {
            let start = 0x10000 + i * 0x3000;
            mm.insert_vma(start, start + 0x1000, RW_ANON, PteFlags::USER_DATA, None)
                .expect("insert");
        }
        mm.check_invariants();
        for i in (0..128usize).step_by(3) {
            let start = 0x10000 + i * 0x3000;
            mm.remove_vma_range(start, 0x1000).expect("remove");
            mm.check_invariants();
        }
        // No overlaps ever: a blanket overlap probe over the whole span
        // matches the remaining map count.
        let mut count = 0;
        let mut cursor = 0x10000usize;
        while let Some(vma) = mm.find_overlap(cursor, 0x10000 + 128 * 0x3000) {
            count += 1;
            cursor = vma.end;
        }
        assert_eq!(count, mm.map_count());
    }
}
