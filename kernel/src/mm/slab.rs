//! Slab allocator
//!
//! Fixed-size object caches built on single buddy pages. Each slab is one
//! 4 KiB page: a header at offset 0, then the object area starting at a
//! per-slab color offset (so peer slabs don't hammer the same cache
//! lines), packed at the cache's slot stride. A slot's last four bytes
//! hold a footer canary; the free chain threads through the free slots
//! themselves.
//!
//! A slab is always on exactly one of the cache's three lists: `partial`
//! (some objects free), `full` (none free) or `empty` (all free). The
//! cache lock is *not* held across the buddy call when growing, so a long
//! buddy split can never deadlock against allocator reentry.

use core::ptr::NonNull;

use log::{debug, error};

use super::{buddy::BuddyAllocator, PAGE_SIZE};
use crate::sync::IrqSpinLock;

/// Magic value in every live slab header.
const SLAB_MAGIC: u32 = 0x51AB_CAFE;
/// Footer canary of an allocated (or never-touched) slot.
pub const SLAB_FOOTER_MAGIC: u32 = 0xF00D_FACE;
/// Footer canary of a slot sitting on the free chain.
const SLAB_FREE_MAGIC: u32 = 0xDEAD_F00D;

/// Footer canary size.
const FOOTER_SIZE: usize = core::mem::size_of::<u32>();

/// Offset sentinel meaning "end of free chain". Offset 0 is the header, so
/// no slot can legitimately start there.
const FREE_END: usize = 0;

/// Which cache list a slab is on. Stored in the header so list moves can
/// be cross-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Partial,
    Full,
    Empty,
}

/// Slab header, at offset 0 of the slab's page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    /// Owning cache.
    cache: *const SlabCache,
    /// Page-relative offset of the first free slot, or [`FREE_END`].
    free_head: usize,
    free_count: usize,
    objs_this_slab: usize,
    color_offset: usize,
    state: SlabState,
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
}

/// Intrusive doubly-linked list of slabs, threaded through their headers.
struct SlabList {
    head: *mut SlabHeader,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `slab` must be a valid header not currently on any list.
    unsafe fn push(&mut self, slab: *mut SlabHeader) {
        // SAFETY: Caller guarantees slab validity; head is ours.
        unsafe {
            (*slab).next = self.head;
            (*slab).prev = core::ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `slab` must be on this list.
    unsafe fn unlink(&mut self, slab: *mut SlabHeader) {
        // SAFETY: Caller guarantees membership; neighbors are valid slabs.
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
            if prev.is_null() {
                debug_assert_eq!(self.head, slab);
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).next = core::ptr::null_mut();
            (*slab).prev = core::ptr::null_mut();
        }
        self.len -= 1;
    }
}

struct CacheInner {
    partial: SlabList,
    full: SlabList,
    empty: SlabList,
    color_next: usize,
    alloc_count: u64,
    free_count: u64,
    slab_count: usize,
}

// SAFETY: Raw slab pointers are only dereferenced under the cache lock;
// the pages themselves belong to the cache until freed back to the buddy.
unsafe impl Send for CacheInner {}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabCacheStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub slab_count: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub empty_slabs: usize,
    pub free_objects: usize,
}

/// A named cache of equal-size objects.
pub struct SlabCache {
    name: &'static str,
    /// Caller-visible object size.
    object_size: usize,
    /// Internal stride: `align_up(object_size + footer, align)`, at least
    /// one pointer so the free chain fits.
    slot_size: usize,
    align: usize,
    color_range: usize,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
    /// Return empty slabs to the buddy instead of caching them.
    reclaim: bool,
    buddy: &'static BuddyAllocator,
    inner: IrqSpinLock<CacheInner>,
}

// SAFETY: All mutable state is behind the IrqSpinLock.
unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

/// Object area start for a given color offset.
fn object_base(color_offset: usize) -> usize {
    let header = align_up(core::mem::size_of::<SlabHeader>(), core::mem::align_of::<usize>());
    header + color_offset
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl SlabCache {
    /// Create a cache. `align` must be a power of two; zero picks pointer
    /// alignment. `color_range` of zero disables coloring.
    pub fn new(
        name: &'static str,
        object_size: usize,
        align: usize,
        color_range: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
        buddy: &'static BuddyAllocator,
    ) -> Self {
        let align = if align == 0 {
            core::mem::align_of::<usize>()
        } else {
            align
        };
        assert!(align.is_power_of_two(), "slab alignment must be a power of two");
        let slot_size = align_up(object_size + FOOTER_SIZE, align)
            .max(core::mem::size_of::<usize>() + FOOTER_SIZE);
        assert!(
            object_base(0) + slot_size <= PAGE_SIZE,
            "slab object too large for one page"
        );
        Self {
            name,
            object_size,
            slot_size,
            align,
            color_range,
            ctor,
            dtor,
            reclaim: cfg!(feature = "slab-reclaim"),
            buddy,
            inner: IrqSpinLock::new(CacheInner {
                partial: SlabList::new(),
                full: SlabList::new(),
                empty: SlabList::new(),
                color_next: 0,
                alloc_count: 0,
                free_count: 0,
                slab_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Allocate one object.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        loop {
            {
                let mut inner = self.inner.lock();
                // Prefer a partial slab, else promote an empty one.
                let slab = if !inner.partial.head.is_null() {
                    inner.partial.head
                } else if !inner.empty.head.is_null() {
                    let slab = inner.empty.head;
                    // SAFETY: Head of our own empty list.
                    unsafe {
                        inner.empty.unlink(slab);
                        (*slab).state = SlabState::Partial;
                        inner.partial.push(slab);
                    }
                    slab
                } else {
                    core::ptr::null_mut()
                };

                if !slab.is_null() {
                    // SAFETY: Slabs on our lists carry valid headers and
                    // their page belongs to this cache.
                    let ptr = unsafe { self.pop_object(&mut inner, slab) };
                    drop(inner);
                    if let Some(ctor) = self.ctor {
                        ctor(ptr.as_ptr());
                    }
                    return Some(ptr);
                }
            }

            // No slab has room: grow with the cache lock released, so the
            // buddy can take as long as it likes.
            self.grow()?;
        }
    }

    /// Pop the head of `slab`'s free chain and fix up list membership.
    ///
    /// # Safety
    ///
    /// Caller holds the cache lock and `slab` is on `partial`.
    unsafe fn pop_object(&self, inner: &mut CacheInner, slab: *mut SlabHeader) -> NonNull<u8> {
        let page = slab as usize;
        // SAFETY: Caller contract.
        unsafe {
            debug_assert_eq!((*slab).magic, SLAB_MAGIC);
            debug_assert!((*slab).free_count > 0);
            let offset = (*slab).free_head;
            debug_assert_ne!(offset, FREE_END);
            let obj = (page + offset) as *mut u8;
            (*slab).free_head = (obj as *const usize).read();
            (*slab).free_count -= 1;
            // Arm the footer canary for the allocated slot.
            ((obj.add(self.slot_size - FOOTER_SIZE)) as *mut u32).write(SLAB_FOOTER_MAGIC);
            if (*slab).free_count == 0 {
                inner.partial.unlink(slab);
                (*slab).state = SlabState::Full;
                inner.full.push(slab);
            }
            inner.alloc_count += 1;
            NonNull::new_unchecked(obj)
        }
    }

    /// Allocate and lay out one new slab page, then link it in.
    fn grow(&self) -> Option<()> {
        let page = self.buddy.alloc_page()?;
        let base = page.as_ptr() as usize;

        // Color this slab, staying within the page's leftover space.
        let (color_offset, objs) = {
            let mut inner = self.inner.lock();
            let color = if self.color_range == 0 {
                0
            } else {
                let c = (inner.color_next * self.align) % self.color_range;
                inner.color_next += 1;
                c
            };
            let leftover = PAGE_SIZE - object_base(0) - self.slot_size;
            let color = color.min(leftover);
            let objs = (PAGE_SIZE - object_base(color)) / self.slot_size;
            (color, objs)
        };
        debug_assert!(objs >= 1);

        let header = base as *mut SlabHeader;
        // SAFETY: The page is a fresh, exclusively owned buddy page.
        unsafe {
            header.write(SlabHeader {
                magic: SLAB_MAGIC,
                cache: self,
                free_head: FREE_END,
                free_count: objs,
                objs_this_slab: objs,
                color_offset,
                state: SlabState::Empty,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
            });
            // Chain the slots together, last to first, and lay down the
            // footer canaries.
            let obj_base = object_base(color_offset);
            let mut next = FREE_END;
            for i in (0..objs).rev() {
                let offset = obj_base + i * self.slot_size;
                let slot = (base + offset) as *mut usize;
                slot.write(next);
                ((base + offset + self.slot_size - FOOTER_SIZE) as *mut u32)
                    .write(SLAB_FOOTER_MAGIC);
                next = offset;
            }
            // First slot of the chain is the lowest-addressed one.
            (*header).free_head = obj_base;
        }

        let mut inner = self.inner.lock();
        // SAFETY: The header was fully initialized above and is not on any
        // list yet.
        unsafe {
            inner.empty.push(header);
        }
        inner.slab_count += 1;
        debug!(
            "slab: cache '{}' grew to {} slabs ({} objs/slab)",
            self.name, inner.slab_count, objs
        );
        Some(())
    }

    /// Free one object.
    ///
    /// Panics on corruption: bad slab magic, wrong cache, a pointer that
    /// does not hit a slot boundary, or a stomped footer canary. A free of
    /// an already-free slot panics as a double free.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::alloc`] on this cache and
    /// not freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE - 1);
        let header = page as *mut SlabHeader;

        // Validate before taking the lock: all of these are immutable
        // while the object is live.
        // SAFETY: A valid object pointer implies its page holds our header.
        unsafe {
            if (*header).magic != SLAB_MAGIC {
                panic!("slab: free of {:#x}: bad slab magic", addr);
            }
            if (*header).cache != self as *const _ {
                panic!(
                    "slab: free of {:#x}: object belongs to cache '{}'",
                    addr,
                    (*(*header).cache).name
                );
            }
            let obj_base = object_base((*header).color_offset);
            let offset = addr - page;
            if offset < obj_base
                || (offset - obj_base) % self.slot_size != 0
                || offset + self.slot_size > PAGE_SIZE
            {
                panic!("slab: free of {:#x}: not a slot boundary", addr);
            }
            let footer = ((addr + self.slot_size - FOOTER_SIZE) as *mut u32).read();
            if footer == SLAB_FREE_MAGIC {
                panic!("slab: double free of {:#x} in cache '{}'", addr, self.name);
            }
            if footer != SLAB_FOOTER_MAGIC {
                panic!(
                    "slab: footer canary mismatch on {:#x} in cache '{}' ({:#x})",
                    addr, self.name, footer
                );
            }
        }

        if let Some(dtor) = self.dtor {
            dtor(ptr.as_ptr());
        }

        let release_page = {
            let mut inner = self.inner.lock();
            // SAFETY: Validated above; list state is ours under the lock.
            unsafe {
                let offset = addr - page;
                (ptr.as_ptr() as *mut usize).write((*header).free_head);
                ((addr + self.slot_size - FOOTER_SIZE) as *mut u32).write(SLAB_FREE_MAGIC);
                (*header).free_head = offset;
                (*header).free_count += 1;
                inner.free_count += 1;

                match (*header).state {
                    SlabState::Full => {
                        inner.full.unlink(header);
                        (*header).state = SlabState::Partial;
                        inner.partial.push(header);
                    }
                    SlabState::Partial => {}
                    SlabState::Empty => {
                        panic!("slab: free into an empty slab in cache '{}'", self.name)
                    }
                }

                if (*header).free_count == (*header).objs_this_slab {
                    inner.partial.unlink(header);
                    if self.reclaim {
                        (*header).magic = 0;
                        inner.slab_count -= 1;
                        true
                    } else {
                        (*header).state = SlabState::Empty;
                        inner.empty.push(header);
                        false
                    }
                } else {
                    false
                }
            }
        };

        // The buddy call happens with the cache lock dropped.
        if release_page {
            if let Some(page_ptr) = NonNull::new(page as *mut u8) {
                self.buddy.free_page(page_ptr);
            }
        }
    }

    /// Tear the cache down, returning every slab to the buddy.
    ///
    /// Logs an error and leaks the slab if objects are still live in it.
    pub fn destroy(&self) {
        let mut pages = [core::ptr::null_mut::<u8>(); 64];
        loop {
            let mut count = 0;
            {
                let mut inner = self.inner.lock();
                while count < pages.len() {
                    let slab = if !inner.empty.head.is_null() {
                        inner.empty.head
                    } else if !inner.partial.head.is_null() {
                        let slab = inner.partial.head;
                        // SAFETY: Head of our own list.
                        unsafe {
                            error!(
                                "slab: destroying cache '{}' with {} live objects in a slab",
                                self.name,
                                (*slab).objs_this_slab - (*slab).free_count
                            );
                        }
                        slab
                    } else if !inner.full.head.is_null() {
                        let slab = inner.full.head;
                        error!(
                            "slab: destroying cache '{}' with a full slab of live objects",
                            self.name
                        );
                        slab
                    } else {
                        break;
                    };
                    // SAFETY: The slab is on the list we just inspected.
                    unsafe {
                        match (*slab).state {
                            SlabState::Partial => inner.partial.unlink(slab),
                            SlabState::Full => inner.full.unlink(slab),
                            SlabState::Empty => inner.empty.unlink(slab),
                        }
                        (*slab).magic = 0;
                    }
                    inner.slab_count -= 1;
                    pages[count] = slab as *mut u8;
                    count += 1;
                }
            }
            if count == 0 {
                break;
            }
            for page in pages.iter().take(count) {
                if let Some(ptr) = NonNull::new(*page) {
                    self.buddy.free_page(ptr);
                }
            }
        }
    }

    pub fn stats(&self) -> SlabCacheStats {
        let inner = self.inner.lock();
        let mut free_objects = 0;
        for head in [inner.partial.head, inner.empty.head] {
            let mut slab = head;
            while !slab.is_null() {
                // SAFETY: List members are valid while the lock is held.
                unsafe {
                    free_objects += (*slab).free_count;
                    slab = (*slab).next;
                }
            }
        }
        SlabCacheStats {
            alloc_count: inner.alloc_count,
            free_count: inner.free_count,
            slab_count: inner.slab_count,
            partial_slabs: inner.partial.len,
            full_slabs: inner.full.len,
            empty_slabs: inner.empty.len,
            free_objects,
        }
    }

    /// Walk every list and verify the runtime invariants: magic intact,
    /// membership matches the state tag, and free counts agree with the
    /// list a slab is on. Used by tests and debug assertions.
    pub fn check_invariants(&self) {
        let inner = self.inner.lock();
        let checks: [(&SlabList, SlabState); 3] = [
            (&inner.partial, SlabState::Partial),
            (&inner.full, SlabState::Full),
            (&inner.empty, SlabState::Empty),
        ];
        for (list, state) in checks {
            let mut slab = list.head;
            let mut seen = 0;
            while !slab.is_null() {
                // SAFETY: List members are valid while the lock is held.
                unsafe {
                    assert_eq!((*slab).magic, SLAB_MAGIC, "slab magic trashed");
                    assert_eq!((*slab).state, state, "slab on wrong list");
                    match state {
                        SlabState::Full => assert_eq!((*slab).free_count, 0),
                        SlabState::Empty => {
                            assert_eq!((*slab).free_count, (*slab).objs_this_slab)
                        }
                        SlabState::Partial => {
                            assert!((*slab).free_count > 0);
                            assert!((*slab).free_count < (*slab).objs_this_slab);
                        }
                    }
                    slab = (*slab).next;
                }
                seen += 1;
                assert!(seen <= inner.slab_count, "slab list cycle");
            }
            assert_eq!(seen, list.len, "slab list length out of sync");
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::TestArena;

    const MIB: usize = 1024 * 1024;

    fn fresh_buddy() -> &'static BuddyAllocator {
        let arena = TestArena::new(8 * MIB);
        // SAFETY: Arena leaked below; the buddy owns it forever.
        let buddy: &'static BuddyAllocator = std::boxed::Box::leak(std::boxed::Box::new(unsafe {
            BuddyAllocator::init(arena.base(), arena.fake_phys_base(), arena.len())
        }));
        std::mem::forget(arena);
        buddy
    }

    #[test]
    fn alloc_free_roundtrip() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-64", 64, 8, 0, None, None, buddy);
        let obj = cache.alloc().expect("alloc from fresh cache");
        // SAFETY: We own the 64 bytes.
        unsafe {
            core::ptr::write_bytes(obj.as_ptr(), 0x5A, 64);
            cache.free(obj);
        }
        let stats = cache.stats();
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 1);
        cache.check_invariants();
    }

    #[test]
    fn slab_state_transitions() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-transitions", 256, 8, 0, None, None, buddy);

        // Fill one whole slab.
        let per_slab = (PAGE_SIZE - object_base(0)) / cache.slot_size();
        let mut objs = std::vec::Vec::new();
        for _ in 0..per_slab {
            objs.push(cache.alloc().expect("alloc"));
        }
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);
        cache.check_invariants();

        // One free moves it full -> partial.
        unsafe { cache.free(objs.pop().unwrap()) };
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 0);
        assert_eq!(stats.partial_slabs, 1);
        cache.check_invariants();

        // Freeing the rest empties it.
        for obj in objs.drain(..) {
            unsafe { cache.free(obj) };
        }
        let stats = cache.stats();
        assert_eq!(stats.partial_slabs, 0);
        assert_eq!(stats.empty_slabs + usize::from(cfg!(feature = "slab-reclaim")), 1);
        cache.check_invariants();
    }

    #[test]
    fn grows_across_multiple_slabs() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-many", 500, 8, 32, None, None, buddy);
        let mut objs = std::vec::Vec::new();
        for _ in 0..40 {
            objs.push(cache.alloc().expect("alloc"));
        }
        assert!(cache.stats().slab_count >= 5);
        cache.check_invariants();
        // Distinct pointers.
        for (i, a) in objs.iter().enumerate() {
            for b in objs.iter().skip(i + 1) {
                assert_ne!(a.as_ptr(), b.as_ptr());
            }
        }
        for obj in objs {
            unsafe { cache.free(obj) };
        }
        cache.check_invariants();
    }

    #[test]
    fn coloring_offsets_peer_slabs() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-color", 64, 16, 64, None, None, buddy);
        let per_slab = (PAGE_SIZE - object_base(0)) / cache.slot_size();
        // Fill two slabs and compare first-object page offsets.
        let mut objs = std::vec::Vec::new();
        for _ in 0..per_slab + 1 {
            objs.push(cache.alloc().expect("alloc"));
        }
        let offsets: std::collections::BTreeSet<usize> = objs
            .iter()
            .map(|p| (p.as_ptr() as usize) & (PAGE_SIZE - 1))
            .collect();
        // With coloring on, the second slab's slots sit at different page
        // offsets than the first's.
        assert!(offsets.len() > per_slab);
        for obj in objs {
            unsafe { cache.free(obj) };
        }
    }

    #[test]
    fn constructor_and_destructor_run() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(_p: *mut u8) {
            CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        }
        fn dtor(_p: *mut u8) {
            DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        }
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-hooks", 128, 8, 0, Some(ctor), Some(dtor), buddy);
        let obj = cache.alloc().expect("alloc");
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), 1);
        unsafe { cache.free(obj) };
        assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "footer canary mismatch")]
    fn stomped_footer_is_fatal() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-canary", 40, 8, 0, None, None, buddy);
        let obj = cache.alloc().expect("alloc");
        // SAFETY: Deliberately overrun the slot into its footer.
        unsafe {
            core::ptr::write_bytes(obj.as_ptr(), 0, cache.slot_size());
            cache.free(obj);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let buddy = fresh_buddy();
        let cache = SlabCache::new("test-dfree", 40, 8, 0, None, None, buddy);
        let obj = cache.alloc().expect("alloc");
        unsafe {
            cache.free(obj);
            cache.free(obj);
        }
    }

    #[test]
    fn destroy_returns_pages() {
        let buddy = fresh_buddy();
        let before = buddy.stats().free_bytes;
        let cache = SlabCache::new("test-destroy", 64, 8, 0, None, None, buddy);
        let obj = cache.alloc().expect("alloc");
        unsafe { cache.free(obj) };
        cache.destroy();
        assert_eq!(buddy.stats().free_bytes, before);
    }
}
