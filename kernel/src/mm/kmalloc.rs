//! kmalloc facade
//!
//! The kernel's general-purpose allocator. Small requests go to a ladder
//! of slab caches; anything larger, or a request the slabs cannot satisfy,
//! falls through to the buddy. Every returned pointer is preceded by an
//! [`AllocHeader`] recording how the block was obtained, so `kfree` needs
//! nothing but the pointer.

use core::ptr::NonNull;

use log::error;

use super::{
    buddy::BuddyAllocator,
    slab::SlabCache,
};

/// Alignment guaranteed for every kmalloc pointer.
pub const MIN_ALIGN: usize = 8;

/// Largest request served from the slab caches. Bigger single allocations
/// than this would leave too little of a slab page after the headers.
pub const SLAB_MAX_USER_SIZE: usize = 2048;

/// Slab class sizes. Class n serves any request whose header-inclusive
/// size fits.
const KMALLOC_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];

/// Header magic: "Al".
const HEADER_MAGIC: u16 = 0x416C;
/// What the magic becomes once the block is freed.
const HEADER_DEAD: u16 = 0xDEAD;

/// How the block behind a kmalloc pointer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AllocTag {
    Slab = 1,
    Buddy = 2,
}

/// Hidden header ahead of every kmalloc pointer.
#[repr(C)]
struct AllocHeader {
    /// Requested size in bytes.
    size: u32,
    tag: u8,
    _pad: u8,
    magic: u16,
    /// Owning cache for slab blocks, null for buddy blocks.
    cache: *const SlabCache,
}

/// Header footprint, padded so user pointers keep [`MIN_ALIGN`].
const HEADER_SIZE: usize =
    (core::mem::size_of::<AllocHeader>() + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);

/// Facade statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmallocStats {
    pub slab_allocs: u64,
    pub buddy_allocs: u64,
    pub frees: u64,
    pub failed: u64,
}

/// The kmalloc facade: the slab ladder plus the buddy fallback.
pub struct KernelAllocator {
    buddy: &'static BuddyAllocator,
    caches: [SlabCache; KMALLOC_CLASSES.len()],
    stats: spin::Mutex<KmallocStats>,
}

const CLASS_NAMES: [&str; 7] = [
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
];

impl KernelAllocator {
    pub fn new(buddy: &'static BuddyAllocator) -> Self {
        let caches = core::array::from_fn(|i| {
            SlabCache::new(
                CLASS_NAMES[i],
                KMALLOC_CLASSES[i],
                MIN_ALIGN,
                // A little coloring on the small classes where many objects
                // share a page.
                if KMALLOC_CLASSES[i] <= 256 { 64 } else { 0 },
                None,
                None,
                buddy,
            )
        });
        Self {
            buddy,
            caches,
            stats: spin::Mutex::new(KmallocStats::default()),
        }
    }

    /// Allocate `size` bytes, aligned to [`MIN_ALIGN`]. Returns `None` on
    /// OOM or a zero-size request.
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let total = size.checked_add(HEADER_SIZE)?;

        if size <= SLAB_MAX_USER_SIZE {
            if let Some(cache) = self.caches.iter().find(|c| c.object_size() >= total) {
                if let Some(base) = cache.alloc() {
                    self.stats.lock().slab_allocs += 1;
                    // SAFETY: The slot is at least `total` bytes.
                    return Some(unsafe { self.write_header(base, size, AllocTag::Slab, cache) });
                }
            }
            // Slab exhausted or no class fits: fall through to the buddy.
        }

        match self.buddy.alloc(total) {
            Some(base) => {
                self.stats.lock().buddy_allocs += 1;
                // SAFETY: The buddy block is at least `total` bytes.
                Some(unsafe { self.write_header(base, size, AllocTag::Buddy, core::ptr::null()) })
            }
            None => {
                self.stats.lock().failed += 1;
                None
            }
        }
    }

    /// Allocate zeroed memory.
    pub fn kzalloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.kmalloc(size)?;
        // SAFETY: kmalloc returned at least `size` usable bytes.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }
        Some(ptr)
    }

    /// # Safety
    ///
    /// `base` points to at least `HEADER_SIZE` + size bytes of owned memory.
    unsafe fn write_header(
        &self,
        base: NonNull<u8>,
        size: usize,
        tag: AllocTag,
        cache: *const SlabCache,
    ) -> NonNull<u8> {
        let header = base.as_ptr() as *mut AllocHeader;
        // SAFETY: Caller contract.
        unsafe {
            header.write(AllocHeader {
                size: size as u32,
                tag: tag as u8,
                _pad: 0,
                magic: HEADER_MAGIC,
                cache,
            });
            NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE))
        }
    }

    /// Free a kmalloc pointer.
    ///
    /// Panics on a corrupted or already-freed header: the block's state is
    /// unknown at that point and continuing would spread the damage.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Self::kmalloc`] on this allocator and
    /// not been freed since.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        let base = ptr.as_ptr() as usize - HEADER_SIZE;
        let header = base as *mut AllocHeader;
        // SAFETY: A valid kmalloc pointer has its header just below it.
        let (tag, cache) = unsafe {
            let magic = (*header).magic;
            if magic == HEADER_DEAD {
                panic!("kmalloc: double free of {:#x}", ptr.as_ptr() as usize);
            }
            if magic != HEADER_MAGIC {
                error!(
                    "kmalloc: header magic {:#x} on free of {:#x}",
                    magic,
                    ptr.as_ptr() as usize
                );
                panic!("kmalloc: corrupted allocation header");
            }
            (*header).magic = HEADER_DEAD;
            ((*header).tag, (*header).cache)
        };

        self.stats.lock().frees += 1;
        let base_ptr = NonNull::new(base as *mut u8).expect("kmalloc base is never null");
        match tag {
            t if t == AllocTag::Slab as u8 => {
                // SAFETY: The header says this block came from `cache`.
                unsafe { (*cache).free(base_ptr) }
            }
            t if t == AllocTag::Buddy as u8 => self.buddy.free(base_ptr),
            other => panic!("kmalloc: invalid allocation tag {}", other),
        }
    }

    /// Recorded request size of a live kmalloc pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer from [`Self::kmalloc`].
    pub unsafe fn ksize(&self, ptr: NonNull<u8>) -> usize {
        let header = (ptr.as_ptr() as usize - HEADER_SIZE) as *const AllocHeader;
        // SAFETY: Caller contract.
        unsafe { (*header).size as usize }
    }

    pub fn stats(&self) -> KmallocStats {
        *self.stats.lock()
    }

    /// The cache that would serve a request of `size` bytes, if any.
    pub fn cache_for(&self, size: usize) -> Option<&SlabCache> {
        let total = size.checked_add(HEADER_SIZE)?;
        if size == 0 || size > SLAB_MAX_USER_SIZE {
            return None;
        }
        self.caches.iter().find(|c| c.object_size() >= total)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::TestArena;

    const MIB: usize = 1024 * 1024;

    fn fresh() -> KernelAllocator {
        let arena = TestArena::new(16 * MIB);
        // SAFETY: Arena leaked below; the buddy owns it forever.
        let buddy: &'static BuddyAllocator = std::boxed::Box::leak(std::boxed::Box::new(unsafe {
            BuddyAllocator::init(arena.base(), arena.fake_phys_base(), arena.len())
        }));
        std::mem::forget(arena);
        KernelAllocator::new(buddy)
    }

    #[test]
    fn small_allocation_goes_to_a_slab() {
        let km = fresh();
        let ptr = km.kmalloc(100).expect("kmalloc(100)");
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);

        // Scenario S2: the hidden header records tag and owning cache.
        let header = (ptr.as_ptr() as usize - HEADER_SIZE) as *const AllocHeader;
        // SAFETY: The header sits just below the returned pointer.
        unsafe {
            assert_eq!((*header).magic, HEADER_MAGIC);
            assert_eq!((*header).tag, AllocTag::Slab as u8);
            assert!(!(*header).cache.is_null());
            assert_eq!((*header).size, 100);
        }
        let cache = km.cache_for(100).expect("a class covers 100 bytes");
        let free_before = cache.stats().free_objects;
        // SAFETY: ptr is live and came from km.
        unsafe { km.kfree(ptr) };
        assert_eq!(cache.stats().free_objects, free_before + 1);
    }

    #[test]
    fn large_allocation_goes_to_the_buddy() {
        let km = fresh();
        let ptr = km.kmalloc(SLAB_MAX_USER_SIZE + 1).expect("large kmalloc");
        let header = (ptr.as_ptr() as usize - HEADER_SIZE) as *const AllocHeader;
        unsafe {
            assert_eq!((*header).tag, AllocTag::Buddy as u8);
            assert!((*header).cache.is_null());
            km.kfree(ptr);
        }
        let stats = km.stats();
        assert_eq!(stats.buddy_allocs, 1);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn roundtrip_leaves_counters_only() {
        // Property 4: kfree(kmalloc(n)) perturbs nothing but the counters.
        let km = fresh();
        // Warm the caches so the steady state is established.
        for n in [1, 31, 32, 100, 500, 2048, 4000, 100_000] {
            let p = km.kmalloc(n).expect("warmup alloc");
            unsafe { km.kfree(p) };
        }
        let buddy_before = km.buddy.stats().free_bytes;
        for n in [1, 31, 32, 100, 500, 2048, 4000, 100_000] {
            let p = km.kmalloc(n).expect("alloc");
            unsafe {
                core::ptr::write_bytes(p.as_ptr(), 0x77, n);
                km.kfree(p);
            }
        }
        assert_eq!(km.buddy.stats().free_bytes, buddy_before);
    }

    #[test]
    fn zero_size_is_rejected() {
        let km = fresh();
        assert!(km.kmalloc(0).is_none());
    }

    #[test]
    fn kzalloc_zeroes() {
        let km = fresh();
        let p = km.kzalloc(64).expect("kzalloc");
        // SAFETY: 64 owned bytes.
        unsafe {
            for i in 0..64 {
                assert_eq!(p.as_ptr().add(i).read(), 0);
            }
            km.kfree(p);
        }
    }

    #[test]
    fn ksize_reports_request() {
        let km = fresh();
        let p = km.kmalloc(777).expect("alloc");
        unsafe {
            assert_eq!(km.ksize(p), 777);
            km.kfree(p);
        }
    }

    // The second free trips either the dead-magic check or, once the slab
    // free chain has reused the header bytes, the corruption check; both
    // are fatal kmalloc diagnostics.
    #[test]
    #[should_panic(expected = "kmalloc:")]
    fn double_kfree_is_fatal() {
        let km = fresh();
        let p = km.kmalloc(64).expect("alloc");
        unsafe {
            km.kfree(p);
            km.kfree(p);
        }
    }

    #[test]
    #[should_panic(expected = "footer canary")]
    fn slab_footer_overwrite_detected_via_kfree() {
        // Scenario S6: stomp the slot's trailing canary, then kfree.
        let km = fresh();
        let p = km.kmalloc(100).expect("alloc");
        let cache = km.cache_for(100).expect("class exists");
        let slot = (p.as_ptr() as usize) - HEADER_SIZE;
        // SAFETY: Deliberate corruption of the slot's last 4 bytes.
        unsafe {
            ((slot + cache.slot_size() - 4) as *mut u32).write(0);
            km.kfree(p);
        }
    }
}
