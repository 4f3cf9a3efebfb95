//! Slab cache allocator
//!
//! Bonwick-style object caches layered on the buddy allocator, plus a
//! `kmalloc`/`kfree` façade built from lazily created power-of-two size
//! classes.
//!
//! `kmalloc(n)` picks the smallest class holding `n` bytes and allocates
//! from that class's cache. `kfree(p)` finds the owner by masking `p`
//! down to each class's slab alignment and checking the candidate slab's
//! self-authenticating tag, then dispatches to the cache free path.
//!
//! Lock order is strict: registry lock, then a cache lock, then the buddy
//! lock. Size-class slots are published monotonically (null to non-null,
//! never back), so the `kfree` scan runs without the registry lock.

#![no_std]

#[cfg(test)]
extern crate std;

//

mod cache;
mod slab;

pub use cache::{
    CacheError, CacheStats, KmemCache, ObjectCtor, ObjectDtor, CACHE_NAME_LEN,
};

use core::{
    fmt::{self, Write},
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use spin::{Mutex, Once};

use kmem_buddy::{BuddyAllocator, BLOCK_SIZE};

//

/// A slab order is bumped until at least this many objects fit.
pub const MIN_OBJS_PER_SLAB: usize = 4;

/// Smallest size class: 32 B.
pub const SIZE_CLASS_MIN_SHIFT: usize = 5;
/// Largest size class: 128 KiB.
pub const SIZE_CLASS_MAX_SHIFT: usize = 17;

pub const SIZE_CLASS_COUNT: usize = SIZE_CLASS_MAX_SHIFT - SIZE_CLASS_MIN_SHIFT + 1;

//

static GLOBAL_BUDDY: BuddyAllocator = BuddyAllocator::new();
static GLOBAL_READY: Once<usize> = Once::new();

/// Hand the global buddy its backing memory: `block_count` blocks of
/// [`BLOCK_SIZE`] bytes starting at `region`. Idempotent; every call
/// returns the bytes placed by the first one.
///
/// # Safety
/// The region must be valid, unused memory that stays exclusively owned
/// by the allocator for the rest of the program.
pub unsafe fn kmem_init(region: *mut u8, block_count: usize) -> usize {
    *GLOBAL_READY.call_once(|| unsafe {
        GLOBAL_BUDDY.init(region, region.add(block_count * BLOCK_SIZE))
    })
}

/// The buddy instance behind the global caches, once [`kmem_init`] ran.
/// The rest of the kernel draws its page-granularity allocations from
/// here too.
pub fn global_buddy() -> Option<&'static BuddyAllocator> {
    GLOBAL_READY.get().map(|_| &GLOBAL_BUDDY)
}

//

/// Create a cache of `size`-byte objects on the global buddy.
pub fn kmem_cache_create(
    name: &str,
    size: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
) -> Option<&'static KmemCache> {
    KmemCache::create_in(global_buddy()?, name, size, ctor, dtor)
}

/// Allocate one constructed object from `cache`.
pub fn kmem_cache_alloc(cache: &KmemCache) -> Option<NonNull<u8>> {
    cache.alloc()
}

/// Return `obj` to `cache`. Null is a no-op; foreign or bad pointers are
/// recorded in the cache's error code.
pub fn kmem_cache_free(cache: &KmemCache, obj: Option<NonNull<u8>>) {
    cache.free(obj);
}

/// Release the cache's fully free slabs; returns base blocks freed.
pub fn kmem_cache_shrink(cache: &KmemCache) -> usize {
    cache.shrink()
}

/// Tear down `cache` entirely.
///
/// # Safety
/// See [`KmemCache::destroy`].
pub unsafe fn kmem_cache_destroy(cache: &'static KmemCache) {
    unsafe { cache.destroy() }
}

/// Log a report for `cache`.
pub fn kmem_cache_info(cache: &KmemCache) {
    cache.info();
}

/// Read and clear `cache`'s sticky error code.
pub fn kmem_cache_error(cache: &KmemCache) -> CacheError {
    cache.take_error()
}

//

/// Smallest size-class index whose class holds `size` bytes.
pub fn size_to_index(size: usize) -> Option<usize> {
    if size == 0 || size > 1 << SIZE_CLASS_MAX_SHIFT {
        return None;
    }

    let shift = size.next_power_of_two().trailing_zeros() as usize;

    Some(shift.max(SIZE_CLASS_MIN_SHIFT) - SIZE_CLASS_MIN_SHIFT)
}

/// Allocate `size` bytes from the matching size class, creating the
/// class's cache on first use.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    let cache = size_class(size_to_index(size)?)?;
    cache.alloc()
}

/// Free a `kmalloc` allocation. Null is a no-op; a pointer no size class
/// claims is logged and dropped.
pub fn kfree(ptr: Option<NonNull<u8>>) {
    let Some(ptr) = ptr else { return };

    // lock-free scan: slots only ever go null -> cache, and a cache's
    // slab tags are wiped before its blocks leave the cache
    for slot in &SIZE_CLASSES {
        let cache = slot.load(Ordering::Acquire);
        if cache.is_null() {
            continue;
        }

        // Safety: published size-class caches are never torn down
        let cache = unsafe { &*cache };
        if cache.owns(ptr) {
            cache.free(Some(ptr));
            return;
        }
    }

    kmem_log::error!("kfree: {:p} does not belong to any size class", ptr);
}

/// Log a report for every live cache.
pub fn kmem_info() {
    if let Some(buddy) = global_buddy() {
        buddy.dump();
    }

    let registry = REGISTRY.lock();

    let mut cur = registry.head;
    while let Some(cache) = cur {
        // Safety: registered caches stay alive until unlinked
        let cache = unsafe { cache.as_ref() };
        cache.info();
        cur = NonNull::new(cache.next.load(Ordering::Relaxed));
    }
}

//

const NO_CACHE: AtomicPtr<KmemCache> = AtomicPtr::new(ptr::null_mut());

/// One lazily created cache per power-of-two class.
static SIZE_CLASSES: [AtomicPtr<KmemCache>; SIZE_CLASS_COUNT] = [NO_CACHE; SIZE_CLASS_COUNT];

fn size_class(index: usize) -> Option<&'static KmemCache> {
    let slot = &SIZE_CLASSES[index];

    let published = slot.load(Ordering::Acquire);
    if !published.is_null() {
        // Safety: published size-class caches are never torn down
        return Some(unsafe { &*published });
    }

    // build the class first, publish second; creation takes the registry
    // lock internally, so no lock is held across it
    let bytes = 1usize << (SIZE_CLASS_MIN_SHIFT + index);
    let mut name = NameBuf::new();
    let _ = write!(name, "size-{bytes}");

    let fresh = KmemCache::create_in(global_buddy()?, name.as_str(), bytes, None, None)?;
    let fresh_ptr = fresh as *const KmemCache as *mut KmemCache;

    match slot.compare_exchange(
        ptr::null_mut(),
        fresh_ptr,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Some(fresh),
        Err(winner) => {
            // another thread published first; our empty duplicate goes
            // straight back to the buddy
            unsafe { fresh.destroy() };

            // Safety: the winning cache is published and immortal
            Some(unsafe { &*winner })
        }
    }
}

//

struct Registry {
    head: Option<NonNull<KmemCache>>,
}

// the registry only references descriptors in buddy-owned blocks
unsafe impl Send for Registry {}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry { head: None });

pub(crate) fn registry_link(cache: &'static KmemCache) {
    let mut registry = REGISTRY.lock();

    let old_head = match registry.head {
        Some(head) => head.as_ptr(),
        None => ptr::null_mut(),
    };
    cache.next.store(old_head, Ordering::Relaxed);
    registry.head = Some(NonNull::from(cache));
}

pub(crate) fn registry_unlink(cache: &KmemCache) {
    let mut registry = REGISTRY.lock();

    let target = cache as *const KmemCache;
    let mut prev: Option<NonNull<KmemCache>> = None;
    let mut cur = registry.head;

    while let Some(entry) = cur {
        // Safety: registered caches stay alive until unlinked
        let next = unsafe { entry.as_ref() }.next.load(Ordering::Relaxed);

        if entry.as_ptr().cast_const() == target {
            match prev {
                Some(prev) => unsafe { prev.as_ref() }.next.store(next, Ordering::Relaxed),
                None => registry.head = NonNull::new(next),
            }
            return;
        }

        prev = cur;
        cur = NonNull::new(next);
    }
}

//

/// Fixed-capacity name assembly for the `"size-<bytes>"` caches.
struct NameBuf {
    buf: [u8; CACHE_NAME_LEN],
    len: usize,
}

impl NameBuf {
    const fn new() -> Self {
        Self {
            buf: [0; CACHE_NAME_LEN],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Write for NameBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        if s.len() > room {
            return Err(fmt::Error);
        }

        self.buf[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();

        Ok(())
    }
}

//
