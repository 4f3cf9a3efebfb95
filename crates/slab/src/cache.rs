//! Object caches
//!
//! A [`KmemCache`] serves fixed-size objects out of slabs it grows from a
//! buddy allocator. Slabs sit on one of three lists depending on how many
//! of their objects are out: `partial` (some), `full` (all) or `free`
//! (none). Objects are kept in constructed state for their whole stay in
//! the cache: the constructor runs once over a fresh slab and again over
//! every freed object, so an allocation never hands out a raw slot.

use core::{
    fmt,
    mem::size_of,
    ptr::{self, NonNull},
    slice,
    sync::atomic::AtomicPtr,
};

use spin::Mutex;

use kmem_bitmap::Bitmap;
use kmem_buddy::{order_bytes, BuddyAllocator};

use crate::slab::{compute_geometry, Slab, SlabList, SlabTag};

//

pub const CACHE_NAME_LEN: usize = 32;

/// Object constructor, run on every slot of a fresh slab and re-run on
/// every freed object.
pub type ObjectCtor = fn(NonNull<u8>);

/// Object destructor, run when a slab is torn down.
pub type ObjectDtor = fn(NonNull<u8>);

//

/// Sticky per-cache error code. Free-path failures are recorded here
/// rather than raised; [`KmemCache::take_error`] reads and clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CacheError {
    #[default]
    None = 0,
    /// the buddy had no block for a new slab
    BuddyExhausted = 1,
    /// the `next_free` hint disagreed with the bitmap
    BadFreeIndex = 2,
    /// freed object belongs to a different cache
    WrongCache = 3,
    /// freed object index out of range, misaligned, or already free
    DoubleOrBadFree = 4,
}

impl CacheError {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "no error",
            Self::BuddyExhausted => "buddy exhausted",
            Self::BadFreeIndex => "free index hint inconsistent with bitmap",
            Self::WrongCache => "object belongs to another cache",
            Self::DoubleOrBadFree => "double free or bad object pointer",
        };

        f.write_str(s)
    }
}

//

/// A cache of same-sized kernel objects.
///
/// The descriptor itself lives in an order-0 buddy block; immutable
/// geometry sits outside the lock, everything mutable behind it.
pub struct KmemCache {
    name: [u8; CACHE_NAME_LEN],
    name_len: usize,

    obj_size: usize,
    slab_order: usize,
    obj_per_slab: usize,
    bitmap_bytes: usize,
    /// color-0 offset of the object area from the slab base
    obj_base: usize,
    color_max: usize,

    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,

    /// where slabs and the descriptor block come from
    buddy: &'static BuddyAllocator,

    /// registry link, guarded by the registry lock
    pub(crate) next: AtomicPtr<KmemCache>,

    inner: Mutex<CacheInner>,
}

struct CacheInner {
    partial: SlabList,
    full: SlabList,
    free: SlabList,

    slab_count: usize,
    total_objs: usize,
    free_objs: usize,
    alloc_count: u64,
    freed_count: u64,

    /// color of the next slab to grow
    color_next: usize,
    /// set on growth, cleared by shrink; blocks one shrink after a grow
    grown_since_shrink: bool,

    error: CacheError,
}

// slab pointers only ever reference blocks owned by this cache
unsafe impl Send for CacheInner {}

const _: () = assert!(size_of::<KmemCache>() <= order_bytes(0));

//

/// Point-in-time counters for one cache, as reported by
/// [`KmemCache::stats`].
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub obj_size: usize,
    pub slab_order: usize,
    pub obj_per_slab: usize,
    pub slab_count: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub free_slabs: usize,
    pub total_objs: usize,
    pub free_objs: usize,
    pub alloc_count: u64,
    pub freed_count: u64,
    pub color_count: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self.total_objs - self.free_objs;
        let usage = if self.total_objs == 0 {
            0
        } else {
            used * 100 / self.total_objs
        };

        writeln!(f, "  object size:      {} B", self.obj_size)?;
        writeln!(f, "  slab size:        {} blocks", 1usize << self.slab_order)?;
        writeln!(
            f,
            "  slabs:            {} ({} partial, {} full, {} free)",
            self.slab_count, self.partial_slabs, self.full_slabs, self.free_slabs
        )?;
        writeln!(f, "  objects per slab: {}", self.obj_per_slab)?;
        writeln!(f, "  usage:            {used}/{} ({usage}%)", self.total_objs)?;
        writeln!(f, "  total allocs:     {}", self.alloc_count)?;
        writeln!(f, "  total frees:      {}", self.freed_count)?;
        write!(f, "  colors:           {}", self.color_count)
    }
}

//

impl KmemCache {
    /// Create a cache of `size`-byte objects drawing slabs from `buddy`.
    ///
    /// `size` is rounded up to 8 bytes; zero is rejected. `name` is kept
    /// to at most 31 bytes. The descriptor is linked into the global cache
    /// registry.
    pub fn create_in(
        buddy: &'static BuddyAllocator,
        name: &str,
        size: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Option<&'static KmemCache> {
        if size == 0 {
            return None;
        }

        let obj_size = crate::slab::align8(size);
        let geom = compute_geometry(obj_size)?;

        let block = buddy.alloc(0)?;
        let cache = block.as_ptr().cast::<KmemCache>();

        let name_len = name.len().min(CACHE_NAME_LEN - 1);
        let mut name_buf = [0; CACHE_NAME_LEN];
        name_buf[..name_len].copy_from_slice(&name.as_bytes()[..name_len]);

        // Safety: the block is fresh and exclusively owned, and large
        // enough for the descriptor by the const assert above
        unsafe {
            cache.write(KmemCache {
                name: name_buf,
                name_len,
                obj_size,
                slab_order: geom.slab_order,
                obj_per_slab: geom.obj_per_slab,
                bitmap_bytes: geom.bitmap_bytes,
                obj_base: geom.obj_base,
                color_max: geom.color_max,
                ctor,
                dtor,
                buddy,
                next: AtomicPtr::new(ptr::null_mut()),
                inner: Mutex::new(CacheInner {
                    partial: SlabList::new(),
                    full: SlabList::new(),
                    free: SlabList::new(),
                    slab_count: 0,
                    total_objs: 0,
                    free_objs: 0,
                    alloc_count: 0,
                    freed_count: 0,
                    color_next: 0,
                    grown_since_shrink: false,
                    error: CacheError::None,
                }),
            });
        }

        // Safety: just initialized; the descriptor outlives its block
        let cache = unsafe { &*cache };
        crate::registry_link(cache);

        Some(cache)
    }

    /// Hand out one constructed object, or `None` when the buddy cannot
    /// back a new slab.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        // a partial slab first, then resurrect an empty one, then grow
        let slab = match inner.partial.head() {
            Some(slab) => slab,
            None => {
                let slab = match inner.free.pop() {
                    Some(slab) => slab,
                    None => self.grow(&mut inner)?,
                };
                inner.partial.push(slab);
                slab
            }
        };

        let Some(index) = self.take_index(slab) else {
            inner.error = CacheError::BadFreeIndex;
            return None;
        };

        // Safety: the slab is owned by this cache and the lock is held
        let s = unsafe { &mut *slab.as_ptr() };
        s.free_count -= 1;
        if s.free_count == 0 {
            inner.partial.unlink(slab);
            inner.full.push(slab);
        }

        inner.free_objs -= 1;
        inner.alloc_count += 1;

        Some(self.object(slab, index))
    }

    /// Give an object back. `None` is a no-op; foreign, misaligned and
    /// double frees are recorded in the cache's error code and otherwise
    /// ignored.
    pub fn free(&self, obj: Option<NonNull<u8>>) {
        let Some(obj) = obj else { return };
        let mut inner = self.inner.lock();

        let slab_size = order_bytes(self.slab_order);
        let base = obj.as_ptr() as usize & !(slab_size - 1);

        // the base is only trusted once the tag names this very cache
        if !self.buddy.contains(base) {
            inner.error = CacheError::WrongCache;
            return;
        }
        // Safety: `base` lies in buddy-owned memory, and `SlabTag` is Pod
        let tag = unsafe { (base as *const SlabTag).read() };
        if !tag.owned_by(self) {
            inner.error = CacheError::WrongCache;
            return;
        }

        // Safety: a valid tag means `base` is a live slab of this cache
        let slab = unsafe { NonNull::new_unchecked(base as *mut Slab) };
        let s = unsafe { &mut *slab.as_ptr() };

        let area = base + self.obj_base + s.color * 8;
        let Some(offset) = (obj.as_ptr() as usize).checked_sub(area) else {
            inner.error = CacheError::DoubleOrBadFree;
            return;
        };
        let index = offset / self.obj_size;
        if offset % self.obj_size != 0 || index >= self.obj_per_slab {
            inner.error = CacheError::DoubleOrBadFree;
            return;
        }

        // Safety: slab verified above, lock held
        let mut bitmap = unsafe { self.slab_bitmap(slab) };
        if bitmap.get(index) != Some(true) {
            inner.error = CacheError::DoubleOrBadFree;
            return;
        }

        let was_full = s.free_count == 0;

        bitmap.set(index, false).expect("index checked in range");
        s.free_count += 1;
        // prefer the just-freed slot for the next allocation
        s.next_free = Some(match s.next_free {
            Some(hint) => hint.min(index),
            None => index,
        });

        inner.free_objs += 1;
        inner.freed_count += 1;

        // back to constructed state
        if let Some(ctor) = self.ctor {
            ctor(obj);
        }

        if s.free_count == self.obj_per_slab {
            let from = if was_full {
                &mut inner.full
            } else {
                &mut inner.partial
            };
            from.unlink(slab);
            inner.free.push(slab);
        } else if was_full {
            inner.full.unlink(slab);
            inner.partial.push(slab);
        }
    }

    /// Return every fully free slab to the buddy and report how many base
    /// blocks that released.
    ///
    /// A cache that has grown since the last shrink is left alone once:
    /// the first shrink after a grow only clears the flag and returns 0.
    pub fn shrink(&self) -> usize {
        let mut inner = self.inner.lock();

        if inner.grown_since_shrink {
            inner.grown_since_shrink = false;
            return 0;
        }

        let mut blocks = 0;
        while let Some(slab) = inner.free.pop() {
            // all objects are still constructed, tear each one down
            self.destroy_slab(slab, &mut inner, false);
            blocks += 1 << self.slab_order;
        }

        blocks
    }

    /// Tear the cache down: destructors run on live objects, every slab
    /// and the descriptor go back to the buddy, and the cache leaves the
    /// registry.
    ///
    /// # Safety
    /// No object of this cache, nor the cache reference itself, may be
    /// used afterwards.
    pub unsafe fn destroy(&'static self) {
        crate::registry_unlink(self);

        {
            let mut inner = self.inner.lock();

            while let Some(slab) = inner.free.pop() {
                self.destroy_slab(slab, &mut inner, false);
            }
            while let Some(slab) = inner.partial.pop() {
                self.destroy_slab(slab, &mut inner, true);
            }
            while let Some(slab) = inner.full.pop() {
                self.destroy_slab(slab, &mut inner, true);
            }
        }

        let buddy = self.buddy;
        let descriptor = NonNull::from(self).cast::<u8>();

        // Safety: all slabs are gone and the caller promises the
        // descriptor is unreachable; its block goes back last
        unsafe { buddy.free(descriptor, 0) };
    }

    /// Log a human-readable report for this cache.
    pub fn info(&self) {
        kmem_log::info!("cache \"{}\":\n{}", self.name(), self.stats());
    }

    /// Read and clear the sticky error code, logging it if set.
    pub fn take_error(&self) -> CacheError {
        let mut inner = self.inner.lock();
        let error = core::mem::take(&mut inner.error);

        if !error.is_ok() {
            kmem_log::error!("cache \"{}\": {error}", self.name());
        }

        error
    }

    /// Counter snapshot, taken under the cache lock.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();

        CacheStats {
            obj_size: self.obj_size,
            slab_order: self.slab_order,
            obj_per_slab: self.obj_per_slab,
            slab_count: inner.slab_count,
            partial_slabs: inner.partial.len(),
            full_slabs: inner.full.len(),
            free_slabs: inner.free.len(),
            total_objs: inner.total_objs,
            free_objs: inner.free_objs,
            alloc_count: inner.alloc_count,
            freed_count: inner.freed_count,
            color_count: self.color_max + 1,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }

    /// Rounded-up object size in bytes.
    #[must_use]
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    #[must_use]
    pub fn obj_per_slab(&self) -> usize {
        self.obj_per_slab
    }

    /// Whether `obj` points into a live slab of this cache. Probes the
    /// candidate slab base's tag without taking the cache lock; safe
    /// because slab bases only become non-slabs after their tag is wiped.
    pub fn owns(&self, obj: NonNull<u8>) -> bool {
        let base = obj.as_ptr() as usize & !(order_bytes(self.slab_order) - 1);

        if !self.buddy.contains(base) {
            return false;
        }

        // Safety: `base` lies in buddy-owned memory, and `SlabTag` is Pod
        let tag = unsafe { (base as *const SlabTag).read() };
        tag.owned_by(self)
    }
}

//

impl KmemCache {
    /// Grow the cache by one fresh slab.
    fn grow(&self, inner: &mut CacheInner) -> Option<NonNull<Slab>> {
        let Some(block) = self.buddy.alloc(self.slab_order) else {
            inner.error = CacheError::BuddyExhausted;
            return None;
        };

        let color = inner.color_next;
        inner.color_next = (inner.color_next + 1) % (self.color_max + 1);

        let slab = block.as_ptr().cast::<Slab>();

        // Safety: the block is fresh, exclusively owned and large enough
        // for header + bitmap + objects by geometry construction
        unsafe {
            slab.write(Slab {
                tag: SlabTag::new(self),
                order: self.slab_order,
                color,
                free_count: self.obj_per_slab,
                next_free: Some(0),
                next: None,
            });
        }

        // Safety: derived from a NonNull block pointer
        let slab = unsafe { NonNull::new_unchecked(slab) };

        // Safety: header written above, block exclusively owned
        unsafe { self.slab_bitmap(slab) }.fill(false);

        // a cached object is constructed from the moment its slab exists
        if let Some(ctor) = self.ctor {
            for index in 0..self.obj_per_slab {
                ctor(self.object(slab, index));
            }
        }

        inner.slab_count += 1;
        inner.total_objs += self.obj_per_slab;
        inner.free_objs += self.obj_per_slab;
        inner.grown_since_shrink = true;

        Some(slab)
    }

    /// Claim a free object index on `slab`: verify the hint against the
    /// bitmap, mark the bit, and move the hint forward (wrapping).
    fn take_index(&self, slab: NonNull<Slab>) -> Option<usize> {
        // Safety: the slab is owned by this cache and the lock is held
        let s = unsafe { &mut *slab.as_ptr() };
        let index = s.next_free?;

        let mut bitmap = unsafe { self.slab_bitmap(slab) };
        if index >= self.obj_per_slab || bitmap.get(index) != Some(false) {
            return None;
        }

        bitmap.set(index, true)?;
        s.next_free = bitmap.first_clear_from(index + 1, self.obj_per_slab);

        Some(index)
    }

    /// Tear down one slab and hand its block back to the buddy.
    /// `live_only` restricts destructors to currently-allocated objects.
    fn destroy_slab(&self, slab: NonNull<Slab>, inner: &mut CacheInner, live_only: bool) {
        if let Some(dtor) = self.dtor {
            // Safety: slab owned by this cache, lock held by the caller
            let bitmap = unsafe { self.slab_bitmap(slab) };
            if live_only {
                for index in bitmap.iter_set() {
                    dtor(self.object(slab, index));
                }
            } else {
                for index in 0..self.obj_per_slab {
                    dtor(self.object(slab, index));
                }
            }
        }

        // Safety: slab owned by this cache, lock held by the caller
        let (order, free_count) = {
            let s = unsafe { slab.as_ref() };
            debug_assert!(s.tag.owned_by(self));
            (s.order, s.free_count)
        };

        inner.slab_count -= 1;
        inner.total_objs -= self.obj_per_slab;
        inner.free_objs -= free_count;

        // wipe the tag so a stale pointer can never re-authenticate the
        // block after it leaves the cache
        unsafe {
            slab.as_ptr()
                .cast::<SlabTag>()
                .write(bytemuck::Zeroable::zeroed());
            self.buddy.free(slab.cast(), order);
        }
    }

    /// The in-use bitmap living right behind the slab header.
    ///
    /// # Safety
    /// `slab` must be a live slab of this cache and the cache lock must
    /// be held (or the slab otherwise exclusively owned).
    unsafe fn slab_bitmap(&self, slab: NonNull<Slab>) -> Bitmap<'_> {
        let ptr = slab.as_ptr().cast::<u8>().add(size_of::<Slab>());
        Bitmap::new(slice::from_raw_parts_mut(ptr, self.bitmap_bytes))
    }

    /// Address of object `index` inside `slab`.
    fn object(&self, slab: NonNull<Slab>, index: usize) -> NonNull<u8> {
        // Safety: the slab header is live for the duration of the call
        let s = unsafe { slab.as_ref() };
        let addr = s.base() + self.obj_base + s.color * 8 + index * self.obj_size;

        // Safety: object addresses are interior to a non-null block
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }
}
