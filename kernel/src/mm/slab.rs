//! Slab allocator.
//!
//! Object-caching allocator layered on the frame allocator, modelled
//! after the Bonwick design. Objects live in slabs (frame runs owned by
//! one cache); a free object's first word holds the index of the next
//! free slot, so free slabs need no external bookkeeping. Each cache
//! keeps a list of full and partially full slabs; a slab whose objects
//! are all free is returned to the frame allocator immediately.
//!
//! For SMP scaling each cache can keep per-CPU magazines: bounded
//! stacks of free object pointers, held as a (current, last) pair per
//! CPU so bursts around the capacity boundary do not thrash. Full
//! magazines retired by a CPU go to a cache-global list; a CPU whose
//! magazines are both empty imports one from there.
//!
//! The allocator gives memory back only under pressure: when the frame
//! allocator fails, it calls [`reclaim`], which destroys cached
//! magazines (and with [`ReclaimFlags::ALL`] the per-CPU ones too),
//! returning their objects to slabs and releasing emptied slabs.
//!
//! Caches whose own control structures must never recurse into the
//! magazine layer (the magazine cache itself, the cache-of-caches) are
//! created `NOMAGAZINE`; everything created before the CPU count is
//! known is `MAGDEFERRED` and upgraded by [`enable_cpucache`].

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;
use static_assertions as sa;

use crate::adt::list::{Link, List};
use crate::arch;
use crate::config;
use crate::container_of;
use crate::error::KernelError;
use crate::mm::frame::{
    frame_alloc_generic, frame_free, frame_get_parent, frame_set_parent, FrameFlags,
};
use crate::mm::{fnzb, frame_to_ptr, order_to_size, ptr_to_frame, size_to_frames, FRAME_SIZE};
use crate::synch::spinlock::IrqSpinlock;

bitflags! {
    /// Cache behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlabFlags: u32 {
        /// Never use per-CPU magazines (bootstrap control caches).
        const NOMAGAZINE = 1 << 0;
        /// Keep the slab descriptor inside the slab's own frames.
        const INSIDE = 1 << 1;
        /// Use magazines, but only once the CPU count is known.
        const MAGDEFERRED = 1 << 2;
    }
}

bitflags! {
    /// Reclaim aggressiveness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReclaimFlags: u32 {
        /// Also drain the per-CPU magazine pairs.
        const ALL = 1 << 0;
    }
}

/// Object pointers per magazine.
pub const MAG_SIZE: usize = 4;

/// Objects smaller than this keep their slab descriptor in-slab.
const MAX_INSIDE_SIZE: usize = FRAME_SIZE >> 3;

/// Wasted bytes tolerated per slab before doubling the slab size.
fn max_badness(order: usize) -> usize {
    order_to_size(order) >> 2
}

/// Object constructor; runs on every allocation. Failure returns the
/// object to its slab and fails the allocation.
pub type SlabCtor = fn(*mut u8, FrameFlags) -> Result<(), KernelError>;

/// Object destructor; runs on every deallocation and reports how many
/// frames it freed (for the reclaim accounting).
pub type SlabDtor = fn(*mut u8) -> usize;

/// Slab descriptor: one contiguous frame run divided into objects.
#[repr(C)]
struct Slab {
    /// Owning cache.
    cache: *mut SlabCache,
    /// Membership in the cache's full or partial list.
    link: Link,
    /// First object.
    start: *mut u8,
    /// Free objects remaining.
    available: usize,
    /// Index of the next free object; the chain continues in the first
    /// word of each free object.
    nextavail: usize,
}

sa::const_assert!(size_of::<Slab>() < MAX_INSIDE_SIZE);

/// Magazine: a bounded LIFO of free object pointers.
#[repr(C)]
struct Magazine {
    link: Link,
    size: usize,
    busy: usize,
    objs: [*mut u8; MAG_SIZE],
}

sa::const_assert!(size_of::<Magazine>() + size_of::<Slab>() <= FRAME_SIZE);

/// Per-CPU magazine pair.
struct CpuMagazines {
    lock: Mutex<MagPair>,
}

#[derive(Clone, Copy)]
struct MagPair {
    current: *mut Magazine,
    last: *mut Magazine,
}

/// Named object cache.
pub struct SlabCache {
    name: &'static str,
    /// Membership in the global cache registry.
    link: Link,

    /// Aligned object size.
    size: usize,
    /// Frames per slab, as a buddy order.
    order: usize,
    /// Objects per slab.
    objects: usize,

    constructor: Option<SlabCtor>,
    destructor: Option<SlabDtor>,
    flags: AtomicU32,

    /// Full and partial slab lists (the slab lock).
    lists: Mutex<SlabLists>,
    /// Cache-global list of full magazines (the magazine lock).
    magazines: Mutex<List>,
    magazine_counter: AtomicUsize,
    /// Per-CPU magazine pairs, `config::cpu_count()` entries; null until
    /// magazines are enabled for this cache.
    mag_cache: AtomicPtr<CpuMagazines>,

    allocated_slabs: AtomicUsize,
    allocated_objs: AtomicUsize,
    cached_objs: AtomicUsize,
}

struct SlabLists {
    full: List,
    partial: List,
}

// SAFETY: all mutable state is behind the cache's own locks or atomic;
// the raw pointers (registry link, magazine array) are only touched
// under the corresponding lock.
unsafe impl Send for SlabCache {}
// SAFETY: same as Send.
unsafe impl Sync for SlabCache {}

impl SlabCache {
    const fn empty(name: &'static str) -> Self {
        Self {
            name,
            link: Link::new(),
            size: 0,
            order: 0,
            objects: 0,
            constructor: None,
            destructor: None,
            flags: AtomicU32::new(0),
            lists: Mutex::new(SlabLists {
                full: List::new(),
                partial: List::new(),
            }),
            magazines: Mutex::new(List::new()),
            magazine_counter: AtomicUsize::new(0),
            mag_cache: AtomicPtr::new(ptr::null_mut()),
            allocated_slabs: AtomicUsize::new(0),
            allocated_objs: AtomicUsize::new(0),
            cached_objs: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Aligned object size.
    pub fn object_size(&self) -> usize {
        self.size
    }

    /// Objects per slab.
    pub fn objects_per_slab(&self) -> usize {
        self.objects
    }

    pub fn flags(&self) -> SlabFlags {
        SlabFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: SlabFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Slabs currently allocated (full + partial).
    pub fn allocated_slabs(&self) -> usize {
        self.allocated_slabs.load(Ordering::Acquire)
    }

    /// Objects handed out and not yet returned.
    pub fn allocated_objects(&self) -> usize {
        self.allocated_objs.load(Ordering::Acquire)
    }

    /// Objects sitting in magazines.
    pub fn cached_objects(&self) -> usize {
        self.cached_objs.load(Ordering::Acquire)
    }

    fn cpu_magazines(&self) -> Option<&CpuMagazines> {
        let cpu = arch::current_cpu_id()?;
        let array = self.mag_cache.load(Ordering::Acquire);
        if array.is_null() {
            return None;
        }
        debug_assert!(cpu < config::cpu_count());
        // SAFETY: the array holds config::cpu_count() entries, was
        // initialized by make_magcache before being published, and is
        // never freed while the cache exists.
        Some(unsafe { &*array.add(cpu) })
    }
}

/// Global registry of caches. Lock order: registry, then a cache's
/// slab lock, then its magazine lock.
static CACHE_REGISTRY: IrqSpinlock<List> = IrqSpinlock::new(List::new());

/// Bootstrap stage: 0 before init, 1 after [`init`], 2 once per-CPU
/// magazines may be built.
static SLAB_INITIALIZED: AtomicUsize = AtomicUsize::new(0);

/// A statically allocated cache, initialized once during early boot.
struct BootCache {
    cell: UnsafeCell<SlabCache>,
    ready: AtomicBool,
}

// SAFETY: `cell` is written exactly once, before `ready` is released;
// afterwards only shared references are handed out and all mutation
// goes through the cache's internal locks.
unsafe impl Sync for BootCache {}

impl BootCache {
    const fn new(name: &'static str) -> Self {
        Self {
            cell: UnsafeCell::new(SlabCache::empty(name)),
            ready: AtomicBool::new(false),
        }
    }

    fn get(&self) -> &SlabCache {
        assert!(
            self.ready.load(Ordering::Acquire),
            "bootstrap cache used before slab init"
        );
        // SAFETY: initialized before `ready` was set; see Sync impl.
        unsafe { &*self.cell.get() }
    }

    /// Run `create` on the inner cache and publish it.
    ///
    /// # Safety
    ///
    /// May only run once, on the boot CPU, before any other CPU or
    /// interrupt handler can reach the slab allocator.
    unsafe fn init(&self, create: impl FnOnce(&mut SlabCache)) {
        assert!(!self.ready.load(Ordering::Acquire), "double slab bootstrap");
        // SAFETY: single-threaded boot per the caller contract, so the
        // exclusive reference cannot alias.
        create(unsafe { &mut *self.cell.get() });
        self.ready.store(true, Ordering::Release);
    }
}

/// Magazine cache (control structures for the magazine layer itself).
static MAG_CACHE: BootCache = BootCache::new("slab_magazine");
/// Cache of cache descriptors.
static SLAB_CACHE_CACHE: BootCache = BootCache::new("slab_cache_cache");
/// Cache of per-CPU magazine arrays; created by [`enable_cpucache`].
static SLAB_MAG_CACHE: BootCache = BootCache::new("slab_mag_cache");

/// Cache of external slab descriptors.
static SLAB_EXTERN_CACHE: AtomicPtr<SlabCache> = AtomicPtr::new(ptr::null_mut());

fn extern_cache() -> &'static SlabCache {
    let cache = SLAB_EXTERN_CACHE.load(Ordering::Acquire);
    assert!(!cache.is_null(), "slab descriptor cache used before init");
    // SAFETY: published once at init and never freed.
    unsafe { &*cache }
}

/*
 * Slab handling
 */

/// Allocate frames for a new slab, annotate them, and thread the free
/// chain through the objects.
fn slab_space_alloc(cache: &SlabCache, flags: FrameFlags) -> Option<*mut Slab> {
    let mut zone_hint = 0;
    let pfn = frame_alloc_generic(cache.order, flags, Some(&mut zone_hint)).ok()?;
    let data = frame_to_ptr(pfn);

    let slab = if !cache.flags().contains(SlabFlags::INSIDE) {
        match slab_alloc(extern_cache(), flags) {
            Some(obj) => obj.as_ptr() as *mut Slab,
            None => {
                frame_free(pfn);
                return None;
            }
        }
    } else {
        let slab_size = order_to_size(cache.order);
        // SAFETY: the descriptor is placed at the end of the slab's own
        // frame run; const assertions guarantee it fits.
        unsafe { data.add(slab_size - size_of::<Slab>()) as *mut Slab }
    };

    // Back-annotate every frame so obj_to_slab is O(1).
    for i in 0..(1usize << cache.order) {
        frame_set_parent(pfn.add(i), slab as usize, &mut zone_hint);
    }

    // SAFETY: `slab` points either at freshly allocated extern-cache
    // storage or at the tail of the freshly allocated frame run; either
    // way we own it exclusively.
    unsafe {
        slab.write(Slab {
            cache: cache as *const SlabCache as *mut SlabCache,
            link: Link::new(),
            start: data,
            available: cache.objects,
            nextavail: 0,
        });
    }

    // Thread the embedded free chain: each free object's first word is
    // the index of the next free slot. The storage is untyped until an
    // object is handed out.
    for i in 0..cache.objects {
        // SAFETY: object `i` lies within the slab's frame run.
        unsafe {
            (data.add(i * cache.size) as *mut usize).write(i + 1);
        }
    }

    cache.allocated_slabs.fetch_add(1, Ordering::AcqRel);
    Some(slab)
}

/// Release a fully free slab back to the frame allocator. Returns the
/// number of frames freed.
fn slab_space_free(cache: &SlabCache, slab: *mut Slab) -> usize {
    // SAFETY: the slab was removed from all lists by the caller and no
    // object in it is live.
    let start = unsafe { (*slab).start };
    frame_free(ptr_to_frame(start));

    if !cache.flags().contains(SlabFlags::INSIDE) {
        // SAFETY: extern descriptors come from the extern cache.
        unsafe { slab_free_raw(extern_cache(), slab as *mut u8, None) };
    }

    cache.allocated_slabs.fetch_sub(1, Ordering::AcqRel);
    1 << cache.order
}

/// Map an object to its slab via the frame back-annotation.
fn obj_to_slab(obj: *mut u8) -> *mut Slab {
    let mut hint = 0;
    frame_get_parent(ptr_to_frame(obj), &mut hint) as *mut Slab
}

/// Return an object to its slab, running the destructor. Returns the
/// number of frames freed.
fn slab_obj_destroy(cache: &SlabCache, obj: *mut u8, slab: Option<*mut Slab>) -> usize {
    let slab = slab.unwrap_or_else(|| obj_to_slab(obj));

    // SAFETY: the frame annotation (or the caller) named this slab as
    // the object's owner; slabs live as long as any of their objects.
    debug_assert_eq!(
        unsafe { (*slab).cache },
        cache as *const SlabCache as *mut SlabCache,
        "object returned to the wrong cache"
    );

    let mut freed = 0;
    if let Some(dtor) = cache.destructor {
        freed = dtor(obj);
    }

    let mut lists = cache.lists.lock();
    // SAFETY: slab list membership and interior counts are protected by
    // the slab lock we hold.
    unsafe {
        let s = &mut *slab;
        assert!(s.available < cache.objects, "double free into a full slab");

        // The object storage is dead; reuse its first word for the
        // free chain.
        (obj as *mut usize).write(s.nextavail);
        s.nextavail = (obj as usize - s.start as usize) / cache.size;
        s.available += 1;

        if s.available == cache.objects {
            // Entirely free: release it immediately.
            Link::remove(&mut s.link);
            drop(lists);
            return freed + slab_space_free(cache, slab);
        } else if s.available == 1 {
            // Was full, becomes partial.
            Link::remove(&mut s.link);
            lists.partial.prepend(&mut s.link);
        }
    }

    freed
}

/// Take an object from a partial slab, or grow the cache by one slab.
fn slab_obj_create(cache: &SlabCache, flags: FrameFlags) -> Option<*mut u8> {
    let mut lists = cache.lists.lock();

    let slab = match lists.partial.first() {
        Some(link) => {
            // SAFETY: partial-list members are live slab descriptors.
            unsafe {
                Link::remove(link);
                container_of!(link, Slab, link)
            }
        }
        None => {
            // Growing can recurse into the allocator (extern slab
            // descriptors) and reclaim; drop the slab lock meanwhile.
            // The control structures themselves only ever take one
            // level of recursion.
            drop(lists);
            let slab = slab_space_alloc(cache, flags)?;
            lists = cache.lists.lock();
            slab
        }
    };

    // SAFETY: the slab is ours (removed from lists or freshly built)
    // and the slab lock is held for list/count updates.
    let obj = unsafe {
        let s = &mut *slab;
        let obj = s.start.add(s.nextavail * cache.size);
        s.nextavail = *(obj as *mut usize);
        s.available -= 1;

        if s.available == 0 {
            lists.full.prepend(&mut s.link);
        } else {
            lists.partial.prepend(&mut s.link);
        }
        obj
    };
    drop(lists);

    if let Some(ctor) = cache.constructor {
        if ctor(obj, flags).is_err() {
            slab_obj_destroy(cache, obj, Some(slab));
            return None;
        }
    }

    Some(obj)
}

/*
 * Magazine layer
 */

/// Take a full magazine off the cache-global list (`first` selects the
/// most- or least-recently retired one).
fn get_mag_from_cache(cache: &SlabCache, first: bool) -> Option<*mut Magazine> {
    let mut mags = cache.magazines.lock();
    let link = if first { mags.first() } else { mags.last() }?;
    // SAFETY: magazine-list members are live magazines; the magazine
    // lock is held.
    unsafe { Link::remove(link) };
    cache.magazine_counter.fetch_sub(1, Ordering::AcqRel);
    // SAFETY: recovered from its list link.
    Some(unsafe { container_of!(link, Magazine, link) })
}

fn put_mag_to_cache(cache: &SlabCache, mag: *mut Magazine) {
    let mut mags = cache.magazines.lock();
    // SAFETY: the magazine is unlinked and owned by us; the magazine
    // lock is held.
    unsafe { mags.prepend(&mut (*mag).link) };
    cache.magazine_counter.fetch_add(1, Ordering::AcqRel);
}

/// Free every object in the magazine, then the magazine itself.
/// Returns the number of frames freed.
fn magazine_destroy(cache: &SlabCache, mag: *mut Magazine) -> usize {
    let mut frames = 0;
    // SAFETY: the magazine was detached from every list/pair by the
    // caller, so we own it and its object pointers.
    unsafe {
        for i in 0..(*mag).busy {
            frames += slab_obj_destroy(cache, (*mag).objs[i], None);
            cache.cached_objs.fetch_sub(1, Ordering::AcqRel);
        }
        slab_free_raw(MAG_CACHE.get(), mag as *mut u8, None);
    }
    frames
}

/// Make the pair's current magazine one with objects in it, importing
/// from the cache-global list if both local magazines are empty.
fn get_full_current_mag(cache: &SlabCache, pair: &mut MagPair) -> Option<*mut Magazine> {
    // SAFETY (all blocks below): magazines in the pair are owned by
    // this CPU and the pair lock is held.
    if !pair.current.is_null() {
        if unsafe { (*pair.current).busy } > 0 {
            return Some(pair.current);
        }
        if !pair.last.is_null() && unsafe { (*pair.last).busy } > 0 {
            core::mem::swap(&mut pair.current, &mut pair.last);
            return Some(pair.current);
        }
    }

    // Local magazines are empty; import a full one.
    let newmag = get_mag_from_cache(cache, true)?;

    if !pair.last.is_null() {
        magazine_destroy(cache, pair.last);
    }
    pair.last = pair.current;
    pair.current = newmag;
    Some(newmag)
}

/// Fast-path allocation from the executing CPU's magazines.
fn magazine_obj_get(cache: &SlabCache) -> Option<*mut u8> {
    let mags = cache.cpu_magazines()?;
    let mut pair = mags.lock.lock();

    let mag = get_full_current_mag(cache, &mut pair)?;
    // SAFETY: `mag` has busy > 0 and is owned by this CPU under the
    // pair lock.
    let obj = unsafe {
        let m = &mut *mag;
        m.busy -= 1;
        m.objs[m.busy]
    };
    drop(pair);

    cache.cached_objs.fetch_sub(1, Ordering::AcqRel);
    Some(obj)
}

/// Make the pair's current magazine one with room in it, allocating a
/// fresh magazine if both are full (the previous full one is retired to
/// the cache-global list).
fn make_empty_current_mag(cache: &SlabCache, pair: &mut MagPair) -> Option<*mut Magazine> {
    // SAFETY: as in get_full_current_mag.
    if !pair.current.is_null() {
        let current = unsafe { &*pair.current };
        if current.busy < current.size {
            return Some(pair.current);
        }
        if !pair.last.is_null() {
            let last = unsafe { &*pair.last };
            if last.busy < last.size {
                core::mem::swap(&mut pair.current, &mut pair.last);
                return Some(pair.current);
            }
        }
    }

    // Both magazines are full or missing. Never sleep and never start
    // reclaim for the sake of caching: that would deadlock the reclaim
    // path that empties these very magazines.
    let newmag = slab_alloc(
        MAG_CACHE.get(),
        FrameFlags::ATOMIC | FrameFlags::NO_RECLAIM,
    )?
    .as_ptr() as *mut Magazine;

    // SAFETY: fresh object from the magazine cache, exclusively ours.
    unsafe {
        newmag.write(Magazine {
            link: Link::new(),
            size: MAG_SIZE,
            busy: 0,
            objs: [ptr::null_mut(); MAG_SIZE],
        });
    }

    if !pair.last.is_null() {
        put_mag_to_cache(cache, pair.last);
    }
    pair.last = pair.current;
    pair.current = newmag;
    Some(newmag)
}

/// Fast-path free into the executing CPU's magazines. Returns false if
/// no magazine could take the object.
fn magazine_obj_put(cache: &SlabCache, obj: *mut u8) -> bool {
    let Some(mags) = cache.cpu_magazines() else {
        return false;
    };
    let mut pair = mags.lock.lock();

    let Some(mag) = make_empty_current_mag(cache, &mut pair) else {
        return false;
    };
    // SAFETY: `mag` has room and is owned by this CPU under the pair
    // lock.
    unsafe {
        let m = &mut *mag;
        m.objs[m.busy] = obj;
        m.busy += 1;
    }
    drop(pair);

    cache.cached_objs.fetch_add(1, Ordering::AcqRel);
    true
}

/*
 * Cache lifecycle
 */

/// Objects that fit one slab of the given geometry.
fn comp_objects(size: usize, order: usize, flags: SlabFlags) -> usize {
    if flags.contains(SlabFlags::INSIDE) {
        (order_to_size(order) - size_of::<Slab>()) / size
    } else {
        order_to_size(order) / size
    }
}

/// Wasted bytes in one slab of the given geometry.
fn badness(size: usize, order: usize, flags: SlabFlags) -> usize {
    let mut slab_size = order_to_size(order);
    if flags.contains(SlabFlags::INSIDE) {
        slab_size -= size_of::<Slab>();
    }
    slab_size - comp_objects(size, order, flags) * size
}

/// Build the per-CPU magazine array for a cache.
fn make_magcache(cache: &SlabCache) -> bool {
    assert!(
        SLAB_INITIALIZED.load(Ordering::Acquire) >= 2,
        "per-CPU magazines enabled before the CPU count is known"
    );

    // No sleeping and no reclaim: this can run under the registry
    // lock, which the reclaim walk also takes.
    let Some(array) = slab_alloc(
        SLAB_MAG_CACHE.get(),
        FrameFlags::ATOMIC | FrameFlags::NO_RECLAIM,
    ) else {
        return false;
    };
    let array = array.as_ptr() as *mut CpuMagazines;

    // SAFETY: the object is sized for config::cpu_count() entries and
    // exclusively ours until published below.
    unsafe {
        for cpu in 0..config::cpu_count() {
            array.add(cpu).write(CpuMagazines {
                lock: Mutex::new(MagPair {
                    current: ptr::null_mut(),
                    last: ptr::null_mut(),
                }),
            });
        }
    }

    cache.mag_cache.store(array, Ordering::Release);
    true
}

/// Initialize `cache` in place and link it into the registry.
fn cache_construct(
    cache: &mut SlabCache,
    name: &'static str,
    size: usize,
    align: usize,
    constructor: Option<SlabCtor>,
    destructor: Option<SlabDtor>,
    flags: SlabFlags,
) {
    assert!(size > 0, "zero-sized slab object");

    let align = align.max(size_of::<usize>());
    let size = size.next_multiple_of(align);

    cache.name = name;
    cache.size = size;
    cache.constructor = constructor;
    cache.destructor = destructor;

    let mut flags = flags;
    if size < MAX_INSIDE_SIZE {
        flags |= SlabFlags::INSIDE;
    }

    // Slab geometry by trial: start with the smallest frame run that
    // holds one object and double until the waste is acceptable.
    let mut order = fnzb(size_to_frames(size).next_power_of_two());
    while badness(size, order, flags) > max_badness(order) {
        order += 1;
    }

    // If the leftover space can hold the descriptor, keep it in-slab.
    if badness(size, order, flags) > size_of::<Slab>() {
        flags |= SlabFlags::INSIDE;
    }

    // Magazines need the final CPU count; a magazine-using cache
    // created before enable_cpucache() is implicitly deferred and
    // upgraded there.
    let magazines_ready = SLAB_INITIALIZED.load(Ordering::Acquire) >= 2;
    if !flags.contains(SlabFlags::NOMAGAZINE) && !magazines_ready {
        flags |= SlabFlags::MAGDEFERRED;
    }

    cache.order = order;
    cache.objects = comp_objects(size, order, flags);
    cache.set_flags(flags);

    if !flags.contains(SlabFlags::NOMAGAZINE)
        && !flags.contains(SlabFlags::MAGDEFERRED)
        && magazines_ready
    {
        let _ = make_magcache(cache);
    }

    let mut registry = CACHE_REGISTRY.lock();
    // SAFETY: the cache is not yet reachable by anyone else; the
    // registry lock is held.
    unsafe { registry.append(&mut cache.link) };
}

/// Create a slab cache.
pub fn slab_cache_create(
    name: &'static str,
    size: usize,
    align: usize,
    constructor: Option<SlabCtor>,
    destructor: Option<SlabDtor>,
    flags: SlabFlags,
) -> &'static SlabCache {
    let obj = slab_alloc(SLAB_CACHE_CACHE.get(), FrameFlags::empty())
        .expect("cache descriptor allocation failed");
    let cache = obj.as_ptr() as *mut SlabCache;

    // SAFETY: fresh object from the cache-of-caches, exclusively ours
    // until construction publishes it in the registry.
    unsafe {
        cache.write(SlabCache::empty(name));
        cache_construct(&mut *cache, name, size, align, constructor, destructor, flags);
        &*cache
    }
}

/// Tear down a cache. The caller guarantees nobody uses the cache
/// anymore; any live object is a bug and panics.
pub fn slab_cache_destroy(cache: &'static SlabCache) {
    // Unlink first so reclaim walks cannot see a dying cache.
    {
        let _registry = CACHE_REGISTRY.lock();
        let link = &cache.link as *const Link as *mut Link;
        // SAFETY: the cache was linked at construction; registry lock
        // held.
        unsafe { Link::remove(link) };
    }

    // Flush every cached object.
    _slab_reclaim(cache, ReclaimFlags::ALL);

    {
        let mut lists = cache.lists.lock();
        if !lists.full.is_empty() || !lists.partial.is_empty() {
            panic!("destroying slab cache '{}' with live objects", cache.name);
        }
    }

    let array = cache.mag_cache.swap(ptr::null_mut(), Ordering::AcqRel);
    if !array.is_null() {
        // SAFETY: the per-CPU array came from the magazine-array cache
        // and nobody can reach it anymore.
        unsafe { slab_free_raw(SLAB_MAG_CACHE.get(), array as *mut u8, None) };
    }

    // SAFETY: the descriptor came from the cache-of-caches.
    unsafe {
        slab_free_raw(
            SLAB_CACHE_CACHE.get(),
            cache as *const SlabCache as *mut u8,
            None,
        )
    };
}

/*
 * Public allocation interface
 */

/// Allocate one object. Returns `None` only under memory pressure (or
/// constructor failure); without `ATOMIC` the allocation may sleep in
/// the frame layer.
pub fn slab_alloc(cache: &SlabCache, flags: FrameFlags) -> Option<NonNull<u8>> {
    // Disable interrupts to avoid deadlocks with interrupt handlers
    // touching the same per-CPU magazines.
    let ipl = arch::interrupts_disable();

    let mut result = None;
    if !cache.flags().contains(SlabFlags::NOMAGAZINE) {
        result = magazine_obj_get(cache);
    }
    if result.is_none() {
        result = slab_obj_create(cache, flags);
    }

    arch::interrupts_restore(ipl);

    if result.is_some() {
        cache.allocated_objs.fetch_add(1, Ordering::AcqRel);
    }
    result.and_then(NonNull::new)
}

/// Free one object, with the owning slab already known (or `None`).
///
/// # Safety
///
/// `obj` must have been allocated from `cache` and not freed since.
unsafe fn slab_free_raw(cache: &SlabCache, obj: *mut u8, slab: Option<*mut Slab>) {
    let ipl = arch::interrupts_disable();

    if cache.flags().contains(SlabFlags::NOMAGAZINE) || !magazine_obj_put(cache, obj) {
        slab_obj_destroy(cache, obj, slab);
    }

    arch::interrupts_restore(ipl);
    cache.allocated_objs.fetch_sub(1, Ordering::AcqRel);
}

/// Return an object to its cache.
pub fn slab_free(cache: &SlabCache, obj: NonNull<u8>) {
    // SAFETY: the public contract requires `obj` to come from `cache`.
    unsafe { slab_free_raw(cache, obj.as_ptr(), None) };
}

/*
 * Reclaim
 */

/// Reclaim cached objects from one cache. Returns frames freed.
fn _slab_reclaim(cache: &SlabCache, flags: ReclaimFlags) -> usize {
    if cache.flags().contains(SlabFlags::NOMAGAZINE) {
        return 0;
    }

    let mut frames = 0;

    // Destroy shared magazines, oldest first. Bound the loop by the
    // count observed at entry so concurrent frees cannot prolong it.
    let mut magcount = cache.magazine_counter.load(Ordering::Acquire);
    while magcount > 0 {
        magcount -= 1;
        let Some(mag) = get_mag_from_cache(cache, false) else {
            break;
        };
        frames += magazine_destroy(cache, mag);
        if !flags.contains(ReclaimFlags::ALL) && frames > 0 {
            break;
        }
    }

    if flags.contains(ReclaimFlags::ALL) {
        // Also drain every CPU's magazine pair.
        let array = cache.mag_cache.load(Ordering::Acquire);
        if !array.is_null() {
            for cpu in 0..config::cpu_count() {
                // SAFETY: the array holds config::cpu_count() entries
                // and lives as long as the cache.
                let mags = unsafe { &*array.add(cpu) };
                let mut pair = mags.lock.lock();

                let current = pair.current;
                let last = pair.last;
                pair.current = ptr::null_mut();
                pair.last = ptr::null_mut();
                drop(pair);

                if !current.is_null() {
                    frames += magazine_destroy(cache, current);
                }
                if !last.is_null() {
                    frames += magazine_destroy(cache, last);
                }
            }
        }
    }

    frames
}

/// Walk all caches and reclaim what can be reclaimed. Called by the
/// frame allocator when it runs dry; a nonzero return means "retry".
///
/// The registry lock is only held while picking the next cache, never
/// across the frees themselves.
pub fn reclaim(flags: ReclaimFlags) -> usize {
    let mut frames = 0;
    let mut skip = 0;

    loop {
        let cache = {
            let mut registry = CACHE_REGISTRY.lock();
            match registry.iter().nth(skip) {
                // SAFETY: registry members are live caches; destruction
                // unlinks before teardown.
                Some(link) => unsafe { &*container_of!(link, SlabCache, link) },
                None => break,
            }
        };
        skip += 1;

        frames += _slab_reclaim(cache, flags);
    }

    if frames > 0 {
        log::debug!("slab reclaim returned {} frame(s)", frames);
    }
    frames
}

/*
 * malloc family
 */

/// Smallest malloc size class, as a power of two.
const MALLOC_MIN_W: usize = 4; // 16 B
/// Largest malloc size class, as a power of two.
const MALLOC_MAX_W: usize = 22; // 4 MiB
const MALLOC_CLASSES: usize = MALLOC_MAX_W - MALLOC_MIN_W + 1;

static MALLOC_NAMES: [&str; MALLOC_CLASSES] = [
    "malloc-16",
    "malloc-32",
    "malloc-64",
    "malloc-128",
    "malloc-256",
    "malloc-512",
    "malloc-1K",
    "malloc-2K",
    "malloc-4K",
    "malloc-8K",
    "malloc-16K",
    "malloc-32K",
    "malloc-64K",
    "malloc-128K",
    "malloc-256K",
    "malloc-512K",
    "malloc-1M",
    "malloc-2M",
    "malloc-4M",
];

static MALLOC_CACHES: [AtomicPtr<SlabCache>; MALLOC_CLASSES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MALLOC_CLASSES];

fn malloc_cache(size: usize) -> &'static SlabCache {
    let size = size.max(1 << MALLOC_MIN_W);
    let idx = fnzb(size - 1) + 1 - MALLOC_MIN_W;
    let cache = MALLOC_CACHES[idx].load(Ordering::Acquire);
    assert!(!cache.is_null(), "malloc used before slab init");
    // SAFETY: published once at init and never freed.
    unsafe { &*cache }
}

/// Allocate `size` bytes from the power-of-two caches.
pub fn malloc(size: usize, flags: FrameFlags) -> Option<NonNull<u8>> {
    assert!(SLAB_INITIALIZED.load(Ordering::Acquire) >= 1);
    assert!(size <= (1 << MALLOC_MAX_W), "oversized malloc request");

    slab_alloc(malloc_cache(size), flags)
}

/// Resize an allocation; contents are copied up to the smaller of the
/// old and new sizes.
///
/// # Safety
///
/// `ptr`, if some, must come from [`malloc`]/[`realloc`] and not have
/// been freed.
pub unsafe fn realloc(
    ptr: Option<NonNull<u8>>,
    size: usize,
    flags: FrameFlags,
) -> Option<NonNull<u8>> {
    assert!(SLAB_INITIALIZED.load(Ordering::Acquire) >= 1);
    assert!(size <= (1 << MALLOC_MAX_W), "oversized realloc request");

    let new_ptr = if size > 0 {
        slab_alloc(malloc_cache(size), flags)
    } else {
        None
    };

    if let (Some(new_ptr), Some(old)) = (new_ptr, ptr) {
        // SAFETY: the old object's class size is recoverable from its
        // slab; copying min(new class, old class) bytes stays inside
        // both allocations.
        unsafe {
            let slab = obj_to_slab(old.as_ptr());
            let old_size = (*(*slab).cache).size;
            ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), size.min(old_size));
        }
    }

    if let Some(old) = ptr {
        // SAFETY: forwarded caller contract.
        unsafe { free(old.as_ptr()) };
    }

    new_ptr
}

/// Free a malloc allocation. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or come from [`malloc`]/[`realloc`] and not have
/// been freed.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let slab = obj_to_slab(ptr);
    // SAFETY: the frame annotation names the owning slab and cache.
    unsafe {
        let cache = &*(*slab).cache;
        slab_free_raw(cache, ptr, Some(slab));
    }
}

/// Bare-metal `GlobalAlloc` over the malloc caches.
#[cfg(target_os = "none")]
pub struct KernelAllocator;

#[cfg(target_os = "none")]
// SAFETY: alloc/dealloc delegate to the slab malloc family, which
// hands out unique, properly sized allocations; size classes are
// powers of two, so any allocation is aligned to its class size.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // Power-of-two classes are aligned to their size; serving
        // max(size, align) satisfies any smaller alignment.
        let size = layout.size().max(layout.align());
        if size > (1 << MALLOC_MAX_W) {
            return ptr::null_mut();
        }
        malloc(size, FrameFlags::ATOMIC)
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        // SAFETY: `ptr` came from alloc() above.
        unsafe { free(ptr) };
    }
}

/*
 * Bootstrap
 */

/// Create the bootstrap caches. Runs once, after `frame_init`, on the
/// boot CPU.
pub fn init() {
    // SAFETY: single-threaded boot; nothing else touches the slab
    // allocator yet.
    unsafe {
        MAG_CACHE.init(|cache| {
            cache_construct(
                cache,
                "slab_magazine",
                size_of::<Magazine>(),
                size_of::<usize>(),
                None,
                None,
                SlabFlags::NOMAGAZINE | SlabFlags::INSIDE,
            );
        });

        SLAB_CACHE_CACHE.init(|cache| {
            cache_construct(
                cache,
                "slab_cache_cache",
                size_of::<SlabCache>(),
                size_of::<usize>(),
                None,
                None,
                SlabFlags::NOMAGAZINE | SlabFlags::INSIDE,
            );
        });
    }

    let extern_cache = slab_cache_create(
        "slab_descriptor",
        size_of::<Slab>(),
        0,
        None,
        None,
        SlabFlags::INSIDE | SlabFlags::MAGDEFERRED,
    );
    SLAB_EXTERN_CACHE.store(
        extern_cache as *const SlabCache as *mut SlabCache,
        Ordering::Release,
    );

    for (i, name) in MALLOC_NAMES.iter().enumerate() {
        let size = 1usize << (MALLOC_MIN_W + i);
        let cache = slab_cache_create(name, size, 0, None, None, SlabFlags::MAGDEFERRED);
        MALLOC_CACHES[i].store(
            cache as *const SlabCache as *mut SlabCache,
            Ordering::Release,
        );
    }

    SLAB_INITIALIZED.store(1, Ordering::Release);
    log::info!("slab allocator up ({} malloc classes)", MALLOC_CLASSES);
}

/// Enable per-CPU magazines: create the magazine-array cache for the
/// now-known CPU count and upgrade every deferred cache.
pub fn enable_cpucache() {
    SLAB_INITIALIZED.store(2, Ordering::Release);

    // SAFETY: runs once, still single-threaded, after init().
    unsafe {
        SLAB_MAG_CACHE.init(|cache| {
            cache_construct(
                cache,
                "slab_mag_cache",
                config::cpu_count() * size_of::<CpuMagazines>(),
                size_of::<usize>(),
                None,
                None,
                SlabFlags::NOMAGAZINE | SlabFlags::INSIDE,
            );
        });
    }

    let mut registry = CACHE_REGISTRY.lock();
    for link in registry.iter() {
        // SAFETY: registry members are live caches; registry lock held.
        let cache = unsafe { &*container_of!(link, SlabCache, link) };
        let flags = cache.flags();
        if !flags.contains(SlabFlags::MAGDEFERRED) {
            continue;
        }
        let _ = make_magcache(cache);
        cache.set_flags(flags - SlabFlags::MAGDEFERRED);
    }
    drop(registry);

    log::info!(
        "slab per-CPU magazines enabled for {} cpu(s)",
        config::cpu_count()
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;

    fn checked_alloc(cache: &SlabCache) -> NonNull<u8> {
        slab_alloc(cache, FrameFlags::ATOMIC).expect("slab allocation should succeed")
    }

    #[test]
    fn slab_grows_and_shrinks_with_demand() {
        let _serial = test_support::init();

        // NOMAGAZINE keeps every free on the slab path, which makes the
        // slab counts deterministic.
        let cache = slab_cache_create(
            "test_obj16",
            16,
            0,
            None,
            None,
            SlabFlags::NOMAGAZINE,
        );
        let per_slab = cache.objects_per_slab();
        assert!(per_slab > 2);

        let mut objs = std::vec::Vec::new();
        for _ in 0..per_slab {
            objs.push(checked_alloc(cache));
        }
        assert_eq!(cache.allocated_slabs(), 1);

        // One past capacity opens a second slab.
        let extra = checked_alloc(cache);
        assert_eq!(cache.allocated_slabs(), 2);
        assert_eq!(cache.allocated_objects(), per_slab + 1);

        // Returning every object of the first slab releases it.
        for obj in objs.drain(..) {
            slab_free(cache, obj);
        }
        assert_eq!(cache.allocated_slabs(), 1);

        slab_free(cache, extra);
        assert_eq!(cache.allocated_slabs(), 0);
        assert_eq!(cache.allocated_objects(), 0);

        slab_cache_destroy(cache);
    }

    #[test]
    fn objects_are_distinct_and_reusable() {
        let _serial = test_support::init();

        let cache = slab_cache_create("test_distinct", 64, 0, None, None, SlabFlags::NOMAGAZINE);

        let a = checked_alloc(cache);
        let b = checked_alloc(cache);
        assert_ne!(a, b);

        // Objects are aligned to the object size class.
        assert_eq!(a.as_ptr() as usize % cache.object_size(), 0);

        slab_free(cache, a);
        let c = checked_alloc(cache);
        // LIFO reuse of the embedded free chain.
        assert_eq!(a, c);

        slab_free(cache, b);
        slab_free(cache, c);
        slab_cache_destroy(cache);
    }

    #[test]
    fn constructor_failure_fails_the_allocation() {
        let _serial = test_support::init();

        fn failing_ctor(_obj: *mut u8, _flags: FrameFlags) -> Result<(), KernelError> {
            Err(KernelError::Busy)
        }

        let cache = slab_cache_create(
            "test_bad_ctor",
            32,
            0,
            Some(failing_ctor),
            None,
            SlabFlags::NOMAGAZINE,
        );

        assert!(slab_alloc(cache, FrameFlags::ATOMIC).is_none());
        assert_eq!(cache.allocated_objects(), 0);
        assert_eq!(cache.allocated_slabs(), 0);

        slab_cache_destroy(cache);
    }

    #[test]
    fn magazines_cache_frees_and_reclaim_drains_them() {
        let _serial = test_support::init();

        let cache = slab_cache_create("test_mag", 48, 0, None, None, SlabFlags::empty());
        assert!(
            !cache.flags().contains(SlabFlags::MAGDEFERRED),
            "caches created after enable_cpucache get magazines directly"
        );

        let a = checked_alloc(cache);
        let b = checked_alloc(cache);
        slab_free(cache, a);
        slab_free(cache, b);

        // Both frees went into the CPU magazine, not back to the slab.
        assert_eq!(cache.cached_objects(), 2);
        assert_eq!(cache.allocated_objects(), 0);

        // A magazine hit returns the most recently freed object.
        let c = checked_alloc(cache);
        assert_eq!(c, b);
        assert_eq!(cache.cached_objects(), 1);
        slab_free(cache, c);

        // Full reclaim empties the per-CPU pair and releases the slab.
        let freed = _slab_reclaim(cache, ReclaimFlags::ALL);
        assert!(freed > 0, "reclaim should free the now-empty slab");
        assert_eq!(cache.cached_objects(), 0);
        assert_eq!(cache.allocated_slabs(), 0);

        slab_cache_destroy(cache);
    }

    #[test]
    fn slab_accounting_invariant_holds() {
        let _serial = test_support::init();

        let cache = slab_cache_create("test_account", 40, 0, None, None, SlabFlags::empty());

        let mut held = std::vec::Vec::new();
        for _ in 0..10 {
            held.push(checked_alloc(cache));
        }
        for _ in 0..4 {
            let obj = held.pop().expect("held objects remain");
            slab_free(cache, obj);
        }

        // cached + handed-out == allocated.
        assert_eq!(cache.allocated_objects(), 6);
        assert_eq!(cache.cached_objects(), 4);

        for obj in held.drain(..) {
            slab_free(cache, obj);
        }
        _slab_reclaim(cache, ReclaimFlags::ALL);
        slab_cache_destroy(cache);
    }

    #[test]
    fn malloc_round_trip_and_realloc_copy() {
        let _serial = test_support::init();

        let p = malloc(100, FrameFlags::ATOMIC).expect("malloc should succeed");
        // 100 bytes lands in the 128-byte class.
        // SAFETY: fresh 128-byte allocation.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xa5, 100);
        }

        // SAFETY: `p` is live and from malloc.
        let q = unsafe { realloc(Some(p), 300, FrameFlags::ATOMIC) }
            .expect("realloc should succeed");
        // SAFETY: realloc copied the old contents.
        unsafe {
            for i in 0..100 {
                assert_eq!(*q.as_ptr().add(i), 0xa5);
            }
            free(q.as_ptr());
        }
    }

    #[test]
    fn global_reclaim_reports_frames() {
        let _serial = test_support::init();

        let cache = slab_cache_create("test_reclaim", 56, 0, None, None, SlabFlags::empty());

        // Park some objects in magazines, then ask the world to shrink.
        let a = checked_alloc(cache);
        let b = checked_alloc(cache);
        slab_free(cache, a);
        slab_free(cache, b);

        let freed = reclaim(ReclaimFlags::ALL);
        assert!(freed > 0, "global reclaim should free the cached slab");

        slab_cache_destroy(cache);
    }
}
