//! Physical frame allocator and memory zone management.
//!
//! Physical memory is split into zones, each a contiguous frame range
//! with its own buddy system and its own lock. The zone table is
//! protected by a global lock; to work on a zone, take the table lock,
//! take the zone lock, then drop the table lock — this way zones can be
//! reshaped at runtime (merging) without stalling unrelated allocations.
//!
//! A zone's configuration block (the `Zone` header plus the per-frame
//! metadata array) lives inside the zone's own frames, placed there at
//! creation and marked unavailable; merging relocates it.
//!
//! Every public entry point disables interrupts for the duration of any
//! lock it holds and restores them on all exits.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::config;
use crate::error::KernelError;
use crate::mm::buddy::{BuddySystem, FRAME_NIL};
use crate::mm::slab;
use crate::mm::{fnzb, frame_to_ptr, ptr_to_frame, size_to_frames, FrameNumber};

/// Maximum number of zones in the zone table.
const ZONES_MAX: usize = 32;

bitflags! {
    /// Allocation policy flags for [`frame_alloc_generic`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Never sleep; report `NoMemory` instead.
        const ATOMIC = 1 << 0;
        /// Abort the kernel on failure.
        const PANIC = 1 << 1;
        /// Only zones covered by the identity mapping.
        const LOWMEM = 1 << 2;
        /// Prefer high-memory zones.
        const HIGHMEM = 1 << 3;
        /// Do not invoke the slab reclaim feedback loop.
        const NO_RECLAIM = 1 << 4;
    }
}

bitflags! {
    /// Zone placement attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneFlags: u32 {
        /// Covered by the kernel identity mapping.
        const LOWMEM = 1 << 0;
        /// Above the identity-mapped boundary.
        const HIGHMEM = 1 << 1;
    }
}

/// Per-frame metadata, stored in the owning zone's configuration block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// Nonzero means busy; shared frames count their users.
    pub(crate) refcount: u32,
    /// Order of the buddy block this frame heads.
    pub(crate) buddy_order: u8,
    /// True while the frame heads a block on a buddy free list.
    pub(crate) on_free_list: bool,
    /// Free-list linkage, as frame indices within the zone.
    pub(crate) free_prev: u32,
    pub(crate) free_next: u32,
    /// Owning-slab back-annotation (opaque to this layer).
    pub(crate) parent: usize,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            refcount: 1,
            buddy_order: 0,
            on_free_list: false,
            free_prev: FRAME_NIL,
            free_next: FRAME_NIL,
            parent: 0,
        }
    }
}

/// A memory zone: the lock and everything it protects.
pub(crate) struct Zone {
    lock: Mutex<ZoneInner>,
}

pub(crate) struct ZoneInner {
    base: FrameNumber,
    count: usize,
    flags: ZoneFlags,
    free_count: usize,
    busy_count: usize,
    buddy: BuddySystem,
    frames: NonNull<Frame>,
}

impl ZoneInner {
    /// The buddy system and the frame array, borrowed together.
    fn parts(&mut self) -> (&mut BuddySystem, &mut [Frame]) {
        let frames = self.frames.as_ptr();
        let count = self.count;
        // SAFETY: `frames` points at `count` initialized Frame records
        // in this zone's configuration block, which lives as long as the
        // zone; `&mut self` means we hold the zone lock exclusively.
        let frames = unsafe { core::slice::from_raw_parts_mut(frames, count) };
        (&mut self.buddy, frames)
    }

    fn contains(&self, pfn: FrameNumber) -> bool {
        pfn >= self.base && pfn.offset_from(self.base) < self.count
    }

    fn can_alloc(&self, order: usize) -> bool {
        self.buddy.can_alloc(order)
    }

    /// Allocate `2^order` frames; the caller has checked `can_alloc`.
    /// Returns the index of the first frame relative to the zone base.
    fn frame_alloc(&mut self, order: usize) -> u32 {
        let (buddy, frames) = self.parts();
        let idx = buddy
            .alloc(frames, order)
            .expect("zone cannot satisfy an order it reported allocatable");

        self.free_count -= 1 << order;
        self.busy_count += 1 << order;
        idx
    }

    /// Drop one reference from the frame at `idx`; at zero, return its
    /// block to the buddy.
    fn frame_free(&mut self, idx: usize) {
        let (buddy, frames) = self.parts();
        let order = frames[idx].buddy_order as usize;

        assert!(frames[idx].refcount > 0, "freeing a non-busy frame");

        frames[idx].refcount -= 1;
        if frames[idx].refcount == 0 {
            buddy.free(frames, idx as u32);
            self.free_count += 1 << order;
            self.busy_count -= 1 << order;
        }
    }

    /// Permanently withdraw a free frame from allocation.
    fn mark_unavailable(&mut self, idx: usize) {
        let (buddy, frames) = self.parts();
        if frames[idx].refcount > 0 {
            return;
        }
        buddy.alloc_block(frames, idx as u32);
        self.free_count -= 1;
    }

    /// Reduce an allocated block to order-0 frames and free the tail
    /// beyond `keep`. Afterwards the kept frames must be freed one by
    /// one.
    fn reduce_region(&mut self, idx: usize, keep: usize) {
        let (_, frames) = self.parts();
        let order = frames[idx].buddy_order as usize;
        assert!(
            (1usize << order) >= keep,
            "reduced block smaller than the kept span"
        );

        for i in 0..(1usize << order) {
            let frame = &mut frames[idx + i];
            frame.buddy_order = 0;
            if frame.refcount == 0 {
                frame.refcount = 1;
            }
            assert_eq!(frame.refcount, 1, "reduced block is shared");
        }

        for i in keep..(1usize << order) {
            self.frame_free(idx + i);
        }
    }
}

/// Zone pointer stored in the global table.
///
/// SAFETY: a zone's configuration block stays mapped and valid as long
/// as the zone is listed in the table; all mutable state behind the
/// pointer is protected by the zone's own lock.
struct ZoneRef(NonNull<Zone>);
// SAFETY: see ZoneRef above; cross-CPU access is serialized by the zone
// lock and the table lock.
unsafe impl Send for ZoneRef {}
// SAFETY: same as Send.
unsafe impl Sync for ZoneRef {}

struct ZoneEntry {
    zone: ZoneRef,
    /// Base and count mirrored here so table scans need not take the
    /// zone lock; updated only while holding the table lock.
    base: FrameNumber,
    count: usize,
}

struct ZoneTable {
    count: usize,
    entries: [Option<ZoneEntry>; ZONES_MAX],
}

/// The zone table. Lock order: this lock first, then any zone lock;
/// a zone lock may be retained after this one is dropped.
static ZONES: Mutex<ZoneTable> = Mutex::new(ZoneTable {
    count: 0,
    entries: [const { None }; ZONES_MAX],
});

/// Offset of the frame array inside a configuration block.
const fn conf_frames_offset() -> usize {
    size_of::<Zone>().next_multiple_of(align_of::<Frame>())
}

/// Bytes of configuration data needed for a zone of `count` frames.
pub fn zone_conf_size(count: usize) -> usize {
    conf_frames_offset() + count * size_of::<Frame>()
}

/// Build a zone in the configuration block at `conf`: header, frame
/// array, and a buddy populated by freeing every frame individually.
fn zone_construct(
    conf: *mut u8,
    base: FrameNumber,
    count: usize,
    flags: ZoneFlags,
) -> NonNull<Zone> {
    let max_order = fnzb(count);
    let zone_ptr = conf as *mut Zone;
    // SAFETY: the caller hands over zone_conf_size(count) bytes at
    // `conf`; the frame array starts past the aligned header.
    let frames_ptr = unsafe { conf.add(conf_frames_offset()) } as *mut Frame;

    // SAFETY: frames_ptr..frames_ptr+count lies inside the caller's
    // configuration block and nothing references it yet.
    unsafe {
        for i in 0..count {
            frames_ptr.add(i).write(Frame::new());
        }
    }

    let inner = ZoneInner {
        base,
        count,
        flags,
        free_count: count,
        busy_count: 0,
        buddy: BuddySystem::new(max_order, base.as_u64()),
        frames: NonNull::new(frames_ptr).expect("configuration block has a null frame array"),
    };

    // SAFETY: `zone_ptr` is the start of the caller's configuration
    // block, properly aligned for Zone (frame-aligned memory).
    unsafe {
        zone_ptr.write(Zone {
            lock: Mutex::new(inner),
        });
    }

    // SAFETY: just initialized above.
    let zone = unsafe { &*zone_ptr };

    // Stuff the frames into the buddy one by one; merging coalesces
    // them into maximal blocks as a side effect.
    let mut guard = zone.lock.lock();
    let (buddy, frames) = guard.parts();
    for idx in 0..count as u32 {
        frames[idx as usize].refcount = 0;
        buddy.free(frames, idx);
    }
    drop(guard);

    NonNull::from(zone)
}

/// Insert-sort a constructed zone into the table.
///
/// Interrupts must be disabled.
fn zones_add_zone(
    zone: NonNull<Zone>,
    base: FrameNumber,
    count: usize,
) -> Result<usize, KernelError> {
    let mut table = ZONES.lock();

    if table.count + 1 == ZONES_MAX {
        panic!("maximum zone count {} exceeded", ZONES_MAX);
    }

    let mut at = table.count;
    for i in 0..table.count {
        let entry = table.entries[i].as_ref().expect("zone table hole");
        let overlap = base.as_u64() < entry.base.as_u64() + entry.count as u64
            && entry.base.as_u64() < base.as_u64() + count as u64;
        if overlap {
            log::warn!(
                "zone [{:#x}+{:#x}) overlaps an existing zone",
                base.as_u64(),
                count
            );
            return Err(KernelError::Busy);
        }
        if base < entry.base {
            at = i;
            break;
        }
    }

    for i in (at..table.count).rev() {
        table.entries[i + 1] = table.entries[i].take();
    }
    table.entries[at] = Some(ZoneEntry {
        zone: ZoneRef(zone),
        base,
        count,
    });
    table.count += 1;

    Ok(at)
}

/// Find and lock the zone containing `pfn`, starting the scan at the
/// caller's zone hint. The table lock is dropped before returning; the
/// zone lock is retained.
///
/// Interrupts must be disabled.
fn find_zone_and_lock(
    pfn: FrameNumber,
    hint: usize,
) -> Option<(usize, MutexGuard<'static, ZoneInner>)> {
    let table = ZONES.lock();

    if table.count == 0 {
        return None;
    }

    let start = if hint < table.count { hint } else { 0 };
    let mut i = start;
    loop {
        let entry = table.entries[i].as_ref().expect("zone table hole");
        if pfn >= entry.base && pfn.offset_from(entry.base) < entry.count {
            // SAFETY: the entry keeps the zone alive; see ZoneRef.
            let zone: &'static Zone = unsafe { &*entry.zone.0.as_ptr() };
            let guard = zone.lock.lock();
            drop(table);
            return Some((i, guard));
        }

        i += 1;
        if i >= table.count {
            i = 0;
        }
        if i == start {
            return None;
        }
    }
}

/// Find and lock a zone able to satisfy `order` under the given flags,
/// scanning from the hint. Table lock dropped, zone lock retained.
///
/// Interrupts must be disabled.
fn find_free_zone_and_lock(
    order: usize,
    flags: FrameFlags,
    hint: usize,
) -> Option<(usize, MutexGuard<'static, ZoneInner>)> {
    // High-memory requests prefer high zones but may fall back;
    // low-memory requests must not.
    let passes: &[Option<ZoneFlags>] = if flags.contains(FrameFlags::LOWMEM) {
        &[Some(ZoneFlags::LOWMEM)]
    } else if flags.contains(FrameFlags::HIGHMEM) {
        &[Some(ZoneFlags::HIGHMEM), None]
    } else {
        &[None]
    };

    for &required in passes {
        let table = ZONES.lock();
        if table.count == 0 {
            return None;
        }

        let start = if hint < table.count { hint } else { 0 };
        let mut i = start;
        loop {
            let entry = table.entries[i].as_ref().expect("zone table hole");
            // SAFETY: the entry keeps the zone alive; see ZoneRef.
            let zone: &'static Zone = unsafe { &*entry.zone.0.as_ptr() };
            let guard = zone.lock.lock();

            let flags_ok = match required {
                Some(wanted) => guard.flags.contains(wanted),
                None => true,
            };
            if flags_ok && guard.can_alloc(order) {
                drop(table);
                return Some((i, guard));
            }
            drop(guard);

            i += 1;
            if i >= table.count {
                i = 0;
            }
            if i == start {
                break;
            }
        }
    }

    None
}

/// Create a zone over `[base, base + count)` and add it to the table.
///
/// `conf_frame` names where the configuration block goes. If it lies
/// inside the zone, a suitable spot is searched from there onward
/// (skipping the kernel image and initial task images) and the chosen
/// frames are marked unavailable. If it lies outside, the caller
/// guarantees `zone_conf_size(count)` bytes of usable memory there.
pub fn zone_create(
    base: FrameNumber,
    count: usize,
    conf_frame: FrameNumber,
    flags: ZoneFlags,
) -> Result<usize, KernelError> {
    assert!(count > 0, "empty zone");

    let conf_count = size_to_frames(zone_conf_size(count));
    let in_zone = conf_frame >= base && conf_frame.offset_from(base) < count;

    let mut conf = conf_frame;
    if in_zone {
        loop {
            if conf.offset_from(base) >= count {
                panic!("cannot find configuration data placement for zone");
            }
            if !config::overlaps_reserved(conf, conf_count) {
                break;
            }
            conf = conf.add(1);
        }
    }

    let zone = zone_construct(frame_to_ptr(conf), base, count, flags);

    let ipl = arch::interrupts_disable();
    let znum = match zones_add_zone(zone, base, count) {
        Ok(znum) => znum,
        Err(err) => {
            arch::interrupts_restore(ipl);
            return Err(err);
        }
    };

    if in_zone {
        // SAFETY: the zone was just constructed and registered; the
        // pointer is valid for the kernel lifetime.
        let zone: &'static Zone = unsafe { &*zone.as_ptr() };
        let mut guard = zone.lock.lock();
        for i in 0..conf_count {
            guard.mark_unavailable(conf.offset_from(base) + i);
        }
    }
    arch::interrupts_restore(ipl);

    log::debug!(
        "zone {}: [{:#x}+{:#x}), conf at {:#x}",
        znum,
        base.as_u64(),
        count,
        conf.as_u64()
    );
    Ok(znum)
}

/// Allocate `2^order` frames of physical memory.
///
/// `flags` selects the failure and zone-selection policy; `hint` is a
/// caller-kept zone index that amortizes the table scan and is updated
/// on success.
pub fn frame_alloc_generic(
    order: usize,
    flags: FrameFlags,
    hint: Option<&mut usize>,
) -> Result<FrameNumber, KernelError> {
    let hint_val = hint.as_deref().copied().unwrap_or(0);

    let ipl = arch::interrupts_disable();

    let mut found = find_free_zone_and_lock(order, flags, hint_val);

    // No zone can satisfy the request: ask the slab layer to give back
    // cached objects, lightly first, then everything it has.
    if found.is_none() && !flags.contains(FrameFlags::NO_RECLAIM) {
        if slab::reclaim(slab::ReclaimFlags::empty()) > 0 {
            found = find_free_zone_and_lock(order, flags, hint_val);
        }
        if found.is_none() && slab::reclaim(slab::ReclaimFlags::ALL) > 0 {
            found = find_free_zone_and_lock(order, flags, hint_val);
        }
    }

    let Some((znum, mut zone)) = found else {
        if flags.contains(FrameFlags::PANIC) {
            panic!("cannot allocate {} frames", 1usize << order);
        }
        arch::interrupts_restore(ipl);
        return Err(KernelError::NoMemory { order });
    };

    let idx = zone.frame_alloc(order);
    let pfn = zone.base.add(idx as usize);
    drop(zone);
    arch::interrupts_restore(ipl);

    if let Some(hint) = hint {
        *hint = znum;
    }
    Ok(pfn)
}

/// Allocate `2^order` frames with no zone hint.
pub fn frame_alloc(order: usize, flags: FrameFlags) -> Result<FrameNumber, KernelError> {
    frame_alloc_generic(order, flags, None)
}

/// Drop a reference to the block starting at `pfn`; at refcount zero
/// the block returns to its zone's buddy. The block's order is
/// recovered from the frame annotation, so only the starting pfn is
/// needed.
pub fn frame_free(pfn: FrameNumber) {
    let ipl = arch::interrupts_disable();

    let (_, mut zone) =
        find_zone_and_lock(pfn, 0).unwrap_or_else(|| panic!("no zone owns frame {:#x}", pfn.as_u64()));
    let idx = pfn.offset_from(zone.base);
    zone.frame_free(idx);
    drop(zone);

    arch::interrupts_restore(ipl);
}

/// Add a reference to a busy frame (shared frames).
pub fn frame_reference_add(pfn: FrameNumber) {
    let ipl = arch::interrupts_disable();

    let (_, mut zone) =
        find_zone_and_lock(pfn, 0).unwrap_or_else(|| panic!("no zone owns frame {:#x}", pfn.as_u64()));
    let idx = pfn.offset_from(zone.base);
    let (_, frames) = zone.parts();
    assert!(frames[idx].refcount > 0, "referencing a free frame");
    frames[idx].refcount += 1;
    drop(zone);

    arch::interrupts_restore(ipl);
}

/// Back-annotate a frame with its owner (the slab layer stores the
/// owning slab here). The hint amortizes the zone lookup.
pub fn frame_set_parent(pfn: FrameNumber, parent: usize, hint: &mut usize) {
    let ipl = arch::interrupts_disable();

    let (znum, mut zone) =
        find_zone_and_lock(pfn, *hint).unwrap_or_else(|| panic!("no zone owns frame {:#x}", pfn.as_u64()));
    let idx = pfn.offset_from(zone.base);
    let (_, frames) = zone.parts();
    frames[idx].parent = parent;
    drop(zone);

    arch::interrupts_restore(ipl);
    *hint = znum;
}

pub fn frame_get_parent(pfn: FrameNumber, hint: &mut usize) -> usize {
    let ipl = arch::interrupts_disable();

    let (znum, mut zone) =
        find_zone_and_lock(pfn, *hint).unwrap_or_else(|| panic!("no zone owns frame {:#x}", pfn.as_u64()));
    let idx = pfn.offset_from(zone.base);
    let (_, frames) = zone.parts();
    let parent = frames[idx].parent;
    drop(zone);

    arch::interrupts_restore(ipl);
    *hint = znum;
    parent
}

/// Permanently withdraw a frame range from allocation (kernel image,
/// initial RAM disk). Frames not covered by any zone are skipped.
pub fn frame_mark_unavailable(start: FrameNumber, count: usize) {
    let mut hint = 0;

    for i in 0..count {
        let pfn = start.add(i);
        let ipl = arch::interrupts_disable();
        if let Some((znum, mut zone)) = find_zone_and_lock(pfn, hint) {
            let idx = pfn.offset_from(zone.base);
            zone.mark_unavailable(idx);
            drop(zone);
            hint = znum;
        }
        arch::interrupts_restore(ipl);
    }
}

/// Build the merged zone's configuration block at `conf` from the two
/// locked source zones. Returns the new zone pointer.
fn build_merged_zone(
    conf: *mut u8,
    z1: &mut ZoneInner,
    z2: &mut ZoneInner,
) -> NonNull<Zone> {
    assert!(z1.base < z2.base, "merge sources out of order");

    let base = z1.base;
    let count = z2.base.offset_from(z1.base) + z2.count;
    let max_order = fnzb(count);

    // SAFETY: the caller hands over zone_conf_size(count) bytes at
    // `conf`, allocated from one of the source zones and disjoint from
    // both old configuration blocks.
    let frames_ptr = unsafe { conf.add(conf_frames_offset()) } as *mut Frame;
    // SAFETY: same span as above; gap frames between the two source
    // zones start out busy and are never handed out.
    unsafe {
        for i in 0..count {
            frames_ptr.add(i).write(Frame::new());
        }
    }

    // SAFETY: fully initialized in the loop above, exclusively ours
    // until the Zone is published.
    let frames = unsafe { core::slice::from_raw_parts_mut(frames_ptr, count) };

    // Copy the source metadata so busy blocks keep their orders and
    // parents across the merge.
    {
        let (_, f1) = z1.parts();
        frames[..f1.len()].copy_from_slice(f1);
    }
    {
        let offset = z2.base.offset_from(base);
        let (_, f2) = z2.parts();
        frames[offset..offset + f2.len()].copy_from_slice(f2);
    }

    // Sanitize: busy blocks are skipped whole; free frames are reset to
    // busy order-0 singles (they are re-added through the buddy below)
    // and their stale list linkage is cleared.
    let mut i = 0;
    while i < count {
        if frames[i].refcount > 0 {
            i += 1 << frames[i].buddy_order;
        } else {
            let frame = &mut frames[i];
            frame.refcount = 1;
            frame.buddy_order = 0;
            frame.on_free_list = false;
            frame.free_prev = FRAME_NIL;
            frame.free_next = FRAME_NIL;
            i += 1;
        }
    }

    // Accounting totals must be taken before the drain below empties
    // the source zones.
    let free_count = z1.free_count + z2.free_count;
    let busy_count = z1.busy_count + z2.busy_count;

    // Drain all free blocks of both source zones into the new buddy.
    let mut buddy = BuddySystem::new(max_order, base.as_u64());
    while z1.can_alloc(0) {
        let idx = z1.frame_alloc(0) as usize;
        frames[idx].refcount = 0;
        buddy.free(frames, idx as u32);
    }
    let offset = z2.base.offset_from(base);
    while z2.can_alloc(0) {
        let idx = z2.frame_alloc(0) as usize + offset;
        frames[idx].refcount = 0;
        buddy.free(frames, idx as u32);
    }

    let inner = ZoneInner {
        base,
        count,
        flags: z1.flags & z2.flags,
        free_count,
        busy_count,
        buddy,
        frames: NonNull::new(frames_ptr).expect("merged frame array is null"),
    };

    let zone_ptr = conf as *mut Zone;
    // SAFETY: start of the handed-over configuration block, aligned.
    unsafe {
        zone_ptr.write(Zone {
            lock: Mutex::new(inner),
        });
        NonNull::new_unchecked(zone_ptr)
    }
}

/// Return an old configuration block's frames to the merged zone.
/// They were counted neither free nor busy in the source zone, so each
/// is first accounted busy and then freed.
fn return_config_frames(zone: &mut ZoneInner, conf_pfn: FrameNumber, old_count: usize) {
    let conf_frames = size_to_frames(zone_conf_size(old_count));

    if !zone.contains(conf_pfn) {
        return;
    }

    let idx = conf_pfn.offset_from(zone.base);
    {
        let (_, frames) = zone.parts();
        assert_eq!(frames[idx].buddy_order, 0, "configuration block has an order");
    }

    for i in 0..conf_frames {
        zone.busy_count += 1;
        zone.frame_free(idx + i);
    }
}

/// Merge two adjacent zone-table entries (`z2 == z1 + 1`) into one
/// zone. The merged configuration block is allocated from one of the
/// source zones; the old configuration blocks are returned to the new
/// zone afterwards.
pub fn zone_merge(z1: usize, z2: usize) -> Result<(), KernelError> {
    let ipl = arch::interrupts_disable();
    let mut table = ZONES.lock();

    // Only two zones with none in between can be joined.
    if z1 >= table.count || z2 >= table.count || z2 != z1 + 1 {
        drop(table);
        arch::interrupts_restore(ipl);
        return Err(KernelError::OutOfBounds);
    }

    let (zone1, zone2): (&'static Zone, &'static Zone) = {
        let p1 = table.entries[z1].as_ref().expect("zone table hole").zone.0;
        let p2 = table.entries[z2].as_ref().expect("zone table hole").zone.0;
        // SAFETY: the entries keep both zones alive; see ZoneRef.
        unsafe { (&*p1.as_ptr(), &*p2.as_ptr()) }
    };
    let mut guard1 = zone1.lock.lock();
    let mut guard2 = zone2.lock.lock();

    let span = guard2.base.offset_from(guard1.base) + guard2.count;
    let conf_frames = size_to_frames(zone_conf_size(span));
    let order = fnzb(conf_frames) + 1;

    // The merged configuration block must live in one of the zones
    // being merged.
    let conf_pfn = if guard1.can_alloc(order) {
        let idx = guard1.frame_alloc(order) as usize;
        guard1.base.add(idx)
    } else if guard2.can_alloc(order) {
        let idx = guard2.frame_alloc(order) as usize;
        guard2.base.add(idx)
    } else {
        drop(guard2);
        drop(guard1);
        drop(table);
        arch::interrupts_restore(ipl);
        return Err(KernelError::NoMemory { order });
    };

    let old1 = (ptr_to_frame(zone1 as *const Zone as *const u8), guard1.count);
    let old2 = (ptr_to_frame(zone2 as *const Zone as *const u8), guard2.count);

    let merged = build_merged_zone(frame_to_ptr(conf_pfn), &mut guard1, &mut guard2);
    // SAFETY: freshly built above; valid for the kernel lifetime.
    let merged_zone: &'static Zone = unsafe { &*merged.as_ptr() };

    // The source zones are drained and their memory now belongs to the
    // merged zone; drop the guards before their backing configuration
    // blocks are recycled below.
    drop(guard2);
    drop(guard1);

    let mut guard = merged_zone.lock.lock();

    // The conf block was over-allocated to a power of two; give the
    // excess back, and account the kept frames as configuration rather
    // than busy allocation.
    let guard_base = guard.base;
    guard.reduce_region(conf_pfn.offset_from(guard_base), conf_frames);
    guard.busy_count -= conf_frames;

    // Splice the table: the merged zone replaces both sources.
    let base = guard.base;
    let count = guard.count;
    table.entries[z1] = Some(ZoneEntry {
        zone: ZoneRef(merged),
        base,
        count,
    });
    for i in (z2 + 1)..table.count {
        table.entries[i - 1] = table.entries[i].take();
    }
    let last = table.count - 1;
    table.entries[last] = None;
    table.count -= 1;

    // Recycle the old configuration blocks.
    return_config_frames(&mut guard, old1.0, old1.1);
    return_config_frames(&mut guard, old2.0, old2.1);

    drop(guard);
    drop(table);
    arch::interrupts_restore(ipl);

    log::debug!(
        "zones {} and {} merged: [{:#x}+{:#x})",
        z1,
        z2,
        base.as_u64(),
        count
    );
    Ok(())
}

/// Merge zones while at least two remain and merging makes progress.
pub fn zone_merge_all() {
    while zone_count() > 1 {
        if zone_merge(0, 1).is_err() {
            break;
        }
    }
}

/// Number of zones in the table.
pub fn zone_count() -> usize {
    let ipl = arch::interrupts_disable();
    let count = ZONES.lock().count;
    arch::interrupts_restore(ipl);
    count
}

/// Snapshot of one zone's accounting, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    pub base: FrameNumber,
    pub count: usize,
    pub free_count: usize,
    pub busy_count: usize,
}

pub fn zone_stats(znum: usize) -> Option<ZoneStats> {
    let ipl = arch::interrupts_disable();
    let stats = find_zone_by_index(znum).map(|zone| {
        let guard = zone.lock.lock();
        ZoneStats {
            base: guard.base,
            count: guard.count,
            free_count: guard.free_count,
            busy_count: guard.busy_count,
        }
    });
    arch::interrupts_restore(ipl);
    stats
}

fn find_zone_by_index(znum: usize) -> Option<&'static Zone> {
    let table = ZONES.lock();
    if znum >= table.count {
        return None;
    }
    let entry = table.entries[znum].as_ref().expect("zone table hole");
    // SAFETY: the entry keeps the zone alive; see ZoneRef.
    Some(unsafe { &*entry.zone.0.as_ptr() })
}

/// Initialize physical memory management: claim the bootstrap regions
/// as zones and withdraw the kernel image and initial task images.
pub fn frame_init() {
    for region in arch::memory_regions().into_iter().flatten() {
        zone_create(region.base, region.count, region.base, ZoneFlags::LOWMEM)
            .expect("bootstrap zone creation failed");
    }

    if let Some(span) = config::kernel_span() {
        frame_mark_unavailable(span.base, span.count);
    }
    for span in config::init_task_spans().into_iter().flatten() {
        frame_mark_unavailable(span.base, span.count);
    }

    log::info!("frame allocator: {} zone(s)", zone_count());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;

    #[test]
    fn alloc_free_round_trip_restores_counts() {
        let _serial = test_support::init();

        let before = zone_stats(0).expect("bootstrap zone exists");
        let pfn = frame_alloc(2, FrameFlags::ATOMIC)
            .expect("order-2 allocation from the bootstrap zone should succeed");

        let during = zone_stats(0).expect("bootstrap zone exists");
        assert_eq!(during.free_count, before.free_count - 4);
        assert_eq!(during.busy_count, before.busy_count + 4);

        frame_free(pfn);
        let after = zone_stats(0).expect("bootstrap zone exists");
        assert_eq!(after, before);
    }

    #[test]
    fn freeing_needs_only_the_starting_pfn() {
        let _serial = test_support::init();

        let a = frame_alloc(3, FrameFlags::ATOMIC).expect("order-3 allocation should succeed");
        let b = frame_alloc(0, FrameFlags::ATOMIC).expect("order-0 allocation should succeed");

        // The order annotation on the first frame recovers the block
        // size; freeing the 8-frame block is a single call.
        frame_free(a);
        frame_free(b);
    }

    #[test]
    fn reference_counting_defers_the_free() {
        let _serial = test_support::init();

        let before = zone_stats(0).expect("bootstrap zone exists");
        let pfn = frame_alloc(0, FrameFlags::ATOMIC).expect("allocation should succeed");

        frame_reference_add(pfn);
        frame_free(pfn);
        // One reference remains; the frame must still be busy.
        let held = zone_stats(0).expect("bootstrap zone exists");
        assert_eq!(held.free_count, before.free_count - 1);

        frame_free(pfn);
        let after = zone_stats(0).expect("bootstrap zone exists");
        assert_eq!(after, before);
    }

    #[test]
    fn parent_annotation_round_trips() {
        let _serial = test_support::init();

        let pfn = frame_alloc(0, FrameFlags::ATOMIC).expect("allocation should succeed");
        let mut hint = 0;
        frame_set_parent(pfn, 0xfeed_beef, &mut hint);
        assert_eq!(frame_get_parent(pfn, &mut hint), 0xfeed_beef);

        frame_set_parent(pfn, 0, &mut hint);
        frame_free(pfn);
    }

    #[test]
    fn oversized_allocation_reports_no_memory() {
        let _serial = test_support::init();

        // Far larger than the simulated machine's memory.
        let result = frame_alloc(20, FrameFlags::ATOMIC | FrameFlags::NO_RECLAIM);
        assert_eq!(result, Err(KernelError::NoMemory { order: 20 }));
    }

    #[test]
    fn standalone_zone_create_and_merge() {
        let _serial = test_support::init();

        // Two adjacent zones carved out of one fresh span.
        let span = crate::arch::host::alloc_test_span(512);
        let mid = span.add(256);

        let z1 = zone_create(span, 256, span, ZoneFlags::LOWMEM)
            .expect("first zone creation should succeed");
        let z2 = zone_create(mid, 256, mid, ZoneFlags::LOWMEM)
            .expect("second zone creation should succeed");
        assert_eq!(z2, z1 + 1, "zones over one span are adjacent in the table");

        let free_before = {
            let s1 = zone_stats(z1).expect("zone 1 exists");
            let s2 = zone_stats(z2).expect("zone 2 exists");
            s1.free_count + s2.free_count
        };

        let count_before = zone_count();
        zone_merge(z1, z2).expect("adjacent zones should merge");
        assert_eq!(zone_count(), count_before - 1);

        let merged = zone_stats(z1).expect("merged zone exists");
        assert_eq!(merged.base, span);
        assert_eq!(merged.count, 512);

        // The merged zone holds a new configuration block but got both
        // old ones back; free space may only have moved by the
        // difference between the two layouts.
        let merged_conf = size_to_frames(zone_conf_size(512));
        let old_conf = 2 * size_to_frames(zone_conf_size(256));
        assert_eq!(
            merged.free_count,
            free_before + old_conf - merged_conf
        );

        // The merged zone still allocates and frees.
        let pfn = frame_alloc(4, FrameFlags::ATOMIC).expect("post-merge allocation succeeds");
        frame_free(pfn);
    }
}
