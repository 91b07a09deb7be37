//! Platform hook layer.
//!
//! Everything the core needs from the machine goes through this module:
//! interrupt control, CPU identity, physical-to-virtual translation,
//! bootstrap memory regions, the saved-context primitives and the cycle
//! counter. Two backends exist: the bare-metal x86_64 backend and a host
//! backend used for coverage and unit tests, which models an
//! identity-mapped machine with a single CPU and no preemption.

use spin::Mutex;

use crate::mm::{FrameNumber, PhysicalAddress};

#[cfg(not(target_os = "none"))]
pub mod host;
#[cfg(not(target_os = "none"))]
use host as imp;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use self::x86_64 as imp;

/// Upper bound on processors the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 32;

/// Upper bound on bootstrap memory regions.
pub const MAX_REGIONS: usize = 8;

/// Saved interrupt priority level, returned by [`interrupts_disable`]
/// and consumed by [`interrupts_restore`].
#[derive(Debug)]
#[must_use = "dropping an ipl token leaves interrupts disabled"]
pub struct Ipl(bool);

/// A physical memory region handed over at boot.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: FrameNumber,
    pub count: usize,
}

static REGIONS: Mutex<[Option<MemoryRegion>; MAX_REGIONS]> = Mutex::new([None; MAX_REGIONS]);

/// Record a physical memory region for the frame allocator to claim.
/// Called by the boot path before `frame_init()`.
pub fn register_memory_region(base: FrameNumber, count: usize) {
    let mut regions = REGIONS.lock();
    let slot = regions
        .iter_mut()
        .find(|slot| slot.is_none())
        .expect("too many bootstrap memory regions");
    *slot = Some(MemoryRegion { base, count });
}

/// Snapshot of the registered bootstrap regions.
pub fn memory_regions() -> [Option<MemoryRegion>; MAX_REGIONS] {
    *REGIONS.lock()
}

/// Disable local interrupts, returning the previous level.
#[inline]
pub fn interrupts_disable() -> Ipl {
    Ipl(imp::interrupts_disable())
}

/// Restore the interrupt level saved by [`interrupts_disable`].
#[inline]
pub fn interrupts_restore(ipl: Ipl) {
    imp::interrupts_restore(ipl.0);
}

/// Identity of the executing CPU, or `None` very early in boot.
#[inline]
pub fn current_cpu_id() -> Option<usize> {
    imp::current_cpu_id()
}

/// Translate a physical address into a kernel-accessible pointer.
/// Valid for any address inside a registered memory region.
#[inline]
pub fn phys_to_virt(addr: PhysicalAddress) -> *mut u8 {
    imp::phys_to_virt(addr)
}

/// Inverse of [`phys_to_virt`] for pointers inside the linear map.
#[inline]
pub fn virt_to_phys(ptr: *const u8) -> u64 {
    imp::virt_to_phys(ptr)
}

/// Free-running cycle counter for accounting.
#[inline]
pub fn cycle_count() -> u64 {
    imp::cycle_count()
}

/// Saved execution context of a descheduled thread.
#[repr(C)]
#[derive(Debug)]
pub struct SavedContext {
    pc: usize,
    sp: usize,
}

impl SavedContext {
    pub const fn empty() -> Self {
        Self { pc: 0, sp: 0 }
    }
}

/// Prepare `ctx` so that the first switch into it enters `entry` on the
/// given stack.
pub fn context_create(
    ctx: &mut SavedContext,
    entry: extern "C" fn() -> !,
    stack_base: *mut u8,
    stack_size: usize,
) {
    imp::context_create(ctx, entry, stack_base, stack_size);
}

/// Switch from the context saved into `from` to the context in `to`.
/// Returns only when something later switches back into `from`.
///
/// # Safety
///
/// Both pointers must reference valid `SavedContext` storage; `to` must
/// have been prepared by [`context_create`] or a previous switch, and the
/// stack it references must be live. Interrupts must be disabled.
pub unsafe fn context_switch(from: *mut SavedContext, to: *const SavedContext) {
    // SAFETY: contract forwarded to the backend verbatim.
    unsafe { imp::context_switch(from, to) }
}

/// Clear the lazy-FPU owner if it is the given thread. No-op unless the
/// `fpu-lazy` build is selected and the backend tracks FPU ownership.
#[cfg(feature = "fpu-lazy")]
pub fn fpu_clear_owner(thread: *mut ()) {
    imp::fpu_clear_owner(thread);
}
