//! Host backend: an identity-mapped pseudo-machine for tests and
//! coverage runs.
//!
//! Physical memory is a page-aligned allocation leaked from the system
//! allocator, so frame numbers are real addresses shifted by the frame
//! width and `phys_to_virt` is the identity. Interrupt control is a
//! no-op (the host harness is not preemptible in the kernel sense) and
//! context switching is unavailable: tests exercise every path up to the
//! point a thread would genuinely leave the CPU.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::SavedContext;
use crate::mm::{FrameNumber, PhysicalAddress, FRAME_SIZE};

/// Size of the simulated physical memory handed to the frame allocator.
pub(super) const HOST_RAM_FRAMES: usize = 4096; // 16 MiB

pub(super) fn interrupts_disable() -> bool {
    true
}

pub(super) fn interrupts_restore(_was_enabled: bool) {}

pub(super) fn current_cpu_id() -> Option<usize> {
    Some(0)
}

pub(super) fn phys_to_virt(addr: PhysicalAddress) -> *mut u8 {
    addr.as_u64() as *mut u8
}

pub(super) fn virt_to_phys(ptr: *const u8) -> u64 {
    ptr as u64
}

static CYCLES: AtomicU64 = AtomicU64::new(0);

pub(super) fn cycle_count() -> u64 {
    // Monotonic and deterministic; good enough for accounting tests.
    CYCLES.fetch_add(1, Ordering::Relaxed)
}

/// Allocate and register the simulated physical memory. Idempotent.
pub fn init_test_memory() {
    use std::alloc::{alloc_zeroed, Layout};
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let layout = Layout::from_size_align(HOST_RAM_FRAMES * FRAME_SIZE, FRAME_SIZE)
            .expect("host memory layout is valid");
        // SAFETY: the layout has non-zero size. The allocation is leaked
        // on purpose: it becomes the machine's physical memory for the
        // rest of the process lifetime.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "host backing memory allocation failed");

        let base_pfn = FrameNumber::new(base as u64 >> crate::mm::FRAME_WIDTH);
        super::register_memory_region(base_pfn, HOST_RAM_FRAMES);
    });
}

/// Allocate an extra page-aligned span and register nothing; used by
/// tests that construct standalone zones.
pub fn alloc_test_span(frames: usize) -> FrameNumber {
    use std::alloc::{alloc_zeroed, Layout};

    let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE)
        .expect("host span layout is valid");
    // SAFETY: the layout has non-zero size; the span is leaked and
    // serves as stable backing memory for the caller's zone.
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null(), "host span allocation failed");

    FrameNumber::new(base as u64 >> crate::mm::FRAME_WIDTH)
}

pub(super) fn context_create(
    ctx: &mut SavedContext,
    entry: extern "C" fn() -> !,
    stack_base: *mut u8,
    stack_size: usize,
) {
    // Inert on the host: recorded so the fields can be inspected, never
    // switched into.
    ctx.pc = entry as usize;
    ctx.sp = stack_base as usize + stack_size;
}

pub(super) unsafe fn context_switch(_from: *mut SavedContext, _to: *const SavedContext) {
    panic!("context switch is not available on the host target");
}

#[cfg(feature = "fpu-lazy")]
pub(super) fn fpu_clear_owner(_thread: *mut ()) {}
