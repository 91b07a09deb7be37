//! Boot-time configuration block.
//!
//! Populated early by the architecture bring-up and read by the rest of
//! the kernel: CPU counts for the slab magazine layer and the work queue
//! tunables, and the kernel image / initial task spans that zone creation
//! must not place configuration data over.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::mm::FrameNumber;

/// Maximum number of initial task images the loader may hand over.
pub const MAX_INIT_TASKS: usize = 4;

/// A reserved physical span: base frame and frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedSpan {
    pub base: FrameNumber,
    pub count: usize,
}

impl ReservedSpan {
    /// True if this span overlaps `[base, base + count)`.
    pub fn overlaps(&self, base: FrameNumber, count: usize) -> bool {
        let a0 = self.base.as_u64();
        let a1 = a0 + self.count as u64;
        let b0 = base.as_u64();
        let b1 = b0 + count as u64;
        a0 < b1 && b0 < a1
    }
}

/// Number of processors in the system. Final once the architecture has
/// enumerated CPUs and before `slab_enable_cpucache()` runs.
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Number of processors already brought online.
static CPU_ACTIVE: AtomicUsize = AtomicUsize::new(1);

/// Kernel image span plus initial task images; consulted when placing
/// zone configuration frames.
static RESERVED: Mutex<ReservedTable> = Mutex::new(ReservedTable {
    kernel: None,
    init_tasks: [None; MAX_INIT_TASKS],
});

struct ReservedTable {
    kernel: Option<ReservedSpan>,
    init_tasks: [Option<ReservedSpan>; MAX_INIT_TASKS],
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn cpu_active() -> usize {
    CPU_ACTIVE.load(Ordering::Acquire)
}

/// Record the final CPU count. Must happen before per-CPU slab magazines
/// are enabled and before the work queue tunables are derived.
pub fn set_cpu_count(count: usize) {
    assert!(count > 0, "a system without processors cannot boot");
    CPU_COUNT.store(count, Ordering::Release);
}

pub fn set_cpu_active(count: usize) {
    CPU_ACTIVE.store(count, Ordering::Release);
}

/// Record the physical span occupied by the kernel image.
pub fn set_kernel_span(base: FrameNumber, count: usize) {
    RESERVED.lock().kernel = Some(ReservedSpan { base, count });
}

/// Record the physical span of one initial task image.
pub fn add_init_task_span(base: FrameNumber, count: usize) {
    let mut table = RESERVED.lock();
    let slot = table
        .init_tasks
        .iter_mut()
        .find(|slot| slot.is_none())
        .expect("too many initial task images");
    *slot = Some(ReservedSpan { base, count });
}

/// The kernel image span, if the boot path recorded one.
pub fn kernel_span() -> Option<ReservedSpan> {
    RESERVED.lock().kernel
}

/// Snapshot of the recorded initial task spans.
pub fn init_task_spans() -> [Option<ReservedSpan>; MAX_INIT_TASKS] {
    RESERVED.lock().init_tasks
}

/// True if `[base, base + count)` overlaps the kernel image or any
/// initial task image.
pub fn overlaps_reserved(base: FrameNumber, count: usize) -> bool {
    let table = RESERVED.lock();

    if let Some(kernel) = table.kernel {
        if kernel.overlaps(base, count) {
            return true;
        }
    }

    table
        .init_tasks
        .iter()
        .flatten()
        .any(|span| span.overlaps(base, count))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn reserved_span_overlap() {
        let span = ReservedSpan {
            base: FrameNumber::new(16),
            count: 8,
        };

        assert!(span.overlaps(FrameNumber::new(20), 1));
        assert!(span.overlaps(FrameNumber::new(8), 16));
        assert!(!span.overlaps(FrameNumber::new(24), 4));
        assert!(!span.overlaps(FrameNumber::new(0), 16));
    }
}
