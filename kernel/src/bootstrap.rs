//! Ordered subsystem bring-up.
//!
//! The boot path registers its memory regions and reserved spans with
//! [`crate::arch`] and [`crate::config`], then runs [`kernel_init`] on
//! the boot CPU. Once the CPU count is final it runs
//! [`kernel_init_smp`], which enables the per-CPU slab magazines and
//! brings the global work queue to life.
//!
//! The order is load-bearing: zones must exist before the slab
//! bootstrap caches, the slab before the B+tree node cache, and tasks
//! and threads before anything can run deferred work.

use core::ptr::NonNull;

use crate::proc::{task, thread};
use crate::proc::thread::{Thread, ThreadFlags, ThreadState};
use crate::sched;
use crate::synch::workq;
use crate::{adt, mm};

/// Single-CPU bring-up of the memory and execution substrate.
pub fn kernel_init() {
    mm::frame::frame_init();
    mm::slab::init();
    adt::btree::init();
    task::init();
    thread::init();

    log::info!("kernel core up");
}

/// Finish bring-up once the CPU count is final: per-CPU magazines,
/// work queue tunables, first workers.
pub fn kernel_init_smp() {
    crate::config::set_cpu_active(crate::config::cpu_count());

    mm::slab::enable_cpucache();
    workq::global_init();
    workq::global_worker_init();
}

fn bootstrap_entry(_arg: usize) {
    // The adopted thread never enters through here; it already runs.
}

/// Give the calling CPU an identity in the thread system: create a
/// thread record for the already-running boot flow and adopt it as
/// current. Returns the (permanently referenced) boot thread.
pub fn adopt_bootstrap_thread(name: &str) -> NonNull<Thread> {
    let thread = thread::thread_create(
        bootstrap_entry,
        0,
        task::kernel_task(),
        ThreadFlags::empty(),
        name,
    )
    .expect("boot thread allocation failed");

    // SAFETY: the creation reference is held for the kernel lifetime.
    unsafe { thread.as_ref().set_state(ThreadState::Running) };
    sched::set_current(thread.as_ptr());
    thread
}

/// Host-test harness: one-time bring-up of the whole core over
/// simulated memory, plus the serialization lock every test touching
/// process-wide singletons holds.
#[cfg(all(test, not(target_os = "none")))]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, Once, PoisonError};

    /// Tests share the zone table, the cache registry, the thread
    /// registry and the scheduler queues; they run one at a time.
    static SERIAL: Mutex<()> = Mutex::new(());
    static INIT: Once = Once::new();

    /// Bring the kernel up (once) and take the serialization lock.
    pub fn init() -> MutexGuard<'static, ()> {
        let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        INIT.call_once(|| {
            crate::arch::host::init_test_memory();
            // Two CPUs so the per-CPU magazine arrays and work queue
            // tunables exercise the multi-CPU shapes.
            crate::config::set_cpu_count(2);

            super::kernel_init();
            super::kernel_init_smp();
            super::adopt_bootstrap_thread("test-boot");
        });

        guard
    }
}
