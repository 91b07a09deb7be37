//! End-to-end exercise of the kernel core on the host backend: boot
//! the subsystems in order, then drive the public interfaces the way
//! the rest of a kernel would.

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use osmium_kernel::adt::btree::Btree;
use osmium_kernel::mm::frame::{self, FrameFlags};
use osmium_kernel::mm::slab::{self, ReclaimFlags, SlabFlags};
use osmium_kernel::proc::{task, thread};
use osmium_kernel::proc::thread::ThreadFlags;
use osmium_kernel::synch::workq;
use osmium_kernel::time;
use osmium_kernel::{arch, bootstrap, config};

static SERIAL: Mutex<()> = Mutex::new(());
static BOOT: Once = Once::new();

/// Boot once, serialize every test.
fn boot() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    BOOT.call_once(|| {
        arch::host::init_test_memory();
        config::set_cpu_count(2);

        bootstrap::kernel_init();
        bootstrap::kernel_init_smp();
        bootstrap::adopt_bootstrap_thread("itest-boot");
    });

    guard
}

#[test]
fn frames_flow_through_the_whole_stack() {
    let _serial = boot();

    // Raw frames...
    let pfn = frame::frame_alloc(1, FrameFlags::ATOMIC).expect("frame allocation works");
    frame::frame_free(pfn);

    // ...slab objects...
    let cache = slab::slab_cache_create("itest-object", 96, 0, None, None, SlabFlags::empty());
    let obj = slab::slab_alloc(cache, FrameFlags::ATOMIC).expect("slab allocation works");
    slab::slab_free(cache, obj);

    // ...and the malloc family on top.
    let buf = slab::malloc(1000, FrameFlags::ATOMIC).expect("malloc works");
    // SAFETY: fresh 1 KiB-class allocation.
    unsafe {
        buf.as_ptr().write_bytes(0x5a, 1000);
        slab::free(buf.as_ptr());
    }

    // Everything cached comes back under pressure.
    slab::reclaim(ReclaimFlags::ALL);
    assert_eq!(cache.cached_objects(), 0);
    slab::slab_cache_destroy(cache);
}

#[test]
fn dictionaries_are_slab_backed_and_ordered() {
    let _serial = boot();

    let mut tree = Box::new(Btree::empty());
    tree.create();

    for key in [9u64, 3, 7, 1, 5, 8, 2, 6, 4, 0] {
        tree.insert(key, key as usize * 2, None);
    }
    assert_eq!(tree.count(), 10);

    // The leaf chain yields the keys in order regardless of insertion
    // order.
    let mut collected = Vec::new();
    let mut leaf = tree.leaf_first();
    while let Some(node) = leaf {
        // SAFETY: live leaf of a tree this test owns.
        unsafe {
            let n = node.as_ref();
            for i in 0..n.key_count() {
                collected.push(n.key_at(i));
            }
        }
        leaf = tree.leaf_right_neighbor(node);
    }
    assert_eq!(collected, (0..10).collect::<Vec<_>>());

    for key in 0..10 {
        assert_eq!(tree.search(key).0, Some(key as usize * 2));
        tree.remove(key, None);
    }
    assert_eq!(tree.count(), 0);
    tree.destroy();
}

fn itest_entry(_arg: usize) {}

#[test]
fn threads_join_the_registry_and_tasks() {
    let _serial = boot();

    let kernel_task = task::kernel_task();
    let threads_before = thread::thread_count();

    let t = thread::thread_create(itest_entry, 42, kernel_task, ThreadFlags::empty(), "itest")
        .expect("thread creation works");
    assert_eq!(thread::thread_count(), threads_before + 1);

    // SAFETY: creation reference held.
    let id = unsafe { t.as_ref().id() };
    let found = thread::thread_try_get(id).expect("thread is registered");
    thread::thread_put(found);

    thread::thread_put(t);
    assert_eq!(thread::thread_count(), threads_before);
}

#[test]
fn sleep_wake_handshake_never_loses_a_wakeup() {
    let _serial = boot();

    let cur = osmium_kernel::sched::current_thread().expect("boot thread is current");
    // SAFETY: the boot thread outlives the test.
    let t = unsafe { cur.as_ref() };

    assert_eq!(
        thread::thread_wait_start(),
        thread::TerminationState::Ok
    );
    thread::thread_wakeup(t);
    assert_eq!(
        thread::thread_wait_finish(time::DEADLINE_NEVER),
        thread::WaitResult::Success,
        "a wakeup issued before wait_finish must not park the thread"
    );
}

#[test]
fn work_queue_absorbs_and_signals_by_load() {
    let _serial = boot();

    static QUEUE: workq::WorkQueue = workq::WorkQueue::new("itest-wq");

    fn work(_item: *mut workq::WorkItem) {}

    // Eight items per active worker before growth; the nominal single
    // worker absorbs exactly that much silently.
    for _ in 0..8 {
        let item = Box::into_raw(Box::new(workq::WorkItem::new()));
        assert!(QUEUE.enqueue(item, work));
    }
    assert_eq!(QUEUE.stats().workers, 1);

    let item = Box::into_raw(Box::new(workq::WorkItem::new()));
    assert!(QUEUE.enqueue(item, work));
    assert_eq!(QUEUE.stats().workers, 2, "overload grew the pool");
    assert_eq!(QUEUE.stats().items, 9);
}

#[test]
fn timeouts_fire_on_the_clock() {
    let _serial = boot();

    static FIRED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    fn on_fire(_arg: usize) {
        FIRED.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    let mut timeout = time::Timeout::new();
    let now = time::current_time();
    // SAFETY: the timeout outlives its registration (fired below).
    unsafe {
        time::timeout::timeout_register_deadline(&mut timeout, now + 10, on_fire, 0);
    }

    time::clock_tick(now + 5);
    assert!(!FIRED.load(std::sync::atomic::Ordering::SeqCst));

    time::clock_tick(now + 10);
    assert!(FIRED.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn zone_accounting_survives_a_mixed_workload() {
    let _serial = boot();

    let stats_before = frame::zone_stats(0).expect("bootstrap zone exists");

    let mut held = Vec::new();
    for order in [0usize, 1, 2, 0, 3] {
        held.push(
            frame::frame_alloc(order, FrameFlags::ATOMIC).expect("mixed allocation works"),
        );
    }
    for pfn in held.drain(..) {
        frame::frame_free(pfn);
    }

    let stats_after = frame::zone_stats(0).expect("bootstrap zone exists");
    assert_eq!(
        stats_after, stats_before,
        "alloc/free pairs return the zone to its prior state"
    );
}

#[test]
fn bootstrap_threads_exist() {
    let _serial = boot();

    // The global work queue's first worker and the non-blocking adder
    // were created at bring-up and are registered.
    assert!(thread::thread_count() >= 2);
    assert_eq!(workq::global_queue().name(), "kworkq");

    // NonNull is just the pointer type threads travel as.
    let _: Option<NonNull<_>> = osmium_kernel::sched::current_thread();
}
