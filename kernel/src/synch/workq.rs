//! Kernel work queue.
//!
//! A pool of worker threads running queued one-shot functions, sized
//! to the load: enqueueing signals an idle worker, creates a new one,
//! or — when creation could block and every worker is stuck inside a
//! sleeping work function — defers creation to a dedicated
//! non-blocking adder thread. Workers that find themselves surplus
//! exit on their own.
//!
//! The queue lock protects everything except the non-blocking-adder
//! linkage and is ordered after any thread lock. Signal operations
//! chosen under the lock run after it is dropped; `pending_op_cnt`
//! tracks them so [`WorkQueue::stop`] can quiesce.
//!
//! The scheduler drives two hooks: [`after_thread_ran`] when a worker
//! is about to sleep inside its work function (the worker starts
//! counting as blocked and more help may be signalled), and
//! [`before_thread_is_ready`] when it is about to resume (it stops
//! counting as blocked).

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::adt::list::{Link, List};
use crate::config;
use crate::container_of;
use crate::proc::task;
use crate::proc::thread::{self, Thread, ThreadFlags, ThreadState};
use crate::sched;
use crate::synch::condvar::CondVar;
use crate::synch::spinlock::{IrqSpinlock, IrqSpinlockGuard};
use crate::synch::waitq::SleepFlags;

/// Work function: runs on a worker thread and may sleep. The item
/// pointer is the one passed to enqueue; the function may free it.
pub type WorkFunc = fn(*mut WorkItem);

/// One queued unit of work. The storage belongs to the submitter and
/// must stay valid until the function begins execution.
pub struct WorkItem {
    queue_link: Link,
    func: Option<WorkFunc>,
}

impl WorkItem {
    pub const fn new() -> Self {
        Self {
            queue_link: Link::new(),
            func: None,
        }
    }
}

impl Default for WorkItem {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the queue link and function slot are only touched under the
// owning queue's lock (or before the item is enqueued).
unsafe impl Send for WorkItem {}
// SAFETY: same as Send.
unsafe impl Sync for WorkItem {}

/// Queued items per active worker before another worker is wanted.
const MAX_ITEMS_PER_WORKER: usize = 8;

/// Minimum idle workers kept alive.
static MIN_WORKER_CNT: AtomicUsize = AtomicUsize::new(2);
/// Maximum workers in total, blocked and idle included.
static MAX_WORKER_CNT: AtomicUsize = AtomicUsize::new(32);
/// Maximum workers running work functions concurrently.
static MAX_CONCURRENT_WORKERS: AtomicUsize = AtomicUsize::new(2);

/// True until the first workers can exist; enqueues during boot just
/// queue the work.
static BOOTING: AtomicBool = AtomicBool::new(true);

pub fn min_workers() -> usize {
    MIN_WORKER_CNT.load(Ordering::Acquire)
}

pub fn max_workers() -> usize {
    MAX_WORKER_CNT.load(Ordering::Acquire)
}

pub fn max_concurrent_workers() -> usize {
    MAX_CONCURRENT_WORKERS.load(Ordering::Acquire)
}

pub struct WorkQueue {
    lock: IrqSpinlock<WorkQueueInner>,
    /// Activates a worker when work arrives or the queue stops.
    activate_worker: CondVar,
    /// Membership in the non-blocking adder's request list; guarded by
    /// the adder's lock, not ours.
    nb_link: UnsafeCell<Link>,
    name: &'static str,
}

struct WorkQueueInner {
    /// Items awaiting dispatch.
    queue: List,
    /// Worker threads of this queue.
    workers: List,
    item_cnt: usize,
    stopping: bool,

    /// Total workers, counted eagerly at signal time.
    cur_worker_cnt: usize,
    /// Workers parked waiting for work.
    idle_worker_cnt: usize,
    /// Signalled idle workers that have not woken up yet.
    activate_pending: usize,
    /// Workers sleeping inside a work function.
    blocked_worker_cnt: usize,

    /// Deferred signal operations not yet performed.
    pending_op_cnt: usize,
}

// SAFETY: all interior state is behind the queue lock; nb_link is
// guarded by the adder's lock.
unsafe impl Send for WorkQueue {}
// SAFETY: same as Send.
unsafe impl Sync for WorkQueue {}

/// Deferred worker-signalling operation, performed without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalOp {
    /// Wake an idle worker.
    Signal,
    /// Create a worker; may block.
    AddWorker,
    /// Ask the non-blocking adder to create a worker.
    AddWorkerNoblock,
}

/// Snapshot of a queue's load, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkQueueStats {
    pub workers: usize,
    pub active: usize,
    pub blocked: usize,
    pub idle: usize,
    pub items: usize,
    pub stopping: bool,
}

impl WorkQueue {
    /// An initialized but workerless queue. The initial worker count
    /// of one covers the worker [`WorkQueue::init`] adds.
    pub const fn new(name: &'static str) -> Self {
        Self {
            lock: IrqSpinlock::new(WorkQueueInner {
                queue: List::new(),
                workers: List::new(),
                item_cnt: 0,
                stopping: false,
                cur_worker_cnt: 1,
                idle_worker_cnt: 0,
                activate_pending: 0,
                blocked_worker_cnt: 0,
                pending_op_cnt: 0,
            }),
            activate_worker: CondVar::new(),
            nb_link: UnsafeCell::new(Link::new()),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create the queue's first worker. Returns false if the thread
    /// could not be created.
    pub fn init(&'static self) -> bool {
        add_worker(self)
    }

    /// Queue `func(item)` for execution on a worker; may block (in
    /// thread creation or memory allocation). Returns false if the
    /// queue is stopping.
    pub fn enqueue(&'static self, item: *mut WorkItem, func: WorkFunc) -> bool {
        self.enqueue_inner(item, func, true)
    }

    /// Like [`WorkQueue::enqueue`] but guaranteed not to block, at the
    /// cost of the item possibly waiting behind sleeping work items.
    /// Safe to call from interrupt handlers.
    pub fn enqueue_noblock(&'static self, item: *mut WorkItem, func: WorkFunc) -> bool {
        self.enqueue_inner(item, func, false)
    }

    fn enqueue_inner(&'static self, item: *mut WorkItem, func: WorkFunc, can_block: bool) -> bool {
        let mut inner = self.lock.lock();

        if inner.stopping {
            return false;
        }

        // SAFETY: the submitter hands over the item storage until its
        // function runs; the queue lock is held for the splice.
        unsafe {
            (*item).queue_link.init();
            (*item).func = Some(func);
            inner.queue.append(&mut (*item).queue_link);
        }
        inner.item_cnt += 1;

        let op = if BOOTING.load(Ordering::Acquire) {
            // No workers exist yet; the first ones will drain the
            // queue once boot finishes.
            None
        } else {
            self.signal_worker_logic(&mut inner, can_block)
        };
        drop(inner);

        if let Some(op) = op {
            self.perform(op);
        }
        true
    }

    /// Workers running their work function right now: neither idle nor
    /// blocked, excluding those signalled but not yet awake.
    fn active_workers_now(&self, inner: &WorkQueueInner) -> usize {
        debug_assert!(inner.blocked_worker_cnt <= inner.cur_worker_cnt);
        debug_assert!(inner.idle_worker_cnt <= inner.cur_worker_cnt);
        let sleeping = inner.blocked_worker_cnt + inner.idle_worker_cnt;
        debug_assert!(sleeping <= inner.cur_worker_cnt);
        debug_assert!(inner.activate_pending <= inner.idle_worker_cnt);

        inner.cur_worker_cnt - sleeping
    }

    /// Workers running or about to run their work function.
    fn active_workers(&self, inner: &WorkQueueInner) -> usize {
        self.active_workers_now(inner) + inner.activate_pending
    }

    /// Decide how to signal workers for the current load, if at all.
    /// Runs under the queue lock; the returned operation runs after it
    /// is dropped.
    fn signal_worker_logic(
        &'static self,
        inner: &mut WorkQueueInner,
        can_block: bool,
    ) -> Option<SignalOp> {
        let active = self.active_workers(inner);
        let max_load = active * MAX_ITEMS_PER_WORKER;

        if inner.item_cnt <= max_load {
            // Enough workers to chew through the queue.
            return None;
        }

        // Idle workers not yet signalled remain: activate one. The
        // pending count (rather than the idle count) changes so that
        // woken workers can still recognize spurious wake-ups.
        let remaining_idle = inner.idle_worker_cnt - inner.activate_pending;
        if remaining_idle > 0 {
            inner.activate_pending += 1;
            inner.pending_op_cnt += 1;
            return Some(SignalOp::Signal);
        }

        let need_worker =
            active < max_concurrent_workers() && inner.cur_worker_cnt < max_workers();

        if need_worker && can_block {
            // Creation takes a while; count the worker now so a burst
            // of enqueues does not request a whole fleet.
            inner.cur_worker_cnt += 1;
            return Some(SignalOp::AddWorker);
        }

        // Cannot block, yet a worker is needed desperately: everyone
        // is stuck inside a sleeping work function. Hand the queue to
        // the non-blocking adder.
        if need_worker && !can_block && active == 0 {
            debug_assert_eq!(inner.idle_worker_cnt, 0);

            let mut adder = NONBLOCK_ADDER.lock.lock();
            // SAFETY: nb_link is guarded by the adder lock we hold.
            unsafe {
                if !adder.thread.is_null() && !(*self.nb_link.get()).is_linked() {
                    inner.cur_worker_cnt += 1;
                    adder.work_queues.append(self.nb_link.get());
                    return Some(SignalOp::AddWorkerNoblock);
                }
            }
        }

        None
    }

    fn perform(&'static self, op: SignalOp) {
        match op {
            SignalOp::Signal => {
                self.activate_worker.signal();

                let mut inner = self.lock.lock();
                debug_assert!(inner.pending_op_cnt > 0);
                inner.pending_op_cnt -= 1;
            }
            SignalOp::AddWorker => {
                add_worker(self);
            }
            SignalOp::AddWorkerNoblock => {
                NONBLOCK_ADDER.req_cv.signal();
            }
        }
    }

    /// Park until work arrives, counting as idle.
    fn cv_wait<'a>(
        &'a self,
        mut inner: IrqSpinlockGuard<'a, WorkQueueInner>,
    ) -> IrqSpinlockGuard<'a, WorkQueueInner> {
        inner.idle_worker_cnt += 1;

        let cur = sched::current_thread().expect("worker has no thread");
        // SAFETY: the worker thread is live while it runs.
        let t = unsafe { cur.as_ref() };
        t.workq_idling.store(true, Ordering::Release);

        let (mut inner, _) = self
            .activate_worker
            .wait_timeout(inner, 0, SleepFlags::empty());

        t.workq_idling.store(false, Ordering::Release);
        inner.idle_worker_cnt -= 1;
        inner
    }

    /// True if the current load does not justify this worker.
    fn worker_unnecessary(&self, inner: &mut WorkQueueInner) -> bool {
        if inner.queue.is_empty() {
            // No pending work: keep only the configured minimum of
            // idle workers.
            min_workers() <= inner.idle_worker_cnt
        } else {
            // Work exists but too many workers woke up at once; do not
            // fight over the CPUs.
            max_concurrent_workers() < self.active_workers_now(inner)
        }
    }

    /// Wait for and take one work item. Returns false when the worker
    /// should exit: the queue is stopping and drained, or the load no
    /// longer needs this worker.
    fn dequeue(&'static self, pwork: &mut *mut WorkItem) -> bool {
        let mut inner = self.lock.lock();

        if !inner.stopping && self.worker_unnecessary(&mut inner) {
            debug_assert!(inner.cur_worker_cnt > 0);
            inner.cur_worker_cnt -= 1;

            let cur = sched::current_thread().expect("worker has no thread");
            // SAFETY: the worker removes itself; the queue lock guards
            // the list.
            unsafe { Link::remove(&cur.as_ref().workq_link as *const Link as *mut Link) };
            drop(inner);

            // The surplus worker drops its own creation reference.
            thread::thread_detach(cur);
            return false;
        }

        while inner.queue.is_empty() && !inner.stopping {
            inner = self.cv_wait(inner);
            if inner.activate_pending > 0 {
                inner.activate_pending -= 1;
            }
        }

        // Drain remaining items even when stopping.
        // SAFETY: queue members are live, submitter-owned items.
        if let Some(link) = unsafe { inner.queue.pop_first() } {
            // SAFETY: recovered from its queue link.
            *pwork = unsafe { container_of!(link, WorkItem, queue_link) };
            inner.item_cnt -= 1;
            true
        } else {
            debug_assert!(inner.stopping);
            inner.cur_worker_cnt -= 1;
            false
        }
    }

    /// Shut the queue down: refuse new items, run the backlog, join
    /// every worker and wait for deferred operations to quiesce. May
    /// only be called once.
    pub fn stop(&'static self) {
        {
            let mut inner = self.lock.lock();
            assert!(!inner.stopping, "work queue stopped twice");
            inner.stopping = true;
        }
        // Lock ordering: broadcast outside the queue lock.
        self.activate_worker.broadcast();

        // Join workers with the lock dropped around each join.
        loop {
            let worker = {
                let mut inner = self.lock.lock();
                match inner.workers.first() {
                    Some(link) => {
                        // SAFETY: worker-list members are live worker
                        // threads; the queue lock is held.
                        unsafe {
                            Link::remove(link);
                            Some(NonNull::new_unchecked(container_of!(
                                link,
                                Thread,
                                workq_link
                            )))
                        }
                    }
                    None => None,
                }
            };

            match worker {
                Some(worker) => {
                    let _ = thread::thread_join(worker);
                }
                None => break,
            }
        }

        // Deferred add/signal operations must finish before teardown.
        loop {
            let quiesced = {
                let inner = self.lock.lock();
                inner.cur_worker_cnt == 0 && inner.pending_op_cnt == 0
            };
            if quiesced {
                break;
            }
            sched::scheduler_enter(ThreadState::Running);
        }

        log::debug!("work queue '{}' stopped", self.name);
    }

    pub fn stats(&self) -> WorkQueueStats {
        let inner = self.lock.lock();
        WorkQueueStats {
            workers: inner.cur_worker_cnt,
            active: self.active_workers(&inner),
            blocked: inner.blocked_worker_cnt,
            idle: inner.idle_worker_cnt,
            items: inner.item_cnt,
            stopping: inner.stopping,
        }
    }

    /// Test scaffolding: a queue that never created its initial worker
    /// has nothing for `stop` to join.
    #[cfg(all(test, not(target_os = "none")))]
    fn forget_initial_worker(&self) {
        self.lock.lock().cur_worker_cnt = 0;
    }
}

/// Create and start one worker thread. The eager count increment
/// happened at signal time; creation failure rolls it back.
fn add_worker(wq: &'static WorkQueue) -> bool {
    let thread = thread::thread_create(
        worker_thread,
        wq as *const WorkQueue as usize,
        task::kernel_task(),
        ThreadFlags::empty(),
        wq.name,
    );

    let Some(thread) = thread else {
        let mut inner = wq.lock.lock();
        debug_assert!(inner.cur_worker_cnt > 0);
        inner.cur_worker_cnt -= 1;
        return false;
    };

    // SAFETY: we hold the creation reference.
    let t = unsafe { thread.as_ref() };

    let success;
    {
        // Lock ordering: thread lock before queue lock.
        let _thread_lock = t.lock.lock();
        let mut inner = wq.lock.lock();

        if !inner.stopping {
            success = true;
            t.workq.store(
                wq as *const WorkQueue as *mut WorkQueue,
                Ordering::Release,
            );
            t.workq_blocked.store(false, Ordering::Relaxed);
            t.workq_idling.store(false, Ordering::Relaxed);
            // SAFETY: workq_link is fresh; the queue lock is held.
            unsafe { inner.workers.append(&t.workq_link as *const Link as *mut Link) };
        } else {
            // The queue began stopping while the thread was being
            // created. It must not join the queue; send it straight to
            // exit.
            success = false;
            debug_assert!(inner.cur_worker_cnt > 0);
            inner.cur_worker_cnt -= 1;
        }
    }

    if !success {
        thread::thread_interrupt(t);
    }
    thread::thread_start(t);

    success
}

/// Worker main loop: take items, run them.
fn worker_thread(arg: usize) {
    let cur = sched::current_thread().expect("worker has no thread");

    // Interrupted before doing anything: the queue stopped while this
    // worker was being created. Leave without touching it.
    // SAFETY: the worker thread is live while it runs.
    if unsafe { cur.as_ref().interrupted() } {
        thread::thread_detach(cur);
        return;
    }

    // SAFETY: the queue outlives its workers ('static).
    let wq: &'static WorkQueue = unsafe { &*(arg as *const WorkQueue) };

    let mut item: *mut WorkItem = ptr::null_mut();
    while wq.dequeue(&mut item) {
        // Copy out the function first: it owns the item and may free
        // it.
        // SAFETY: dequeue returned a live, queued item.
        let func = unsafe { (*item).func.expect("queued item has no function") };
        func(item);
    }
}

/*
 * Non-blocking adder
 */

/// The fallback worker-creator for queues that must not block: a
/// daemon thread that performs `add_worker` on their behalf.
struct NonblockAdder {
    lock: IrqSpinlock<NonblockAdderInner>,
    req_cv: CondVar,
}

struct NonblockAdderInner {
    work_queues: List,
    thread: *mut Thread,
}

// SAFETY: interior state is behind the adder lock.
unsafe impl Send for NonblockAdder {}
// SAFETY: same as Send.
unsafe impl Sync for NonblockAdder {}

static NONBLOCK_ADDER: NonblockAdder = NonblockAdder {
    lock: IrqSpinlock::new(NonblockAdderInner {
        work_queues: List::new(),
        thread: ptr::null_mut(),
    }),
    req_cv: CondVar::new(),
};

fn dequeue_add_req() -> Option<&'static WorkQueue> {
    let mut guard = NONBLOCK_ADDER.lock.lock();

    loop {
        // SAFETY: list members are live queues awaiting a worker; the
        // adder lock is held.
        if let Some(link) = unsafe { guard.work_queues.pop_first() } {
            // SAFETY: recovered from its nb_link.
            return Some(unsafe { &*container_of!(link, WorkQueue, nb_link) });
        }

        let (g, result) = NONBLOCK_ADDER
            .req_cv
            .wait_timeout(guard, 0, SleepFlags::INTERRUPTIBLE);
        guard = g;
        if result == Err(crate::error::KernelError::Interrupted) {
            return None;
        }
    }
}

fn nonblock_adder_thread(_arg: usize) {
    while let Some(wq) = dequeue_add_req() {
        add_worker(wq);
    }
}

fn nonblock_init() {
    let thread = thread::thread_create(
        nonblock_adder_thread,
        0,
        task::kernel_task(),
        ThreadFlags::empty(),
        "kworkq-nb",
    );

    match thread {
        Some(t) => {
            NONBLOCK_ADDER.lock.lock().thread = t.as_ptr();
            // SAFETY: creation reference held; it stays with the
            // daemon for the kernel lifetime.
            thread::thread_start(unsafe { t.as_ref() });
        }
        None => {
            // Boot anyway; sleeping work may stall queues that cannot
            // block.
            log::warn!("failed to create kworkq-nb");
        }
    }
}

/*
 * Scheduler integration
 */

/// Called by the scheduler when the current thread is about to sleep.
/// A worker sleeping inside its work function starts counting as
/// blocked, which may justify activating another worker.
pub fn after_thread_ran() {
    let Some(cur) = sched::current_thread() else {
        return;
    };
    // SAFETY: the current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    let wq = t.workq.load(Ordering::Acquire);
    if wq.is_null() {
        return;
    }
    // SAFETY: work queues are 'static.
    let wq: &'static WorkQueue = unsafe { &*wq };

    let _thread_lock = t.lock.lock();
    if t.state() == ThreadState::Sleeping && !t.workq_idling.load(Ordering::Acquire) {
        debug_assert!(!t.workq_blocked.load(Ordering::Acquire));
        t.workq_blocked.store(true, Ordering::Release);

        let mut inner = wq.lock.lock();
        inner.blocked_worker_cnt += 1;

        // Never block here: we are inside the scheduler.
        let op = wq.signal_worker_logic(&mut inner, false);
        drop(inner);

        if let Some(op) = op {
            debug_assert!(matches!(
                op,
                SignalOp::Signal | SignalOp::AddWorkerNoblock
            ));
            wq.perform(op);
        }
    }
}

/// Called (under the thread lock) right before a thread is re-queued:
/// a blocked worker about to resume stops counting as blocked.
pub fn before_thread_is_ready(thread: &Thread) {
    let wq = thread.workq.load(Ordering::Acquire);
    if wq.is_null() || !thread.workq_blocked.load(Ordering::Acquire) {
        return;
    }

    debug_assert!(!thread.workq_idling.load(Ordering::Acquire));
    thread.workq_blocked.store(false, Ordering::Release);

    // SAFETY: work queues are 'static.
    let wq: &'static WorkQueue = unsafe { &*wq };
    let mut inner = wq.lock.lock();
    debug_assert!(inner.blocked_worker_cnt > 0);
    inner.blocked_worker_cnt -= 1;
}

/*
 * Global system queue
 */

static GLOBAL_WORKQ: WorkQueue = WorkQueue::new("kworkq");

pub fn global_queue() -> &'static WorkQueue {
    &GLOBAL_WORKQ
}

/// Derive the pool tunables from the final CPU count. Runs before any
/// worker exists.
pub fn global_init() {
    let cpus = config::cpu_count();

    // Idle workers on a quarter of the CPUs, at least two; allow eight
    // sleeping work items per CPU; full concurrency of one active
    // worker per CPU.
    MIN_WORKER_CNT.store(2usize.max(cpus / 4), Ordering::Release);
    MAX_WORKER_CNT.store(32usize.max(8 * cpus), Ordering::Release);
    MAX_CONCURRENT_WORKERS.store(2usize.max(cpus), Ordering::Release);
}

/// Leave boot mode and create the first worker of the system queue
/// plus the non-blocking adder.
pub fn global_worker_init() {
    BOOTING.store(false, Ordering::Release);

    nonblock_init();

    assert!(
        GLOBAL_WORKQ.init(),
        "could not create a single global work queue worker"
    );
}

pub fn global_enqueue(item: *mut WorkItem, func: WorkFunc) -> bool {
    GLOBAL_WORKQ.enqueue(item, func)
}

pub fn global_enqueue_noblock(item: *mut WorkItem, func: WorkFunc) -> bool {
    GLOBAL_WORKQ.enqueue_noblock(item, func)
}

/// Stop the system queue and wait for its backlog.
pub fn global_stop() {
    GLOBAL_WORKQ.stop();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;
    use std::boxed::Box;

    fn nop_work(_item: *mut WorkItem) {}

    fn leak_item() -> *mut WorkItem {
        Box::into_raw(Box::new(WorkItem::new()))
    }

    #[test]
    fn tunables_follow_the_cpu_count() {
        let _serial = test_support::init();

        // The host bootstrap declares two CPUs.
        assert_eq!(min_workers(), 2);
        assert_eq!(max_workers(), 32);
        assert_eq!(max_concurrent_workers(), 2);
    }

    #[test]
    fn enqueue_grows_the_pool_under_load() {
        let _serial = test_support::init();

        static QUEUE: WorkQueue = WorkQueue::new("utest-wq");

        // One (nominal) worker absorbs up to eight items without any
        // signalling.
        for _ in 0..MAX_ITEMS_PER_WORKER {
            assert!(QUEUE.enqueue(leak_item(), nop_work));
        }
        let stats = QUEUE.stats();
        assert_eq!(stats.items, MAX_ITEMS_PER_WORKER);
        assert_eq!(stats.workers, 1);

        // The ninth item overloads it: a second worker is created.
        assert!(QUEUE.enqueue(leak_item(), nop_work));
        let stats = QUEUE.stats();
        assert_eq!(stats.items, MAX_ITEMS_PER_WORKER + 1);
        assert_eq!(stats.workers, 2);

        // Concurrency is capped: further overload (two workers cover
        // sixteen items) does not create a third worker, because
        // max_concurrent is two on this configuration.
        for _ in 0..8 {
            assert!(QUEUE.enqueue(leak_item(), nop_work));
        }
        let stats = QUEUE.stats();
        assert_eq!(stats.items, 17);
        assert_eq!(stats.workers, 2);
    }

    #[test]
    fn stop_refuses_new_items() {
        let _serial = test_support::init();

        static QUEUE: WorkQueue = WorkQueue::new("utest-stopq");
        QUEUE.forget_initial_worker();

        QUEUE.stop();
        assert!(QUEUE.stats().stopping);
        assert!(!QUEUE.enqueue(leak_item(), nop_work));
        assert!(!QUEUE.enqueue_noblock(leak_item(), nop_work));
    }

    #[test]
    fn signal_logic_prefers_idle_workers() {
        let _serial = test_support::init();

        static QUEUE: WorkQueue = WorkQueue::new("utest-idleq");

        {
            // Fake one idle worker among two, with a backlog that
            // overloads the single active one.
            let mut inner = QUEUE.lock.lock();
            inner.cur_worker_cnt = 2;
            inner.idle_worker_cnt = 1;
            inner.item_cnt = MAX_ITEMS_PER_WORKER + 1;

            let op = QUEUE.signal_worker_logic(&mut inner, true);
            assert_eq!(op, Some(SignalOp::Signal));
            assert_eq!(inner.activate_pending, 1);
            assert_eq!(inner.pending_op_cnt, 1);

            // With the activation pending, the same load asks for
            // nothing more.
            let op = QUEUE.signal_worker_logic(&mut inner, true);
            assert_eq!(op, None);
        }
    }

    #[test]
    fn signal_logic_defers_to_the_adder_when_blocked() {
        let _serial = test_support::init();

        static QUEUE: WorkQueue = WorkQueue::new("utest-nbq");

        {
            // Every worker is blocked inside its work function and the
            // caller must not block: the queue is handed to the
            // non-blocking adder.
            let mut inner = QUEUE.lock.lock();
            inner.cur_worker_cnt = 1;
            inner.blocked_worker_cnt = 1;
            inner.item_cnt = 1;

            let op = QUEUE.signal_worker_logic(&mut inner, false);
            assert_eq!(op, Some(SignalOp::AddWorkerNoblock));
            assert_eq!(inner.cur_worker_cnt, 2, "worker counted eagerly");
            // SAFETY: nb_link inspection mirrors the adder's view; the
            // queue was just linked onto its request list.
            unsafe {
                assert!((*QUEUE.nb_link.get()).is_linked());
            }
        }
    }
}
