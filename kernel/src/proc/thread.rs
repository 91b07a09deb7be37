//! Thread management.
//!
//! Threads are slab-allocated; the cache constructor pre-allocates each
//! thread's kernel stack from low memory (stacks must stay inside the
//! identity mapping) so creation on the hot path cannot fail on
//! anything but true memory exhaustion. The global registry is an
//! id-keyed B+tree holding weak references: a pointer taken from it
//! must be strengthened with [`thread_try_ref`] before the registry
//! lock is released.
//!
//! The sleep/wake handshake lives here. Each thread has an atomic
//! `sleep_state` in {Initial, Asleep, Woke}, independent of the
//! scheduling state:
//!
//! - [`thread_wait_start`] resets it to Initial (an acquire-release
//!   exchange, so a reset wakeup's memory effects stay visible).
//! - The caller publishes itself somewhere a waker can find it, drops
//!   its locks and calls [`thread_wait_finish`].
//! - [`thread_wakeup`] exchanges in Woke; the one caller that observes
//!   Asleep re-queues the sleeper.
//! - The scheduler's deschedule path compare-exchanges
//!   Initial -> Asleep; failure means a wakeup already arrived and the
//!   thread keeps running.
//!
//! The handshake allows at most one sleep per wait_start, tolerates any
//! number of concurrent wakers, and cannot lose a wakeup issued between
//! wait_start and the deschedule.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::adt::btree::Btree;
use crate::adt::list::Link;
use crate::arch::{self, SavedContext};
use crate::error::KernelError;
use crate::mm::frame::{frame_alloc, frame_free, FrameFlags};
use crate::mm::slab::{self, SlabCache, SlabFlags};
use crate::mm::{frame_to_ptr, order_to_size, ptr_to_frame};
use crate::proc::task::{self, KName, Task};
use crate::sched;
use crate::synch::spinlock::IrqSpinlock;
use crate::synch::waitq::{SleepFlags, WaitQueue};
use crate::synch::workq::WorkQueue;
use crate::time::DEADLINE_NEVER;

/// Kernel stack: 2^1 frames (8 KiB).
pub const STACK_ORDER: usize = 1;
pub const STACK_SIZE: usize = order_to_size(STACK_ORDER);

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread executes in userspace after kernel setup.
        const USPACE = 1 << 0;
        /// Do not attach to the task and registry at creation; the
        /// creator attaches explicitly later.
        const NOATTACH = 1 << 1;
        /// Keep the thread's cycles out of task accounting.
        const UNCOUNTED = 1 << 2;
    }
}

/// Scheduling state.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Invalid = 0,
    /// Created, not yet handed to the scheduler.
    Entering = 1,
    /// On a ready queue.
    Ready = 2,
    Running = 3,
    Sleeping = 4,
    /// Leaving the system on its own stack.
    Exiting = 5,
    /// Exited, awaiting deferred destruction.
    Lingering = 6,
}

impl ThreadState {
    fn from_usize(value: usize) -> Self {
        match value {
            1 => ThreadState::Entering,
            2 => ThreadState::Ready,
            3 => ThreadState::Running,
            4 => ThreadState::Sleeping,
            5 => ThreadState::Exiting,
            6 => ThreadState::Lingering,
            _ => ThreadState::Invalid,
        }
    }
}

/// Sleep-state handshake values.
const SLEEP_INITIAL: usize = 0;
const SLEEP_ASLEEP: usize = 1;
const SLEEP_WOKE: usize = 2;

/// Result of [`thread_wait_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    /// Proceed with the sleep.
    Ok,
    /// The thread was interrupted; sleeping will delay termination.
    Terminating,
}

/// Result of [`thread_wait_finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Timeout,
}

/// CPU binding sentinel: not bound.
const CPU_NONE: usize = usize::MAX;

pub struct Thread {
    /// Ready-queue / reaper-list membership (owned by the scheduler).
    pub(crate) rq_link: Link,
    /// Wait-queue membership (owned by the waitq the thread sleeps on).
    pub(crate) wq_link: Link,
    /// Task thread-list membership (owned by the task lock).
    pub(crate) th_link: Link,
    /// Work-queue worker-list membership (owned by the workq lock).
    pub(crate) workq_link: Link,

    /// Serializes the worker-state transitions against the scheduler
    /// hooks; ordered before the work queue lock.
    pub(crate) lock: IrqSpinlock<()>,

    kstack: *mut u8,
    refcount: AtomicUsize,
    tid: ThreadId,
    name: spin::Mutex<KName>,

    /// Entry point and argument; set once before the thread starts.
    func: UnsafeCell<Option<fn(usize)>>,
    arg: UnsafeCell<usize>,
    pub(crate) saved_context: UnsafeCell<SavedContext>,

    ucycles: AtomicU64,
    kcycles: AtomicU64,
    last_cycle: AtomicU64,
    uncounted: AtomicBool,
    uspace: AtomicBool,

    cpu: AtomicUsize,
    nomigrate: AtomicUsize,

    state: AtomicUsize,
    sleep_state: AtomicUsize,
    /// The waitq this thread is currently published on, for
    /// diagnostics.
    pub(crate) sleep_queue: AtomicPtr<WaitQueue>,
    interrupted: AtomicBool,
    /// Threads waiting for this one to exit.
    pub(crate) join_wq: WaitQueue,

    task: AtomicPtr<Task>,
    attached: AtomicBool,

    /// Work-queue worker bookkeeping (see synch::workq).
    pub(crate) workq: AtomicPtr<WorkQueue>,
    pub(crate) workq_blocked: AtomicBool,
    pub(crate) workq_idling: AtomicBool,
}

// SAFETY: list links are guarded by their owning locks, the context by
// the scheduler's ownership discipline, func/arg are written once
// before the thread becomes visible; everything else is atomic.
unsafe impl Send for Thread {}
// SAFETY: same as Send.
unsafe impl Sync for Thread {}

impl Thread {
    /// Inert thread object; the slab constructor writes this into
    /// fresh storage before attaching a stack.
    const fn empty() -> Self {
        Self {
            rq_link: Link::new(),
            wq_link: Link::new(),
            th_link: Link::new(),
            workq_link: Link::new(),
            lock: IrqSpinlock::new(()),
            kstack: ptr::null_mut(),
            refcount: AtomicUsize::new(0),
            tid: ThreadId(0),
            name: spin::Mutex::new(KName::empty()),
            func: UnsafeCell::new(None),
            arg: UnsafeCell::new(0),
            saved_context: UnsafeCell::new(SavedContext::empty()),
            ucycles: AtomicU64::new(0),
            kcycles: AtomicU64::new(0),
            last_cycle: AtomicU64::new(0),
            uncounted: AtomicBool::new(false),
            uspace: AtomicBool::new(false),
            cpu: AtomicUsize::new(CPU_NONE),
            nomigrate: AtomicUsize::new(0),
            state: AtomicUsize::new(ThreadState::Invalid as usize),
            sleep_state: AtomicUsize::new(SLEEP_INITIAL),
            sleep_queue: AtomicPtr::new(ptr::null_mut()),
            interrupted: AtomicBool::new(false),
            join_wq: WaitQueue::new(),
            task: AtomicPtr::new(ptr::null_mut()),
            attached: AtomicBool::new(false),
            workq: AtomicPtr::new(ptr::null_mut()),
            workq_blocked: AtomicBool::new(false),
            workq_idling: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.tid
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_usize(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as usize, Ordering::Release);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn is_uspace(&self) -> bool {
        self.uspace.load(Ordering::Acquire)
    }

    pub fn with_name<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(self.name.lock().as_str())
    }

    pub fn task(&self) -> Option<NonNull<Task>> {
        NonNull::new(self.task.load(Ordering::Acquire))
    }

    /// The thread's entry point and argument; read by the first
    /// dispatch.
    pub(crate) fn entry(&self) -> (Option<fn(usize)>, usize) {
        // SAFETY: written once during creation, before the thread is
        // visible to the scheduler.
        unsafe { (*self.func.get(), *self.arg.get()) }
    }

    /// Scheduler half of the handshake: Initial -> Asleep. Fails when
    /// a wakeup already flipped the state, in which case the thread
    /// must not sleep.
    pub(crate) fn sleep_state_cas_initial_to_asleep(&self) -> Result<(), ()> {
        self.sleep_state
            .compare_exchange(
                SLEEP_INITIAL,
                SLEEP_ASLEEP,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| ())
    }

    #[cfg(all(test, not(target_os = "none")))]
    pub(crate) fn sleep_state_raw(&self) -> usize {
        self.sleep_state.load(Ordering::Acquire)
    }

    #[cfg(all(test, not(target_os = "none")))]
    pub(crate) fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn references(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Slab constructor: reset the object and attach a kernel stack.
///
/// The stack is allocated from low memory so that it stays inside the
/// identity mapping whatever context the thread later runs in.
fn thr_constructor(obj: *mut u8, kmflags: FrameFlags) -> Result<(), KernelError> {
    let thread = obj as *mut Thread;
    // SAFETY: the slab layer hands us exclusive, untyped storage of
    // Thread size.
    unsafe { thread.write(Thread::empty()) };

    let mut kmflags = kmflags | FrameFlags::LOWMEM;
    kmflags.remove(FrameFlags::HIGHMEM);

    let stack_pfn = frame_alloc(STACK_ORDER, kmflags)?;
    // SAFETY: object written above; we still own it exclusively.
    unsafe { (*thread).kstack = frame_to_ptr(stack_pfn) };
    Ok(())
}

/// Slab destructor: release the kernel stack.
fn thr_destructor(obj: *mut u8) -> usize {
    let thread = obj as *mut Thread;
    // SAFETY: destructor runs on dead objects owned by the slab layer.
    unsafe { frame_free(ptr_to_frame((*thread).kstack)) };
    1 << STACK_ORDER
}

static THREAD_CACHE: AtomicPtr<SlabCache> = AtomicPtr::new(ptr::null_mut());

fn thread_cache() -> &'static SlabCache {
    let cache = THREAD_CACHE.load(Ordering::Acquire);
    assert!(!cache.is_null(), "thread subsystem used before thread::init()");
    // SAFETY: published once at init and never freed.
    unsafe { &*cache }
}

/// Global dictionary of threads keyed by id.
///
/// Weak references only: a pointer found here must be strengthened via
/// [`thread_try_ref`] before `THREADS` is unlocked.
static THREADS: IrqSpinlock<Btree> = IrqSpinlock::new(Btree::empty());

static TID_LOCK: IrqSpinlock<u64> = IrqSpinlock::new(0);

/// Initialize kernel thread support.
pub fn init() {
    let cache = slab::slab_cache_create(
        "thread",
        core::mem::size_of::<Thread>(),
        core::mem::align_of::<Thread>(),
        Some(thr_constructor),
        Some(thr_destructor),
        SlabFlags::empty(),
    );
    THREAD_CACHE.store(cache as *const SlabCache as *mut SlabCache, Ordering::Release);

    THREADS.lock().create();
}

/// First dispatch of every thread: run the entry function, then exit.
pub(crate) extern "C" fn thread_main_func() -> ! {
    let cur = sched::current_thread().expect("thread dispatched without being current");
    // SAFETY: current thread is live while it runs.
    let (func, arg) = unsafe { cur.as_ref().entry() };

    if let Some(func) = func {
        func(arg);
    }

    thread_exit();
}

/// Create a new thread.
///
/// The caller receives the creation reference; pair it with a later
/// [`thread_join_timeout`] or [`thread_detach`]. Unless `NOATTACH` is
/// given the thread is attached to `task` and registered immediately.
pub fn thread_create(
    func: fn(usize),
    arg: usize,
    task: &Task,
    flags: ThreadFlags,
    name: &str,
) -> Option<NonNull<Thread>> {
    let obj = slab::slab_alloc(thread_cache(), FrameFlags::ATOMIC)?;
    let thread = obj.as_ptr() as *mut Thread;

    let tid = {
        let mut last = TID_LOCK.lock();
        *last += 1;
        ThreadId(*last)
    };

    // SAFETY: the constructor produced a fresh Thread with a stack; we
    // own it exclusively until attach publishes it.
    unsafe {
        let t = &mut *thread;
        t.refcount = AtomicUsize::new(1);
        t.tid = tid;
        t.name.lock().set(name);
        *t.func.get() = Some(func);
        *t.arg.get() = arg;

        arch::context_create(
            &mut *t.saved_context.get(),
            thread_main_func,
            t.kstack,
            STACK_SIZE,
        );

        t.last_cycle.store(arch::cycle_count(), Ordering::Relaxed);
        t.uncounted
            .store(flags.contains(ThreadFlags::UNCOUNTED), Ordering::Relaxed);
        t.uspace
            .store(flags.contains(ThreadFlags::USPACE), Ordering::Relaxed);
        t.set_state(ThreadState::Entering);
        t.task.store(
            task as *const Task as *mut Task,
            Ordering::Release,
        );
    }

    if !flags.contains(ThreadFlags::NOATTACH) {
        // SAFETY: just created, fully initialized.
        unsafe { thread_attach(&*thread, task) };
    }

    NonNull::new(thread)
}

/// Make the thread visible: hold the task, join its thread list and
/// enter the global dictionary.
pub fn thread_attach(thread: &Thread, task: &Task) {
    {
        let mut inner = task.inner().lock();
        task::task_hold(task);

        if thread.is_uspace() {
            task.lifecount_inc();
        }

        // SAFETY: th_link is unlinked (fresh thread); the task lock is
        // held.
        unsafe {
            inner
                .threads
                .append(&thread.th_link as *const Link as *mut Link)
        };
    }

    THREADS
        .lock()
        .insert(thread.id().0, thread as *const Thread as usize, None);

    thread.attached.store(true, Ordering::Release);
}

/// Hand a started thread to the scheduler.
pub fn thread_start(thread: &Thread) {
    assert_eq!(
        thread.state(),
        ThreadState::Entering,
        "starting a thread twice"
    );
    thread_ref(thread);
    sched::thread_requeue(thread as *const Thread as *mut Thread);
}

/// Add a strong reference.
pub fn thread_ref(thread: &Thread) -> &Thread {
    let old = thread.refcount.fetch_add(1, Ordering::AcqRel);
    debug_assert!(old > 0, "reviving a dead thread");
    thread
}

/// Try to add a strong reference to a thread found through a weak one
/// (the registry). Fails if the thread is already being destroyed.
pub fn thread_try_ref(thread: &Thread) -> bool {
    let mut refs = thread.refcount.load(Ordering::Acquire);
    loop {
        if refs == 0 {
            return false;
        }
        match thread.refcount.compare_exchange_weak(
            refs,
            refs + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => refs = actual,
        }
    }
}

/// Drop a strong reference; the last one destroys the thread.
pub fn thread_put(thread: NonNull<Thread>) {
    // SAFETY: the caller owns a strong reference.
    let refs = unsafe { thread.as_ref().refcount.fetch_sub(1, Ordering::AcqRel) };
    if refs == 1 {
        thread_destroy(thread);
    }
}

/// Alias for dropping the creation reference without joining.
pub fn thread_detach(thread: NonNull<Thread>) {
    thread_put(thread);
}

/// Destroy a thread whose last reference was dropped: unregister,
/// detach from the task, fold in the accounting and return the object
/// to the slab.
fn thread_destroy(thread: NonNull<Thread>) {
    // SAFETY: refcount is zero; nobody else can reach the thread.
    let t = unsafe { thread.as_ref() };

    debug_assert!(!t.rq_link.is_linked(), "destroying a queued thread");
    debug_assert!(!t.wq_link.is_linked(), "destroying a sleeping thread");
    // Entering and Ready cover threads retired before their first
    // dispatch (creation failure cleanup, teardown).
    debug_assert!(matches!(
        t.state(),
        ThreadState::Entering
            | ThreadState::Ready
            | ThreadState::Exiting
            | ThreadState::Lingering
    ));

    let ipl = arch::interrupts_disable();

    if t.attached.load(Ordering::Acquire) {
        {
            let mut threads = THREADS.lock_noirq();
            let (found, leaf) = threads.search(t.id().0);
            assert!(found.is_some(), "destroying an unregistered thread");
            threads.remove(t.id().0, Some(leaf));
        }

        let task = t.task().expect("attached thread has a task");
        // SAFETY: the task holds still; we hold a task reference that
        // is only dropped below.
        unsafe {
            {
                let _inner = task.as_ref().inner().lock_noirq();
                Link::remove(&t.th_link as *const Link as *mut Link);
            }

            // Fold the thread's cycles into the task.
            if !t.uncounted.load(Ordering::Relaxed) {
                task.as_ref()
                    .ucycles
                    .fetch_add(t.ucycles.load(Ordering::Relaxed), Ordering::Relaxed);
                task.as_ref()
                    .kcycles
                    .fetch_add(t.kcycles.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }

        #[cfg(feature = "fpu-lazy")]
        arch::fpu_clear_owner(thread.as_ptr() as *mut ());

        t.task.store(ptr::null_mut(), Ordering::Release);
        arch::interrupts_restore(ipl);

        task::task_release(task);
    } else {
        arch::interrupts_restore(ipl);
    }

    // SAFETY: the object came from the thread cache; the destructor
    // frees the stack.
    unsafe {
        slab::slab_free(
            thread_cache(),
            NonNull::new_unchecked(thread.as_ptr() as *mut u8),
        )
    };
}

/// Terminate the calling thread. Joiners are woken from the scheduler
/// once the thread is off its own stack.
pub fn thread_exit() -> ! {
    let cur = sched::current_thread().expect("exit without a current thread");
    // SAFETY: current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    if t.is_uspace() {
        if let Some(task) = t.task() {
            // SAFETY: the thread holds its task alive.
            if unsafe { task.as_ref().lifecount_dec() } {
                // Last userspace thread of the task: userspace cleanup
                // (IPC teardown and friends) would run here; those
                // subsystems live outside the core.
                log::debug!("task {} userspace cleanup", unsafe {
                    task.as_ref().id()
                });
            }
        }
    }

    sched::scheduler_enter(ThreadState::Exiting);
    unreachable!("an exiting thread was scheduled again");
}

/// Interrupt a thread so it exits as soon as possible: sets the flag
/// and issues a (possibly spurious) wakeup so interruptible sleeps
/// return `Interrupted`.
pub fn thread_interrupt(thread: &Thread) {
    thread.interrupted.store(true, Ordering::Release);
    thread_wakeup(thread);
}

/// First half of going to sleep. Resets the handshake; the exchange's
/// acquire half makes the memory effects of any wakeup it overwrites
/// visible to this thread.
pub fn thread_wait_start() -> TerminationState {
    let cur = sched::current_thread().expect("wait_start without a current thread");
    // SAFETY: current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    let _ = t
        .sleep_state
        .swap(SLEEP_INITIAL, Ordering::AcqRel);

    if t.interrupted() {
        TerminationState::Terminating
    } else {
        TerminationState::Ok
    }
}

fn wait_timeout_callback(arg: usize) {
    let thread = arg as *const Thread;
    // SAFETY: the sleeping thread unregisters the timeout before its
    // stack frame dies, so the pointer is valid whenever this fires.
    thread_wakeup(unsafe { &*thread });
}

/// Second half of going to sleep: deschedule unless a wakeup already
/// arrived, with an optional deadline.
///
/// A `Timeout` result is necessary but not sufficient evidence of a
/// deadline wake: wakeups, interrupts and the deadline may race, and
/// the caller must tolerate any of them having happened.
pub fn thread_wait_finish(deadline: u64) -> WaitResult {
    let cur = sched::current_thread().expect("wait_finish without a current thread");
    // SAFETY: current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    // A wakeup already arrived: no need to visit the scheduler at all.
    if t.sleep_state.load(Ordering::Acquire) != SLEEP_INITIAL {
        return WaitResult::Success;
    }

    let mut timeout = crate::time::Timeout::new();
    if deadline != DEADLINE_NEVER {
        // SAFETY: the timeout lives on this stack frame and is
        // unregistered below before the frame is left.
        unsafe {
            crate::time::timeout::timeout_register_deadline(
                &mut timeout,
                deadline,
                wait_timeout_callback,
                cur.as_ptr() as usize,
            );
        }
    }

    sched::scheduler_enter(ThreadState::Sleeping);

    if deadline != DEADLINE_NEVER && !crate::time::timeout::timeout_unregister(&mut timeout) {
        WaitResult::Timeout
    } else {
        WaitResult::Success
    }
}

/// Wake a thread. Any number of callers may race; exactly the one that
/// observes the Asleep state re-queues the sleeper, consuming the
/// reference the sleeper implicitly passed to its waker.
pub fn thread_wakeup(thread: &Thread) {
    let state = thread.sleep_state.swap(SLEEP_WOKE, Ordering::AcqRel);

    if state == SLEEP_ASLEEP {
        sched::thread_requeue(thread as *const Thread as *mut Thread);
    }
}

/// Pin the current thread to its CPU.
pub fn thread_migration_disable() {
    let cur = sched::current_thread().expect("no current thread");
    // SAFETY: current thread is live while it runs.
    unsafe { cur.as_ref().nomigrate.fetch_add(1, Ordering::AcqRel) };
}

pub fn thread_migration_enable() {
    let cur = sched::current_thread().expect("no current thread");
    // SAFETY: current thread is live while it runs.
    let t = unsafe { cur.as_ref() };
    let old = t.nomigrate.fetch_sub(1, Ordering::AcqRel);
    assert!(old > 0, "migration enabled more often than disabled");
}

/// Wire a thread to a CPU: bind and forbid migration.
pub fn thread_wire(thread: &Thread, cpu: usize) {
    let ipl = arch::interrupts_disable();
    thread.cpu.store(cpu, Ordering::Release);
    thread.nomigrate.fetch_add(1, Ordering::AcqRel);
    arch::interrupts_restore(ipl);
}

/// Wait for a thread to exit. A successful join consumes the caller's
/// reference. Joining yourself is refused.
pub fn thread_join_timeout(
    thread: NonNull<Thread>,
    usec: u32,
    flags: SleepFlags,
) -> Result<(), KernelError> {
    if sched::current_thread() == Some(thread) {
        return Err(KernelError::Busy);
    }

    // SAFETY: the caller's reference keeps the thread alive for the
    // duration of the join.
    let rc = unsafe { thread.as_ref().join_wq.sleep_timeout(usec, flags) };
    if rc.is_ok() {
        thread_put(thread);
    }
    rc
}

pub fn thread_join(thread: NonNull<Thread>) -> Result<(), KernelError> {
    thread_join_timeout(thread, 0, SleepFlags::empty())
}

/// Suspend the current thread for `usec` microseconds.
pub fn thread_usleep(usec: u32) {
    let wq = WaitQueue::new();
    let _ = wq.sleep_timeout(usec, SleepFlags::empty());
}

/// Suspend the current thread for `sec` seconds.
pub fn thread_sleep(sec: u32) {
    // Chunked so the microsecond argument never overflows.
    let mut sec = sec;
    while sec > 0 {
        let period = sec.min(1000);
        thread_usleep(period * 1_000_000);
        sec -= period;
    }
}

/// Update the current thread's cycle accounting.
pub fn thread_update_accounting(user: bool) {
    let cur = sched::current_thread().expect("no current thread");
    // SAFETY: current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    let now = arch::cycle_count();
    let last = t.last_cycle.swap(now, Ordering::Relaxed);
    let delta = now.wrapping_sub(last);

    if user {
        t.ucycles.fetch_add(delta, Ordering::Relaxed);
    } else {
        t.kcycles.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Look up a thread by id under the registry lock. The returned
/// pointer is weak; the lock is what keeps it alive.
fn thread_find_by_id_locked(threads: &IrqSpinlockGuardAlias<'_>, id: ThreadId) -> Option<NonNull<Thread>> {
    let (found, _) = threads.search(id.0);
    found.map(|ptr| {
        // SAFETY: registry values are thread addresses inserted at
        // attach and removed at destroy.
        unsafe { NonNull::new_unchecked(ptr as *mut Thread) }
    })
}

type IrqSpinlockGuardAlias<'a> = crate::synch::spinlock::IrqSpinlockGuard<'a, Btree>;

/// Find a thread by id and return a strengthened reference, or `None`
/// if it does not exist or is mid-destruction.
pub fn thread_try_get(id: ThreadId) -> Option<NonNull<Thread>> {
    let threads = THREADS.lock();
    let thread = thread_find_by_id_locked(&threads, id)?;
    // SAFETY: while the registry lock is held the thread cannot finish
    // destruction (destroy removes it under this lock first).
    if unsafe { thread_try_ref(thread.as_ref()) } {
        Some(thread)
    } else {
        None
    }
}

/// Number of threads in the registry.
pub fn thread_count() -> usize {
    THREADS.lock().count()
}

/// Visit every registered thread under the registry lock. The visitor
/// gets weak references and must not sleep.
pub fn thread_for_each(mut visit: impl FnMut(&Thread)) {
    let mut threads = THREADS.lock();
    let mut leaf = threads.leaf_first();
    while let Some(node) = leaf {
        // SAFETY: leaves are live while the registry lock is held.
        unsafe {
            let n = node.as_ref();
            for i in 0..n.key_count() {
                visit(&*(n.value_at(i) as *const Thread));
            }
        }
        leaf = threads.leaf_right_neighbor(node);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;

    fn noop_entry(_arg: usize) {}

    #[test]
    fn create_registers_and_put_destroys() {
        let _serial = test_support::init();

        let before = thread_count();
        let task = task::kernel_task();

        let thread = thread_create(noop_entry, 7, task, ThreadFlags::empty(), "utest")
            .expect("thread creation should succeed");
        assert_eq!(thread_count(), before + 1);

        // SAFETY: we hold the creation reference.
        let t = unsafe { thread.as_ref() };
        assert_eq!(t.state(), ThreadState::Entering);
        assert_eq!(t.entry().1, 7);
        t.with_name(|name| assert_eq!(name, "utest"));

        let id = t.id();
        let strong = thread_try_get(id).expect("registered thread is findable");
        assert_eq!(strong, thread);
        thread_put(strong);

        // Dropping the creation reference of a never-started thread
        // destroys it and pulls it out of the registry.
        thread_put(thread);
        assert_eq!(thread_count(), before);
        assert!(thread_try_get(id).is_none());
    }

    #[test]
    fn start_hands_a_reference_to_the_scheduler() {
        let _serial = test_support::init();

        // Boot threads (and threads left by other tests) may sit on
        // the ready queue; start from empty so the pop below is ours.
        while let Some(stale) = sched::take_ready() {
            thread_put(stale);
        }

        let thread = thread_create(
            noop_entry,
            0,
            task::kernel_task(),
            ThreadFlags::empty(),
            "starter",
        )
        .expect("thread creation should succeed");

        // SAFETY: we hold the creation reference.
        let t = unsafe { thread.as_ref() };
        assert_eq!(t.references(), 1);

        thread_start(t);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.references(), 2, "scheduler now holds a reference");

        // Pull it back off the ready queue so the test leaves no
        // dangling queue entry, then drop both references.
        let popped = sched::take_ready().expect("thread is on the ready queue");
        assert_eq!(popped, thread);
        thread_put(popped);
        thread_put(thread);
    }

    #[test]
    fn wakeup_before_wait_finish_skips_the_scheduler() {
        let _serial = test_support::init();

        // The handshake under the exact interleaving of the lost-wakeup
        // race: wait_start, then a wakeup from elsewhere, then
        // wait_finish. The thread must not deschedule.
        let cur = sched::current_thread().expect("bootstrap thread is current");
        // SAFETY: the bootstrap thread outlives the test.
        let t = unsafe { cur.as_ref() };

        assert_eq!(thread_wait_start(), TerminationState::Ok);
        assert_eq!(t.sleep_state_raw(), SLEEP_INITIAL);

        thread_wakeup(t);
        assert_eq!(t.sleep_state_raw(), SLEEP_WOKE);

        // Returns immediately: the wakeup came first, so descheduling
        // would be a lost wakeup.
        assert_eq!(thread_wait_finish(DEADLINE_NEVER), WaitResult::Success);
    }

    #[test]
    fn repeated_wakeups_are_idempotent() {
        let _serial = test_support::init();

        let cur = sched::current_thread().expect("bootstrap thread is current");
        // SAFETY: the bootstrap thread outlives the test.
        let t = unsafe { cur.as_ref() };

        assert_eq!(thread_wait_start(), TerminationState::Ok);
        thread_wakeup(t);
        thread_wakeup(t);
        thread_wakeup(t);
        assert_eq!(thread_wait_finish(DEADLINE_NEVER), WaitResult::Success);
    }

    #[test]
    fn interrupt_flags_and_wakes() {
        let _serial = test_support::init();

        let thread = thread_create(
            noop_entry,
            0,
            task::kernel_task(),
            ThreadFlags::empty(),
            "victim",
        )
        .expect("thread creation should succeed");
        // SAFETY: we hold the creation reference.
        let t = unsafe { thread.as_ref() };

        assert!(!t.interrupted());
        thread_interrupt(t);
        assert!(t.interrupted());
        // The spurious wakeup left the handshake in Woke; a subsequent
        // wait_start reports the termination.
        assert_eq!(t.sleep_state_raw(), SLEEP_WOKE);

        thread_put(thread);
    }

    #[test]
    fn join_self_is_refused() {
        let _serial = test_support::init();

        let cur = sched::current_thread().expect("bootstrap thread is current");
        assert_eq!(
            thread_join_timeout(cur, 0, SleepFlags::empty()),
            Err(KernelError::Busy)
        );
    }

    #[test]
    fn migration_counter_nests() {
        let _serial = test_support::init();

        let cur = sched::current_thread().expect("bootstrap thread is current");
        // SAFETY: the bootstrap thread outlives the test.
        let t = unsafe { cur.as_ref() };

        let before = t.nomigrate.load(Ordering::Relaxed);
        thread_migration_disable();
        thread_migration_disable();
        assert_eq!(t.nomigrate.load(Ordering::Relaxed), before + 2);
        thread_migration_enable();
        thread_migration_enable();
        assert_eq!(t.nomigrate.load(Ordering::Relaxed), before);
    }

    #[test]
    fn accounting_accumulates_cycles() {
        let _serial = test_support::init();

        let cur = sched::current_thread().expect("bootstrap thread is current");
        // SAFETY: the bootstrap thread outlives the test.
        let t = unsafe { cur.as_ref() };

        let kcycles = t.kcycles.load(Ordering::Relaxed);
        thread_update_accounting(false);
        assert!(t.kcycles.load(Ordering::Relaxed) >= kcycles);
    }
}
