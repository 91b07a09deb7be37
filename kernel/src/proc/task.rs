//! Task management.
//!
//! A task is the container of threads sharing one address space. Tasks
//! are slab-allocated, carry an atomic strong reference count, and are
//! listed in a global id-keyed dictionary. The lifecount tracks live
//! userspace threads: when it drops to zero the task's userspace part
//! is finished and cleanup may run.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::adt::btree::Btree;
use crate::adt::list::List;
use crate::mm::frame::FrameFlags;
use crate::mm::slab::{self, SlabCache, SlabFlags};
use crate::synch::spinlock::IrqSpinlock;

/// Task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const TASK_NAME_BUFLEN: usize = 32;

/// Fixed-capacity, truncating name buffer.
pub(crate) struct KName {
    buf: [u8; TASK_NAME_BUFLEN],
    len: usize,
}

impl KName {
    pub(crate) const fn empty() -> Self {
        Self {
            buf: [0; TASK_NAME_BUFLEN],
            len: 0,
        }
    }

    pub(crate) fn set(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_BUFLEN);
        self.buf[..len].copy_from_slice(&bytes[..len]);
        self.len = len;
    }

    pub(crate) fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8>")
    }
}

pub struct Task {
    id: TaskId,
    name: Mutex<KName>,

    /// Threads belonging to this task; protected by `lock`.
    lock: IrqSpinlock<TaskInner>,

    /// Strong references (threads, registries, holders).
    refcount: AtomicUsize,
    /// Userspace threads still alive.
    lifecount: AtomicUsize,

    /// Cycle accounting accumulated from exited threads.
    pub(crate) ucycles: AtomicU64,
    pub(crate) kcycles: AtomicU64,
}

pub(crate) struct TaskInner {
    pub(crate) threads: List,
}

// SAFETY: interior raw pointers (thread list) are guarded by the task
// lock; everything else is atomic.
unsafe impl Send for Task {}
// SAFETY: same as Send.
unsafe impl Sync for Task {}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn inner(&self) -> &IrqSpinlock<TaskInner> {
        &self.lock
    }

    /// Userspace threads still alive.
    pub fn lifecount(&self) -> usize {
        self.lifecount.load(Ordering::Acquire)
    }

    pub(crate) fn lifecount_inc(&self) {
        self.lifecount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if this was the last userspace thread.
    pub(crate) fn lifecount_dec(&self) -> bool {
        self.lifecount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn with_name<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(self.name.lock().as_str())
    }
}

static TASK_CACHE: AtomicPtr<SlabCache> = AtomicPtr::new(ptr::null_mut());

fn task_cache() -> &'static SlabCache {
    let cache = TASK_CACHE.load(Ordering::Acquire);
    assert!(!cache.is_null(), "task subsystem used before task::init()");
    // SAFETY: published once at init and never freed.
    unsafe { &*cache }
}

/// Global dictionary of tasks keyed by id. Weak references; strengthen
/// with [`task_hold`] before the lock is released.
static TASKS: IrqSpinlock<Btree> = IrqSpinlock::new(Btree::empty());

static TASK_ID_LOCK: IrqSpinlock<u64> = IrqSpinlock::new(0);

/// The task owning all pure kernel threads; created by [`init`].
static KERNEL_TASK: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());

pub fn kernel_task() -> &'static Task {
    let task = KERNEL_TASK.load(Ordering::Acquire);
    assert!(!task.is_null(), "kernel task used before task::init()");
    // SAFETY: created once at init; the kernel task is never released.
    unsafe { &*task }
}

/// Initialize task support and create the kernel task.
pub fn init() {
    let cache = slab::slab_cache_create(
        "task",
        core::mem::size_of::<Task>(),
        core::mem::align_of::<Task>(),
        None,
        None,
        SlabFlags::MAGDEFERRED,
    );
    TASK_CACHE.store(cache as *const SlabCache as *mut SlabCache, Ordering::Release);

    TASKS.lock().create();

    let kernel = task_create("kernel").expect("kernel task allocation failed");
    KERNEL_TASK.store(kernel.as_ptr(), Ordering::Release);
}

/// Create a task with one strong reference held by the caller.
pub fn task_create(name: &str) -> Option<NonNull<Task>> {
    let obj = slab::slab_alloc(task_cache(), FrameFlags::ATOMIC)?;
    let task = obj.as_ptr() as *mut Task;

    let id = {
        let mut last = TASK_ID_LOCK.lock();
        *last += 1;
        TaskId(*last)
    };

    // SAFETY: fresh slab object, exclusively ours until registered.
    unsafe {
        task.write(Task {
            id,
            name: Mutex::new(KName::empty()),
            lock: IrqSpinlock::new(TaskInner {
                threads: List::new(),
            }),
            refcount: AtomicUsize::new(1),
            lifecount: AtomicUsize::new(0),
            ucycles: AtomicU64::new(0),
            kcycles: AtomicU64::new(0),
        });
        (*task).name.lock().set(name);
    }

    TASKS.lock().insert(id.0, task as usize, None);

    log::debug!("task {} '{}' created", id.0, name);
    NonNull::new(task)
}

/// Add a strong reference.
pub fn task_hold(task: &Task) {
    let old = task.refcount.fetch_add(1, Ordering::AcqRel);
    debug_assert!(old > 0, "holding a dead task");
}

/// Drop a strong reference; the last one destroys the task.
pub fn task_release(task: NonNull<Task>) {
    // SAFETY: the caller owns a strong reference.
    let refs = unsafe { task.as_ref().refcount.fetch_sub(1, Ordering::AcqRel) };
    if refs == 1 {
        task_destroy(task);
    }
}

fn task_destroy(task: NonNull<Task>) {
    // SAFETY: refcount reached zero; we are the only owner left.
    let id = unsafe { task.as_ref().id };

    {
        let mut tasks = TASKS.lock();
        let (found, leaf) = tasks.search(id.0);
        assert!(found.is_some(), "destroying an unregistered task");
        tasks.remove(id.0, Some(leaf));
    }

    // SAFETY: all threads are gone (they each held a reference), so
    // the thread list is empty and nobody can reach the task anymore.
    unsafe {
        debug_assert!(task.as_ref().lock.lock().threads.is_empty());
        slab::slab_free(
            task_cache(),
            NonNull::new_unchecked(task.as_ptr() as *mut u8),
        );
    }

    log::debug!("task {} destroyed", id.0);
}

/// Look a task up by id and return a strengthened reference to it.
pub fn task_find_by_id(id: TaskId) -> Option<NonNull<Task>> {
    let tasks = TASKS.lock();
    let (found, _) = tasks.search(id.0);
    let task = found? as *mut Task;
    // SAFETY: registry members are live; the registry lock is held, so
    // the task cannot be destroyed while we strengthen the reference.
    unsafe { task_hold(&*task) };
    NonNull::new(task)
}

/// Number of live tasks.
pub fn task_count() -> usize {
    TASKS.lock().count()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;

    #[test]
    fn create_find_release_round_trip() {
        let _serial = test_support::init();

        let before = task_count();
        let task = task_create("utest").expect("task creation should succeed");
        assert_eq!(task_count(), before + 1);

        // SAFETY: we hold the creation reference.
        let id = unsafe { task.as_ref().id() };
        let found = task_find_by_id(id).expect("registered task is findable");
        assert_eq!(found, task);
        // SAFETY: both references are ours to drop.
        unsafe {
            found.as_ref().with_name(|name| assert_eq!(name, "utest"));
        }

        task_release(found);
        assert_eq!(task_count(), before + 1, "one reference still held");

        task_release(task);
        assert_eq!(task_count(), before, "last release destroys the task");
        assert!(task_find_by_id(id).is_none());
    }

    #[test]
    fn names_are_truncated_not_rejected() {
        let _serial = test_support::init();

        let long = "a-name-well-beyond-the-fixed-buffer-capacity-of-tasks";
        let task = task_create(long).expect("task creation should succeed");
        // SAFETY: we hold the creation reference.
        unsafe {
            task.as_ref().with_name(|name| {
                assert_eq!(name.len(), TASK_NAME_BUFLEN);
                assert!(long.starts_with(name));
            });
        }
        task_release(task);
    }
}
