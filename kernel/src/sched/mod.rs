//! Scheduler substrate.
//!
//! The core carries the machine-independent half of scheduling: the
//! ready queue, per-CPU current-thread tracking, and the deschedule
//! path that completes the sleep-state handshake. Time slicing and CPU
//! balancing policy live outside the core; an arch port drives this
//! module from its timer and idle loops.
//!
//! Threads that exit cannot free themselves while still running on
//! their own stack, so they park on a lingering list and are reaped by
//! whichever thread passes through the scheduler next.
//!
//! SMP dispatch invariant: a thread put back on the ready queue by a
//! wakeup must not be dispatched on another CPU until its outgoing
//! context switch has completed; the arch dispatch path provides that
//! ordering.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::adt::list::List;
use crate::arch;
use crate::container_of;
use crate::proc::thread::{self, Thread, ThreadState};
use crate::synch::spinlock::IrqSpinlock;
use crate::synch::workq;

/// Global ready queue, FIFO. Per-CPU run queues are an arch-port
/// concern layered above this.
static READY: IrqSpinlock<List> = IrqSpinlock::new(List::new());

/// Exited threads awaiting destruction off their own stacks.
static LINGERING: IrqSpinlock<List> = IrqSpinlock::new(List::new());

/// The thread executing on each CPU.
static CURRENT: [AtomicPtr<Thread>; arch::MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; arch::MAX_CPUS];

/// The thread executing on the calling CPU, if one has been adopted.
pub fn current_thread() -> Option<NonNull<Thread>> {
    let cpu = arch::current_cpu_id()?;
    NonNull::new(CURRENT[cpu].load(Ordering::Acquire))
}

/// Adopt `thread` as the calling CPU's current thread. Called by the
/// boot path for the initial thread of each CPU and by the dispatch
/// path on every switch.
pub fn set_current(thread: *mut Thread) {
    let cpu = arch::current_cpu_id().expect("adopting a thread before CPU identity is known");
    CURRENT[cpu].store(thread, Ordering::Release);
}

/// Put a thread on the ready queue, consuming one strong reference
/// (the one implicitly passed by the sleeper or by `thread_start`).
pub(crate) fn thread_requeue(thread: *mut Thread) {
    reap_lingering();

    // SAFETY: the caller passes a live thread it holds a reference to.
    let t = unsafe { &*thread };

    {
        let _thread_lock = t.lock.lock();
        // A waking work-queue worker stops counting as blocked before
        // it becomes ready.
        workq::before_thread_is_ready(t);
        t.set_state(ThreadState::Ready);
    }

    let mut ready = READY.lock();
    // SAFETY: rq_link is unlinked (the thread is neither queued nor
    // lingering) and the ready-queue lock is held.
    unsafe { ready.append(&t.rq_link as *const _ as *mut _) };
}

/// Pop the next ready thread, transferring its queue reference to the
/// caller.
pub(crate) fn take_ready() -> Option<NonNull<Thread>> {
    let mut ready = READY.lock();
    // SAFETY: queue members are live threads; the queue holds a
    // reference to each.
    let link = unsafe { ready.pop_first() }?;
    // SAFETY: recovered from its queue link.
    Some(unsafe { NonNull::new_unchecked(container_of!(link, Thread, rq_link)) })
}

/// Destroy threads parked on the lingering list. Runs on a live
/// thread's stack, never on the dead thread's own.
fn reap_lingering() {
    loop {
        let thread = {
            let mut lingering = LINGERING.lock();
            // SAFETY: list members are lingering threads whose queue
            // reference the list still holds.
            match unsafe { lingering.pop_first() } {
                Some(link) => {
                    // SAFETY: recovered from its list link.
                    unsafe { NonNull::new_unchecked(container_of!(link, Thread, rq_link)) }
                }
                None => return,
            }
        };
        thread::thread_put(thread);
    }
}

/// Deschedule the current thread with the given target state.
///
/// - `Sleeping`: completes the sleep-state handshake. If a wakeup
///   already arrived the thread keeps running and this returns
///   immediately; otherwise the CPU switches to the next ready thread.
/// - `Exiting`: wakes all joiners, parks the thread for reaping and
///   switches away for good.
/// - `Running`: voluntary yield.
pub fn scheduler_enter(new_state: ThreadState) {
    let ipl = arch::interrupts_disable();

    let cur = current_thread().expect("scheduler entered with no current thread");
    // SAFETY: the current thread is live while it runs.
    let t = unsafe { cur.as_ref() };

    thread::thread_update_accounting(false);
    t.set_state(new_state);

    match new_state {
        ThreadState::Sleeping => {
            // A work-queue worker going to sleep inside its work
            // function may warrant activating a standby worker.
            workq::after_thread_ran();

            if t
                .sleep_state_cas_initial_to_asleep()
                .is_err()
            {
                // The wakeup won the race: do not sleep.
                t.set_state(ThreadState::Running);
                arch::interrupts_restore(ipl);
                return;
            }

            switch_away(cur);
            // Woken again: we own the CPU once more.
            arch::interrupts_restore(ipl);
        }
        ThreadState::Exiting => {
            // Joiners may proceed; the queue stays closed so late
            // joiners return immediately.
            t.join_wq.close();
            t.set_state(ThreadState::Lingering);

            {
                let mut lingering = LINGERING.lock_noirq();
                // SAFETY: rq_link is unlinked (the thread is running,
                // not queued); the lingering lock is held. The
                // scheduler's reference rides along on the list.
                unsafe { lingering.append(&t.rq_link as *const _ as *mut _) };
            }

            switch_away(cur);
            unreachable!("a lingering thread was scheduled again");
        }
        ThreadState::Running => {
            // Voluntary yield: back of the ready queue, run the next
            // thread if there is one.
            match take_ready() {
                Some(next) => {
                    thread::thread_ref(t);
                    thread_requeue(cur.as_ptr());
                    dispatch(cur, next);
                    arch::interrupts_restore(ipl);
                }
                None => {
                    t.set_state(ThreadState::Running);
                    arch::interrupts_restore(ipl);
                }
            }
        }
        other => panic!("scheduler entered with target state {:?}", other),
    }
}

/// Leave the CPU: dispatch the next ready thread. There is always one
/// on a live system (each CPU's idle thread never sleeps); running out
/// means the execution model was violated.
fn switch_away(cur: NonNull<Thread>) {
    let next = take_ready().expect("no ready thread to run");
    dispatch(cur, next);
}

/// Switch this CPU from `cur` to `next`.
fn dispatch(cur: NonNull<Thread>, next: NonNull<Thread>) {
    // SAFETY: both threads are live; `next` came off the ready queue
    // whose reference now backs its execution.
    unsafe {
        next.as_ref().set_state(ThreadState::Running);
        set_current(next.as_ptr());
        arch::context_switch(
            cur.as_ref().saved_context.get(),
            next.as_ref().saved_context.get(),
        );
    }
    // Execution resumes here when `cur` is dispatched again; the
    // dispatcher already marked it Running and set CURRENT.
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;
    use crate::proc::task;
    use crate::proc::thread::{thread_create, thread_put, thread_start, ThreadFlags};

    fn noop_entry(_arg: usize) {}

    /// The host never dispatches, so boot threads (and threads from
    /// other tests) accumulate on the ready queue; start from empty.
    fn drain_ready_queue() {
        while let Some(thread) = take_ready() {
            thread_put(thread);
        }
    }

    #[test]
    fn ready_queue_is_fifo() {
        let _serial = test_support::init();
        drain_ready_queue();

        let a = thread_create(noop_entry, 0, task::kernel_task(), ThreadFlags::empty(), "a")
            .expect("thread creation should succeed");
        let b = thread_create(noop_entry, 0, task::kernel_task(), ThreadFlags::empty(), "b")
            .expect("thread creation should succeed");

        // SAFETY: creation references held.
        unsafe {
            thread_start(a.as_ref());
            thread_start(b.as_ref());
        }

        let first = take_ready().expect("two threads queued");
        let second = take_ready().expect("one thread left");
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(take_ready().is_none());

        // Drop the queue references we just took over, then the
        // creation references.
        thread_put(first);
        thread_put(second);
        thread_put(a);
        thread_put(b);
    }

    #[test]
    fn current_thread_tracks_the_boot_thread() {
        let _serial = test_support::init();

        let cur = current_thread().expect("bootstrap adopted a thread");
        // SAFETY: the bootstrap thread outlives the test.
        unsafe {
            assert_eq!(cur.as_ref().state(), ThreadState::Running);
        }
    }
}
