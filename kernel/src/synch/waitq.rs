//! Wait queues.
//!
//! The basic passive synchronization object: a list of parked threads
//! plus a count of wakeups that arrived while nobody was waiting
//! (missed wakeups are consumed by the next sleeper instead of being
//! lost). Sleeping follows the thread sleep-state handshake: prepare
//! with `thread_wait_start` while holding the queue lock, publish the
//! thread on the queue, drop the lock, then commit with
//! `thread_wait_finish`. The waker pulls the first sleeper off the
//! list and calls `thread_wakeup`, which re-queues it if (and only if)
//! it actually went to sleep.
//!
//! A closed queue lets every sleep return immediately; thread exit
//! closes its join queue this way.

use bitflags::bitflags;

use crate::adt::list::{Link, List};
use crate::container_of;
use crate::error::KernelError;
use crate::proc::thread::{self, TerminationState, Thread, WaitResult};
use crate::sched;
use crate::synch::spinlock::IrqSpinlock;
use crate::time::{current_time, DEADLINE_NEVER};

bitflags! {
    /// Sleep behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u32 {
        /// Let `thread_interrupt` abort the sleep with `Interrupted`.
        const INTERRUPTIBLE = 1 << 0;
    }
}

pub struct WaitQueue {
    inner: IrqSpinlock<WaitQueueInner>,
}

struct WaitQueueInner {
    sleepers: List,
    missed_wakeups: usize,
    closed: bool,
}

/// Outcome of the prepare half of a sleep.
pub(crate) enum SleepPrepare {
    /// No need to sleep (missed wakeup, closed queue) or refused
    /// (interruptible sleep of a terminating thread).
    Done(Result<(), KernelError>),
    /// Published on the queue; the caller must drop its locks and run
    /// [`WaitQueue::sleep_commit`].
    Parked,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(WaitQueueInner {
                sleepers: List::new(),
                missed_wakeups: 0,
                closed: false,
            }),
        }
    }

    /// First half of a sleep: consume a missed wakeup or publish the
    /// current thread on the queue.
    pub(crate) fn sleep_prepare(&self, flags: SleepFlags) -> SleepPrepare {
        let mut inner = self.inner.lock();

        if inner.closed {
            return SleepPrepare::Done(Ok(()));
        }
        if inner.missed_wakeups > 0 {
            inner.missed_wakeups -= 1;
            return SleepPrepare::Done(Ok(()));
        }

        if thread::thread_wait_start() == TerminationState::Terminating
            && flags.contains(SleepFlags::INTERRUPTIBLE)
        {
            return SleepPrepare::Done(Err(KernelError::Interrupted));
        }

        let cur = sched::current_thread().expect("sleeping without a current thread");
        // SAFETY: the current thread is live; the queue lock is held
        // for the list splice, and the published reference is the one
        // the waker will consume.
        unsafe {
            let t = cur.as_ref();
            t.sleep_queue
                .store(self as *const WaitQueue as *mut WaitQueue, core::sync::atomic::Ordering::Release);
            inner.sleepers.append(&t.wq_link as *const Link as *mut Link);
        }

        SleepPrepare::Parked
    }

    /// Second half of a sleep: wait for the wakeup (or deadline), then
    /// withdraw from the queue if the wakeup never came.
    pub(crate) fn sleep_commit(
        &self,
        deadline: u64,
        flags: SleepFlags,
    ) -> Result<(), KernelError> {
        let result = thread::thread_wait_finish(deadline);

        let cur = sched::current_thread().expect("woke without a current thread");
        {
            let _inner = self.inner.lock();
            // SAFETY: on a timeout or interrupt the thread may still be
            // parked; the queue lock serializes against wakers.
            unsafe {
                let t = cur.as_ref();
                if t.wq_link.is_linked() {
                    Link::remove(&t.wq_link as *const Link as *mut Link);
                }
                t.sleep_queue
                    .store(core::ptr::null_mut(), core::sync::atomic::Ordering::Release);
            }
        }

        match result {
            WaitResult::Timeout => Err(KernelError::Timeout),
            WaitResult::Success => {
                // SAFETY: current thread is live.
                let interrupted = unsafe { cur.as_ref().interrupted() };
                if interrupted && flags.contains(SleepFlags::INTERRUPTIBLE) {
                    Err(KernelError::Interrupted)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Sleep until woken, with an optional timeout. `usec == 0` means
    /// no timeout.
    pub fn sleep_timeout(&self, usec: u32, flags: SleepFlags) -> Result<(), KernelError> {
        let deadline = if usec == 0 {
            DEADLINE_NEVER
        } else {
            current_time() + usec as u64
        };

        match self.sleep_prepare(flags) {
            SleepPrepare::Done(result) => result,
            SleepPrepare::Parked => self.sleep_commit(deadline, flags),
        }
    }

    /// Sleep until woken.
    pub fn sleep(&self) -> Result<(), KernelError> {
        self.sleep_timeout(0, SleepFlags::empty())
    }

    /// Wake the first sleeper, or record a missed wakeup if the queue
    /// is empty.
    pub fn wake_one(&self) {
        let mut inner = self.inner.lock();

        // SAFETY: queue members are live parked threads.
        match unsafe { inner.sleepers.pop_first() } {
            Some(link) => {
                // SAFETY: recovered from its queue link; the sleeper's
                // published reference passes to us and is consumed by
                // thread_wakeup's requeue.
                let t = unsafe { &*container_of!(link, Thread, wq_link) };
                t.sleep_queue
                    .store(core::ptr::null_mut(), core::sync::atomic::Ordering::Release);
                thread::thread_wakeup(t);
            }
            None => inner.missed_wakeups += 1,
        }
    }

    /// Wake every sleeper. Absent sleepers are not recorded.
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock();

        // SAFETY: queue members are live parked threads; see wake_one.
        while let Some(link) = unsafe { inner.sleepers.pop_first() } {
            // SAFETY: recovered from its queue link.
            let t = unsafe { &*container_of!(link, Thread, wq_link) };
            t.sleep_queue
                .store(core::ptr::null_mut(), core::sync::atomic::Ordering::Release);
            thread::thread_wakeup(t);
        }
    }

    /// Close the queue: wake everyone and let all future sleeps return
    /// immediately.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.wake_all();
    }

    /// Number of missed wakeups currently banked.
    pub fn missed_wakeups(&self) -> usize {
        self.inner.lock().missed_wakeups
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;

    #[test]
    fn missed_wakeup_satisfies_the_next_sleep() {
        let _serial = test_support::init();

        let wq = WaitQueue::new();
        wq.wake_one();
        assert_eq!(wq.missed_wakeups(), 1);

        // The sleep consumes the banked wakeup and never parks.
        assert_eq!(wq.sleep_timeout(0, SleepFlags::empty()), Ok(()));
        assert_eq!(wq.missed_wakeups(), 0);
    }

    #[test]
    fn closed_queue_never_blocks() {
        let _serial = test_support::init();

        let wq = WaitQueue::new();
        wq.close();
        assert_eq!(wq.sleep_timeout(0, SleepFlags::empty()), Ok(()));
        assert_eq!(wq.sleep_timeout(1000, SleepFlags::empty()), Ok(()));
    }

    #[test]
    fn interruptible_sleep_of_a_terminating_thread_is_refused() {
        let _serial = test_support::init();

        let cur = sched::current_thread().expect("bootstrap thread is current");
        // SAFETY: the bootstrap thread outlives the test.
        let t = unsafe { cur.as_ref() };

        thread::thread_interrupt(t);

        let wq = WaitQueue::new();
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::INTERRUPTIBLE),
            Err(KernelError::Interrupted)
        );

        // Leave the bootstrap thread unflagged for later tests.
        t.clear_interrupted();
    }

    #[test]
    fn wake_all_banks_nothing() {
        let _serial = test_support::init();

        let wq = WaitQueue::new();
        wq.wake_all();
        assert_eq!(wq.missed_wakeups(), 0);
    }
}
