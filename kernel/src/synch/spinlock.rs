//! IRQ-disabling spinlock.
//!
//! Wraps `spin::Mutex` with the kernel's interrupt discipline: taking
//! the lock disables local interrupts and the guard restores the saved
//! level when dropped. A `lock_noirq` variant exists for paths that have
//! already disabled interrupts at their entry point (the frame and slab
//! allocators do this once per public operation instead of per lock).

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch::{self, Ipl};

pub struct IrqSpinlock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Disable interrupts and acquire the lock.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let ipl = arch::interrupts_disable();
        IrqSpinlockGuard {
            lock: self,
            guard: Some(self.inner.lock()),
            ipl: Some(ipl),
        }
    }

    /// Acquire the lock with interrupts already disabled by the caller.
    /// The guard will not touch the interrupt level.
    pub fn lock_noirq(&self) -> IrqSpinlockGuard<'_, T> {
        IrqSpinlockGuard {
            lock: self,
            guard: Some(self.inner.lock()),
            ipl: None,
        }
    }

    /// True if somebody holds the lock; used in debug assertions only.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct IrqSpinlockGuard<'a, T> {
    lock: &'a IrqSpinlock<T>,
    guard: Option<MutexGuard<'a, T>>,
    ipl: Option<Ipl>,
}

impl<'a, T> IrqSpinlockGuard<'a, T> {
    /// The lock this guard belongs to; lets a primitive (condvar) drop
    /// and later re-acquire the caller's lock.
    pub fn source(&self) -> &'a IrqSpinlock<T> {
        self.lock
    }
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard accessed after release")
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard accessed after release")
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before restoring the interrupt level, never
        // the other way around.
        self.guard.take();
        if let Some(ipl) = self.ipl.take() {
            arch::interrupts_restore(ipl);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let lock = IrqSpinlock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn noirq_variant_locks_too() {
        let lock = IrqSpinlock::new(());
        let guard = lock.lock_noirq();
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }
}
