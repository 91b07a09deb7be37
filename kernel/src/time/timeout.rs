//! Timeout registry.
//!
//! Timeouts are registered against absolute microsecond deadlines and
//! fire from [`clock_tick`], which the platform's timer interrupt (or a
//! test harness) drives. The registry is a deadline-ordered intrusive
//! list; a `Timeout` lives in its registrant's storage — typically a
//! sleeping thread's stack — and must be unregistered before that
//! storage dies.
//!
//! [`timeout_unregister`] reports whether the timeout was still armed,
//! which is how `thread_wait_finish` tells a deadline wake from a
//! proper one.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::adt::list::{Link, List};
use crate::container_of;
use crate::synch::spinlock::IrqSpinlock;

/// "No deadline": sleep until woken.
pub const DEADLINE_NEVER: u64 = u64::MAX;

/// Handler invoked when a deadline fires; runs outside the registry
/// lock, in the clock context.
pub type TimeoutHandler = fn(arg: usize);

pub struct Timeout {
    link: Link,
    deadline: u64,
    handler: Option<TimeoutHandler>,
    arg: usize,
}

impl Timeout {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            deadline: DEADLINE_NEVER,
            handler: None,
            arg: 0,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::new()
    }
}

/// Registered timeouts, ordered by ascending deadline.
static TIMEOUTS: IrqSpinlock<List> = IrqSpinlock::new(List::new());

/// Microseconds since boot, advanced by [`clock_tick`].
static CLOCK_US: AtomicU64 = AtomicU64::new(0);

/// Current kernel time in microseconds.
pub fn current_time() -> u64 {
    CLOCK_US.load(Ordering::Acquire)
}

/// Arm `timeout` to call `handler(arg)` at `deadline` (absolute).
///
/// # Safety
///
/// `timeout` must be unlinked and must stay valid until the timeout
/// fires or [`timeout_unregister`] removes it — for stack storage that
/// means unregistering before the frame is left.
pub unsafe fn timeout_register_deadline(
    timeout: *mut Timeout,
    deadline: u64,
    handler: TimeoutHandler,
    arg: usize,
) {
    let mut timeouts = TIMEOUTS.lock();

    // SAFETY: caller owns the timeout storage; the registry lock is
    // held for the list splice.
    unsafe {
        (*timeout).deadline = deadline;
        (*timeout).handler = Some(handler);
        (*timeout).arg = arg;

        // Keep the list deadline-ordered so the tick only looks at the
        // front.
        let mut position = None;
        for link in timeouts.iter() {
            let other = container_of!(link, Timeout, link);
            if (*other).deadline > deadline {
                position = Some(link);
                break;
            }
        }
        match position {
            Some(link) => Link::insert_before(&mut (*timeout).link, link),
            None => timeouts.append(&mut (*timeout).link),
        }
    }
}

/// Disarm `timeout`. Returns true if it was still pending, false if it
/// already fired (or was never armed).
pub fn timeout_unregister(timeout: &mut Timeout) -> bool {
    let _timeouts = TIMEOUTS.lock();

    if timeout.link.is_linked() {
        // SAFETY: linked means on the registry list; its lock is held.
        unsafe { Link::remove(&mut timeout.link) };
        true
    } else {
        false
    }
}

/// Advance kernel time to `now` and fire every expired timeout.
/// Handlers run outside the registry lock.
pub fn clock_tick(now: u64) {
    CLOCK_US.store(now, Ordering::Release);

    loop {
        let fired = {
            let mut timeouts = TIMEOUTS.lock();
            let Some(link) = timeouts.first() else {
                break;
            };
            // SAFETY: list members are live, registered timeouts.
            let timeout = unsafe { &mut *container_of!(link, Timeout, link) };
            if timeout.deadline > now {
                break;
            }
            // SAFETY: front of the list we hold the lock for.
            unsafe { Link::remove(&mut timeout.link) };
            (timeout.handler, timeout.arg)
        };

        if let (Some(handler), arg) = fired {
            handler(arg);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::bootstrap::test_support;
    use core::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump(arg: usize) {
        FIRED.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn fires_in_deadline_order_and_unregister_disarms() {
        let _serial = test_support::init();
        FIRED.store(0, Ordering::SeqCst);

        let mut early = Timeout::new();
        let mut late = Timeout::new();
        let mut cancelled = Timeout::new();

        let base = current_time();
        // SAFETY: all three timeouts outlive this function's use of
        // them; the cancelled one is unregistered below.
        unsafe {
            timeout_register_deadline(&mut late, base + 200, bump, 100);
            timeout_register_deadline(&mut early, base + 50, bump, 1);
            timeout_register_deadline(&mut cancelled, base + 60, bump, 10_000);
        }

        assert!(timeout_unregister(&mut cancelled), "still pending");

        clock_tick(base + 100);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1, "only the early timeout fired");
        assert!(!timeout_unregister(&mut early), "already fired");

        clock_tick(base + 250);
        assert_eq!(FIRED.load(Ordering::SeqCst), 101, "late timeout fired too");
        assert!(!timeout_unregister(&mut late), "already fired");
    }
}
