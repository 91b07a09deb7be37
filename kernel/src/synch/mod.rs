//! Synchronization primitives: IRQ spinlocks, wait queues, condition
//! variables and the kernel work queue.

pub mod condvar;
pub mod spinlock;
pub mod waitq;
pub mod workq;

pub use condvar::CondVar;
pub use spinlock::{IrqSpinlock, IrqSpinlockGuard};
pub use waitq::WaitQueue;
pub use workq::{WorkItem, WorkQueue};
