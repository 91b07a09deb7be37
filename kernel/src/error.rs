//! Kernel error taxonomy.
//!
//! Every recoverable failure crossing a subsystem boundary is one of the
//! variants below. Internal inconsistencies (freeing a non-busy frame,
//! removing an absent B+tree key) are bugs and panic instead of being
//! reported through this type.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No zone could satisfy the allocation, even after reclaim.
    NoMemory {
        /// Requested allocation order (2^order frames or bytes,
        /// depending on the caller).
        order: usize,
    },
    /// An address, frame number or index fell outside the managed range.
    OutOfBounds,
    /// The resource is owned or in use by someone else (e.g. joining
    /// the current thread, overlapping zone ranges).
    Busy,
    /// The sleeping thread was interrupted before the wait completed.
    Interrupted,
    /// The deadline fired before the wait completed.
    Timeout,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoMemory { order } => {
                write!(f, "out of memory (order {})", order)
            }
            KernelError::OutOfBounds => write!(f, "out of bounds"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::Interrupted => write!(f, "interrupted"),
            KernelError::Timeout => write!(f, "timed out"),
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_is_descriptive() {
        use std::format;

        assert_eq!(
            format!("{}", KernelError::NoMemory { order: 3 }),
            "out of memory (order 3)"
        );
        assert_eq!(format!("{}", KernelError::Timeout), "timed out");
    }
}
