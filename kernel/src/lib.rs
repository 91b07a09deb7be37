//! Osmium kernel core
//!
//! Machine-independent execution and memory substrate: the physical frame
//! allocator, the slab allocator layered on top of it, the B+tree
//! dictionary, thread lifecycle with the sleep-state handshake, and the
//! adaptive kernel work queue. Architecture bring-up plugs in through the
//! hooks in [`arch`]; everything else in the kernel builds on the
//! facilities exported here.
//!
//! Subsystems are brought up in a fixed order (see [`bootstrap`]): frame
//! zones first, then the slab bootstrap caches, then the B+tree node
//! cache, threads and finally the global work queue.

#![no_std]

// Host target (coverage, unit tests): link std so the standard #[test]
// harness and the system allocator are available. Kernel code itself
// only uses core.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod bootstrap;
pub mod config;
pub mod error;

pub mod adt;
pub mod mm;
pub mod proc;
pub mod sched;
pub mod synch;
pub mod time;

// Re-export the types nearly every kernel subsystem needs.
pub use error::KernelError;
pub use mm::{FrameNumber, PhysicalAddress, FRAME_SIZE};

/// Kernel heap on bare metal: the slab allocator's power-of-two malloc
/// caches, behind the `GlobalAlloc` interface. Usable only after
/// `bootstrap` has run the slab initialization.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::slab::KernelAllocator = mm::slab::KernelAllocator;
