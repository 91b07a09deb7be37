//! Bare-metal x86_64 backend.
//!
//! Interrupt control goes through the `x86_64` crate. Physical memory is
//! expected to be identity-mapped at `PHYS_MAP_BASE` by the boot path.
//! SMP identity reporting is wired up once the APIC bring-up (outside
//! the core) publishes per-CPU ids.

use core::arch::global_asm;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::SavedContext;
use crate::mm::PhysicalAddress;

/// Base of the kernel's linear mapping of physical memory.
const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

pub(super) fn interrupts_disable() -> bool {
    let enabled = ::x86_64::instructions::interrupts::are_enabled();
    ::x86_64::instructions::interrupts::disable();
    enabled
}

pub(super) fn interrupts_restore(was_enabled: bool) {
    if was_enabled {
        ::x86_64::instructions::interrupts::enable();
    }
}

/// Published by SMP bring-up; `usize::MAX` until then.
static BOOT_CPU_ID: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Publish the executing CPU's id. Called by the (out-of-core) SMP
/// bring-up once the local APIC is readable.
pub fn set_current_cpu_id(id: usize) {
    BOOT_CPU_ID.store(id, Ordering::Release);
}

pub(super) fn current_cpu_id() -> Option<usize> {
    let id = BOOT_CPU_ID.load(Ordering::Acquire);
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

pub(super) fn phys_to_virt(addr: PhysicalAddress) -> *mut u8 {
    (PHYS_MAP_BASE + addr.as_u64()) as *mut u8
}

pub(super) fn virt_to_phys(ptr: *const u8) -> u64 {
    ptr as u64 - PHYS_MAP_BASE
}

pub(super) fn cycle_count() -> u64 {
    // SAFETY: rdtsc is unprivileged and has no memory effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

// Stack image consumed by the first switch into a fresh context:
// six zeroed callee-saved registers followed by the entry address the
// trailing `ret` jumps to.
const FRESH_FRAME_WORDS: usize = 7;

pub(super) fn context_create(
    ctx: &mut SavedContext,
    entry: extern "C" fn() -> !,
    stack_base: *mut u8,
    stack_size: usize,
) {
    let top = (stack_base as usize + stack_size) & !0xf;
    let frame = (top - FRESH_FRAME_WORDS * 8) as *mut usize;

    // SAFETY: `frame` lies within the freshly allocated stack span
    // [stack_base, stack_base + stack_size), which the caller owns and
    // nothing else references yet.
    unsafe {
        for slot in 0..FRESH_FRAME_WORDS - 1 {
            frame.add(slot).write(0);
        }
        frame.add(FRESH_FRAME_WORDS - 1).write(entry as usize);
    }

    ctx.pc = entry as usize;
    ctx.sp = frame as usize;
}

// Saves pc/sp (offsets 0/8 of SavedContext) and the callee-saved
// registers on the outgoing stack, then adopts the incoming stack.
global_asm!(
    "
    .global __osmium_context_switch
__osmium_context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi + 8], rsp
    lea rax, [rip + 1f]
    mov [rdi], rax
    mov rsp, [rsi + 8]
1:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"
);

extern "C" {
    fn __osmium_context_switch(from: *mut SavedContext, to: *const SavedContext);
}

pub(super) unsafe fn context_switch(from: *mut SavedContext, to: *const SavedContext) {
    // SAFETY: forwarded caller contract; the assembly only touches the
    // two context records and the stacks they describe.
    unsafe {
        __osmium_context_switch(from, to);
    }
}

#[cfg(feature = "fpu-lazy")]
pub(super) fn fpu_clear_owner(_thread: *mut ()) {
    // Wired up by the FPU trap path, which lives outside the core.
}
