//! # Memory Barriers
//!
//! Cross-CPU ordering primitives for the shared kernel structures (free
//! lists, message queues, the task table). On x86-64 these compile to the
//! serializing fence instructions; elsewhere they fall back to compiler
//! fences with the equivalent ordering.

/// Full fence: no load or store crosses this point in either direction.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mfence", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Read fence: loads before this point complete before loads after it.
#[inline]
pub fn read_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("lfence", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}

/// Write fence: stores before this point are visible before stores after it.
#[inline]
pub fn write_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("sfence", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}
