//! # Interrupt-Flag Control
//!
//! Save/disable/restore of the interrupt flag, used by the lock layer to keep
//! interrupt handlers out of critical sections. Hosted builds simulate the
//! flag in a process-local cell so guard semantics remain testable.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    /// Whether interrupts are currently enabled (RFLAGS.IF).
    #[must_use]
    pub fn enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nostack, preserves_flags));
        }
        rflags & (1 << 9) != 0
    }

    /// Disable interrupt delivery on this CPU.
    pub fn disable() {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    /// Enable interrupt delivery on this CPU.
    pub fn enable() {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[must_use]
    pub fn enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }
}

pub use imp::{disable, enable, enabled};

/// RAII guard: disables interrupts on creation, restores the previous state
/// on drop. Nests correctly because only the outermost guard re-enables.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = enabled();
        if were_enabled {
            disable();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}
