//! # Spin Lock

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_arch::irq::IrqGuard;

/// A spin lock for short critical sections.
///
/// Acquire uses `Acquire` ordering and release uses `Release`, so everything
/// written inside the critical section is globally visible once the lock is
/// dropped; the visibility guarantees for the free lists and message queues
/// ride on this.
///
/// Plain [`lock`](Self::lock) does **not** disable interrupts; use
/// [`lock_irq`](Self::lock_irq) for state that interrupt handlers also touch,
/// or the handler can deadlock against its own CPU.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the lock provides mutual exclusion; the value may cross threads
// when it is Send.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spin until the lock is acquired; unlocks when the guard drops.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }

    /// Acquire without blocking; `None` if the lock is held.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire with interrupts disabled for the guard's lifetime.
    ///
    /// The interrupt flag is saved before the spin and restored when the
    /// guard drops, after the lock is released.
    pub fn lock_irq(&self) -> IrqSpinGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinGuard { _irq: irq, guard }
    }

    /// Direct access through `&mut self`; no locking needed.
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Release the lock without a guard.
    ///
    /// Exists for lock handoff across a context switch: a freshly built
    /// task resumes with the dispatching context's acquisition still in
    /// force and no guard of its own to drop.
    ///
    /// # Safety
    /// The caller must be the logical owner of the current acquisition; no
    /// guard for it may drop afterwards.
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Guard pairing a [`SpinGuard`] with a saved-and-disabled interrupt flag.
///
/// Fields drop in declaration order, so the lock is released before
/// interrupts come back.
pub struct IrqSpinGuard<'a, T> {
    guard: SpinGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
