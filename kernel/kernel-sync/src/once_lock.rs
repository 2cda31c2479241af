//! # Init-Once Cell

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A write-once cell for the kernel's `init`-phase singletons.
///
/// Components that exist for the life of the kernel (the frame allocator,
/// the kernel address space, the service registry) are stored in statics of
/// this type: `set` during the ordered bring-up, `get` afterwards. Reads
/// before initialization return `None`, which the callers surface as
/// `NotInitialized`.
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: single writer before READY, shared reads after.
unsafe impl<T: Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Whether the cell has been initialized.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Store `value`; fails with the value handed back if already set.
    ///
    /// # Errors
    /// Returns `Err(value)` when the cell was initialized before (or a
    /// concurrent `set` is in flight).
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(UNINIT, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Shared access; `None` before initialization.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        if self.is_set() {
            // Safety: READY is only published after the write completes.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // Safety: READY means the value was written and never taken out.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}
