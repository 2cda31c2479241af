//! # Kernel Synchronization Primitives
//!
//! Component-owned locking for the kernel core: a spin lock with an RAII
//! guard, an interrupt-safe variant for state touched from the timer path,
//! and an init-once cell for the process-wide singletons that exist from
//! `init` to shutdown.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod once_lock;
mod spin_lock;

pub use once_lock::OnceLock;
pub use spin_lock::{IrqSpinGuard, SpinGuard, SpinLock};
