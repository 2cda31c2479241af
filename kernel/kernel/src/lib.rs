//! # Kernel Core Integration
//!
//! Ties the subsystem crates into one kernel: the boot contract, the
//! ordered bring-up (`PFA → VMM/heap → SMP → scheduler → IPC`), the serial
//! logger, the timer interrupt path, and the export surface the monolithic
//! layer (drivers, VFS, terminal) programs against ([`kapi`]).
//!
//! ## Lock order
//!
//! Component locks nest in one direction only:
//! `IPC → scheduler → kernel address space → frame allocator`. The
//! scheduler lock disables interrupts while held and is handed across the
//! context switch. Nothing parks a task while holding the IPC lock: the
//! blocking IPC paths in [`kapi`] poll and register a waiter under the IPC
//! lock, then suspend on the scheduler after releasing it.
//!
//! ## Hosted builds
//!
//! On `target_os = "none"` physical memory is reached through the
//! higher-half direct map and the timer fires for real. Hosted builds (the
//! test suite) swap in a fixed simulated-RAM arena and inert context
//! switching, so the whole init-and-run path stays executable on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod boot;
mod init;
pub mod interrupts;
pub mod kapi;
mod logger;
mod mapper;
mod state;

pub use boot::BootInfo;
pub use init::{KernelError, init, is_initialized};
pub use kapi::{SystemInfo, TerminalRead, TerminalWrite};
pub use mapper::SIM_MEMORY_BYTES;

// Re-exported vocabulary of the export surface.
pub use kernel_ipc::{Destination, IpcError, MessageFlags, MessageType, RecvInfo, ServiceHandler};
pub use kernel_pmm::{MemoryRegion, MemoryRegionKind};
pub use kernel_sched::{Priority, TaskEntry, TaskId};
pub use kernel_vmem::VmFlags;
