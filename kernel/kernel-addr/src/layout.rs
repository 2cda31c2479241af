//! # Fixed Kernel Memory Layout and Tuning Constants
//!
//! Compile-time configuration shared by the memory, scheduling and IPC
//! subsystems. Virtual layout:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌────────────────────────────────┐
//!                       │ user half (canonical low)      │
//! USER_ALLOC_BASE       │   user VMM allocations         │
//! 0x0000_8000_0000_0000 ├──── non-canonical hole ────────┤
//! HHDM_BASE             │ higher-half direct map of RAM  │
//! KERNEL_ALLOC_BASE     │   kernel VMM allocations       │
//! KERNEL_HEAP_BASE      │   kernel byte heap             │
//! 0xFFFF_FFFF_FFFF_FFFF └────────────────────────────────┘
//! ```

/// Base of the higher-half direct map: physical address `p` is readable at
/// `HHDM_BASE + p` once the kernel page tables are installed.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// First virtual address handed out for kernel-space VMM allocations.
pub const KERNEL_ALLOC_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Size of the kernel VMM allocation window.
pub const KERNEL_ALLOC_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Base and size of the kernel byte heap.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_A000_0000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// First virtual address handed out for user-space VMM allocations.
pub const USER_ALLOC_BASE: u64 = 0x0000_0000_0040_0000;

/// Size of the user VMM allocation window.
pub const USER_ALLOC_SIZE: u64 = 0x0000_7000_0000_0000 - USER_ALLOC_BASE;

/// Scheduler tick rate driven by the Local-APIC timer.
pub const TICK_HZ: u64 = 1000;

/// Nominal time slice granted on each transition to Running, in ticks.
pub const DEFAULT_SLICE_TICKS: u32 = 5;

/// Default kernel stack size for new tasks.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// Capacity of an ordinary IPC destination queue.
pub const IPC_QUEUE_CAPACITY: usize = 64;

/// Capacity of the system queue (the `dest == None` destination).
pub const IPC_SYSTEM_QUEUE_CAPACITY: usize = 1024;

/// Maximum payload carried by one IPC message.
pub const IPC_MAX_PAYLOAD: usize = 1024;
