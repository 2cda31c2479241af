//! # Preemptive Round-Robin Scheduler
//!
//! Kernel threads in a fixed 256-slot task table, three intrusive
//! doubly-linked queues (ready, blocked, sleeping) threaded through the
//! records by slot index, and strict-FIFO round-robin dispatch. Priorities
//! are carried and exposed but do not influence selection yet; ties break by
//! insertion order.
//!
//! Time comes in through [`Scheduler::on_tick`], driven by the per-CPU APIC
//! timer: each tick burns one unit of the running task's budget, sweeps the
//! sleeping queue, and requests a reschedule when the budget hits zero.
//! Uptime is derived from the same tick count.
//!
//! The actual stack switch and the kernel-stack allocation sit behind the
//! [`ContextOps`] and [`StackProvider`] seams; the owner serializes every
//! entry point under one interrupt-safe lock and the context-switch epilogue
//! runs after that lock is released.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod queue;
mod scheduler;
mod task;

pub use scheduler::{
    ContextOps, MAX_TASKS, SchedError, SchedStats, Scheduler, StackProvider, TaskInfo,
};
pub use task::{
    BlockReason, KernelStack, Policy, Priority, SavedContext, TaskEntry, TaskId, TaskState,
};
