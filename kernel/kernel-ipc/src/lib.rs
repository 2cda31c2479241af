//! # Inter-Task Message Passing
//!
//! Bounded per-destination FIFO queues of page-sized messages, plus a
//! named-service registry. Every message occupies exactly one PFA frame:
//! a fixed header (queue link, length, type, flags, sender, timestamp)
//! followed by up to 1024 payload bytes. Queues link messages through their
//! frames, so the subsystem itself needs no heap.
//!
//! Destinations are tagged ([`Destination::System`], a registered service by
//! name, or a task): the system queue always exists, service queues come and
//! go with registration, task queues materialize on first use.
//!
//! Blocking behaviour is split across two layers so no task ever parks
//! while holding the IPC lock: the queue-level operations here only *poll*
//! and *register* a waiter (through the [`WaitOps`] seam they also learn the
//! caller's identity and wake parked peers), while the actual
//! park-retry-timeout orchestration lives with the owner of the locks, which
//! blocks the task on the scheduler **after** releasing the IPC lock. A
//! parked receiver is woken by the next send, a parked sender by the next
//! receive; timed waits ride the scheduler's sleeping queue.
//!
//! Ordering: within one (sender, destination) pair arrival order is
//! enqueue order; across senders only per-destination FIFO holds.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod message;
mod queue;
mod router;

pub use message::{MAX_PAYLOAD, MessageFlags, MessageType, RecvInfo};
pub use queue::MessageQueue;
pub use router::{Destination, Ipc, MAX_SERVICES, ServiceHandler};

use kernel_sched::TaskId;

/// IPC failure codes. Callers can tell a full queue from an oversized
/// payload from a timeout, per the error-handling contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("payload exceeds the 1024-byte message limit")]
    TooLarge,
    #[error("destination queue is full")]
    QueueFull,
    #[error("no route to destination")]
    NoRoute,
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("receive buffer is smaller than the message")]
    BufferTooSmall,
    #[error("queue is empty")]
    Empty,
    #[error("service name is already registered")]
    AlreadyRegistered,
    #[error("service registry is full")]
    RegistryFull,
    #[error("no such service")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory for message frames")]
    OutOfMemory,
}

/// Scheduler services the IPC layer relies on for waiter bookkeeping and
/// timestamps. Implemented over the real scheduler in the kernel crate and
/// by scripted doubles in tests.
pub trait WaitOps {
    /// The task invoking the IPC operation (`None` in pre-scheduler code).
    fn current(&mut self) -> Option<TaskId>;

    /// Wake a parked task.
    fn unblock(&mut self, id: TaskId);

    /// Monotonic milliseconds for message timestamps.
    fn now_ms(&mut self) -> u64;
}
