//! # Task Records

use kernel_addr::VirtAddr;

/// Monotonically increasing task identifier; never reused within a boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

/// Scheduling priority. Stored, exposed, not yet used for selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Per-task scheduling policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Run until the task blocks or yields; no slice preemption.
    Fifo,
    /// Preempt when the time-slice budget is exhausted.
    RoundRobin,
}

/// Why a task sits on the blocked queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Explicit `block` call.
    Manual,
    /// Waiting on an IPC queue.
    Ipc,
}

/// A kernel stack handle: base of the mapping and its size. The initial
/// stack pointer is `base + size`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelStack {
    pub base: VirtAddr,
    pub size: usize,
}

impl KernelStack {
    #[must_use]
    pub const fn top(self) -> VirtAddr {
        VirtAddr::new(self.base.as_u64() + self.size as u64)
    }
}

/// Opaque saved machine state: the kernel stack pointer left behind by the
/// context-switch primitive.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct SavedContext(pub u64);

/// Entry point of a kernel task.
pub type TaskEntry = extern "C" fn();

/// The intrusive queues a task record can be linked on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Ready = 0,
    Blocked = 1,
    Sleeping = 2,
}

/// Link fields for one queue.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Link {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

/// One slot of the task table.
#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub name: &'static str,
    pub state: TaskState,
    pub priority: Priority,
    pub policy: Policy,
    /// Nominal budget granted on each dispatch, in ticks.
    pub slice_ticks: u32,
    /// Remaining budget of the current dispatch.
    pub remaining_ticks: u32,
    pub stack: Option<KernelStack>,
    /// Whether the scheduler allocated (and must release) the stack.
    pub owns_stack: bool,
    pub context: SavedContext,
    pub block_reason: Option<BlockReason>,
    pub created_at_ms: u64,
    pub last_scheduled_ms: u64,
    pub cpu_time_ms: u64,
    /// Wake deadline while on the sleeping queue.
    pub wake_at_ms: u64,
    /// Which queue the record is linked on; a task is on at most one.
    pub queued_on: Option<QueueKind>,
    /// ready / blocked / sleeping link fields.
    pub links: [Link; 3],
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: &'static str,
        priority: Priority,
        slice_ticks: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            name,
            state: TaskState::Ready,
            priority,
            policy: Policy::RoundRobin,
            slice_ticks,
            remaining_ticks: slice_ticks,
            stack: None,
            owns_stack: false,
            context: SavedContext::default(),
            block_reason: None,
            created_at_ms: now_ms,
            last_scheduled_ms: now_ms,
            cpu_time_ms: 0,
            wake_at_ms: 0,
            queued_on: None,
            links: [Link::default(); 3],
        }
    }
}
