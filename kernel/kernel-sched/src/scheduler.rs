//! # The Scheduler

use crate::queue::TaskQueue;
use crate::task::{
    BlockReason, KernelStack, Policy, Priority, QueueKind, SavedContext, Task, TaskEntry, TaskId,
    TaskState,
};
use kernel_addr::VirtAddr;
use kernel_addr::layout::{DEFAULT_SLICE_TICKS, DEFAULT_STACK_SIZE, TICK_HZ};
use log::{info, trace};

/// Capacity of the task table.
pub const MAX_TASKS: usize = 256;

pub(crate) type Slots = [Option<Task>; MAX_TASKS];

/// Context-switch seam: building the initial saved state of a task and
/// performing the actual stack switch.
pub trait ContextOps {
    /// Build the saved context a fresh task starts from.
    fn prepare(&mut self, stack_top: VirtAddr, entry: TaskEntry) -> SavedContext;

    /// Save the outgoing state through `old` and resume `new`.
    ///
    /// Implementations on bare metal never "return" in the ordinary sense:
    /// control continues in the incoming task's saved frame, and comes back
    /// here only when this task is dispatched again.
    fn switch(&mut self, old: *mut SavedContext, new: SavedContext);
}

/// Kernel-stack source, implemented by the VMM on bare metal.
pub trait StackProvider {
    fn allocate(&mut self, size: usize) -> Option<KernelStack>;
    fn release(&mut self, stack: KernelStack);
}

/// Task-creation failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// All 256 task slots hold live tasks.
    #[error("task table is full")]
    TableFull,
    /// The kernel stack could not be allocated; no slot was consumed.
    #[error("out of memory for kernel stack")]
    OutOfMemory,
}

/// Introspection snapshot of one task record.
#[derive(Debug, Copy, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: &'static str,
    pub state: TaskState,
    pub priority: Priority,
    pub policy: Policy,
    pub created_at_ms: u64,
    pub cpu_time_ms: u64,
    pub block_reason: Option<BlockReason>,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedStats {
    /// Live (non-terminated) tasks, the idle task included.
    pub tasks: usize,
    pub context_switches: u64,
    pub preemptions: u64,
    pub ticks: u64,
    pub uptime_ms: u64,
}

/// The task table, the three queues and the dispatch logic.
///
/// Every public entry point runs under the owner's interrupt-safe lock; the
/// lock is handed across [`ContextOps::switch`] and released by the incoming
/// task's guard.
pub struct Scheduler<C: ContextOps> {
    slots: Slots,
    ready: TaskQueue,
    blocked: TaskQueue,
    sleeping: TaskQueue,
    current: Option<usize>,
    idle: Option<usize>,
    next_id: u64,
    running: bool,
    ticks: u64,
    need_resched: bool,
    context_switches: u64,
    preemptions: u64,
    boot_context: SavedContext,
    ops: C,
}

impl<C: ContextOps> Scheduler<C> {
    pub const fn new(ops: C) -> Self {
        Self {
            slots: [const { None }; MAX_TASKS],
            ready: TaskQueue::new(QueueKind::Ready),
            blocked: TaskQueue::new(QueueKind::Blocked),
            sleeping: TaskQueue::new(QueueKind::Sleeping),
            current: None,
            idle: None,
            next_id: 1,
            running: false,
            ticks: 0,
            need_resched: false,
            context_switches: 0,
            preemptions: 0,
            boot_context: SavedContext(0),
            ops,
        }
    }

    /// Create a task with a scheduler-owned kernel stack, linked at the
    /// ready tail.
    ///
    /// # Errors
    /// [`SchedError::TableFull`] or [`SchedError::OutOfMemory`]; neither
    /// consumes a slot.
    pub fn create<S: StackProvider>(
        &mut self,
        stacks: &mut S,
        entry: TaskEntry,
        name: &'static str,
        priority: Priority,
    ) -> Result<TaskId, SchedError> {
        let stack = stacks
            .allocate(DEFAULT_STACK_SIZE)
            .ok_or(SchedError::OutOfMemory)?;
        match self.admit(entry, name, priority, stack, true) {
            Ok(id) => Ok(id),
            Err(err) => {
                stacks.release(stack);
                Err(err)
            }
        }
    }

    /// Create a task on a caller-provided stack. The stack stays the
    /// caller's to reclaim after termination.
    ///
    /// # Errors
    /// [`SchedError::TableFull`].
    pub fn create_thread(
        &mut self,
        stack_base: VirtAddr,
        stack_size: usize,
        entry: TaskEntry,
    ) -> Result<TaskId, SchedError> {
        let stack = KernelStack {
            base: stack_base,
            size: stack_size,
        };
        self.admit(entry, "thread", Priority::Normal, stack, false)
    }

    fn admit(
        &mut self,
        entry: TaskEntry,
        name: &'static str,
        priority: Priority,
        stack: KernelStack,
        owns_stack: bool,
    ) -> Result<TaskId, SchedError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_none_or(|t| t.state == TaskState::Terminated))
            .ok_or(SchedError::TableFull)?;

        let id = TaskId::new(self.next_id);
        self.next_id += 1;

        let now = self.uptime_ms();
        let mut task = Task::new(id, name, priority, DEFAULT_SLICE_TICKS, now);
        task.context = self.ops.prepare(stack.top(), entry);
        task.stack = Some(stack);
        task.owns_stack = owns_stack;
        self.slots[slot] = Some(task);
        self.ready.push_back(&mut self.slots, slot);

        trace!("sched: created {name} {id}");
        Ok(id)
    }

    /// Bring the scheduler up: create the idle task (lowest priority, off
    /// the ready queue), flip the running flag and dispatch the first ready
    /// task. On bare metal this call does not return to the boot context.
    ///
    /// # Errors
    /// Propagates idle-task creation failures.
    pub fn start<S: StackProvider>(
        &mut self,
        stacks: &mut S,
        idle_entry: TaskEntry,
    ) -> Result<(), SchedError> {
        if self.running {
            return Ok(());
        }
        let id = self.create(stacks, idle_entry, "idle", Priority::Low)?;
        let idx = self.index_of(id).expect("idle just created");
        self.ready.remove(&mut self.slots, idx);
        self.idle = Some(idx);
        self.running = true;
        info!("sched: started");
        self.schedule();
        Ok(())
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.running
    }

    /// Give up the remainder of the slice and requeue at the ready tail.
    pub fn yield_now(&mut self) {
        let Some(cur) = self.current else { return };
        if let Some(t) = self.slots[cur].as_mut() {
            t.remaining_ticks = 0;
        }
        self.schedule();
    }

    /// Pick the next ready task and switch to it.
    ///
    /// The outgoing task (when still Running) goes to the ready tail; with
    /// an empty ready queue a Running task simply continues with a fresh
    /// budget, and the idle task fills in when nothing can run.
    pub fn schedule(&mut self) {
        if !self.running {
            return;
        }

        let next = match self.ready.pop_front(&mut self.slots) {
            Some(idx) => idx,
            None => {
                let current_runs = self.current.is_some_and(|cur| {
                    self.slots[cur]
                        .as_ref()
                        .is_some_and(|t| t.state == TaskState::Running)
                });
                if current_runs {
                    if let Some(t) = self.current.and_then(|cur| self.slots[cur].as_mut()) {
                        t.remaining_ticks = t.slice_ticks;
                    }
                    self.need_resched = false;
                    return;
                }
                let Some(idle) = self.idle else { return };
                idle
            }
        };

        if Some(next) == self.current {
            self.need_resched = false;
            return;
        }

        let now = self.uptime_ms();

        // Account and requeue the outgoing task.
        if let Some(cur) = self.current {
            let requeue = {
                let t = self.slots[cur].as_mut().expect("current slot live");
                t.cpu_time_ms += now.saturating_sub(t.last_scheduled_ms);
                if t.state == TaskState::Running {
                    t.state = TaskState::Ready;
                    true
                } else {
                    false
                }
            };
            if requeue && Some(cur) != self.idle {
                self.ready.push_back(&mut self.slots, cur);
            }
        }

        let old = match self.current {
            Some(cur) => {
                let t = self.slots[cur].as_mut().expect("current slot live");
                core::ptr::from_mut(&mut t.context)
            }
            None => core::ptr::from_mut(&mut self.boot_context),
        };

        let new = {
            let t = self.slots[next].as_mut().expect("next slot live");
            t.state = TaskState::Running;
            t.remaining_ticks = t.slice_ticks;
            t.last_scheduled_ms = now;
            t.context
        };

        self.current = Some(next);
        self.need_resched = false;
        self.context_switches += 1;
        self.ops.switch(old, new);
    }

    /// Timer hook: advance time, wake due sleepers, burn the running task's
    /// budget. Returns whether a reschedule is requested.
    pub fn on_tick(&mut self) -> bool {
        if !self.running {
            self.ticks += 1;
            return false;
        }
        self.ticks += 1;
        let now = self.uptime_ms();

        // Sweep the sleeping queue for due wake-ups.
        let mut cursor = self.sleeping.head();
        while let Some(idx) = cursor {
            cursor = self.sleeping.next_of(&self.slots, idx);
            let due = self.slots[idx]
                .as_ref()
                .is_some_and(|t| t.wake_at_ms <= now);
            if due {
                self.sleeping.remove(&mut self.slots, idx);
                if let Some(t) = self.slots[idx].as_mut() {
                    t.state = TaskState::Ready;
                    t.block_reason = None;
                }
                self.ready.push_back(&mut self.slots, idx);
                self.need_resched = true;
            }
        }

        // Burn the budget of the running task.
        if let Some(cur) = self.current {
            if Some(cur) == self.idle {
                if self.ready.len() > 0 {
                    self.need_resched = true;
                }
            } else if let Some(t) = self.slots[cur].as_mut() {
                if t.policy == Policy::RoundRobin
                    && t.state == TaskState::Running
                    && t.remaining_ticks > 0
                {
                    t.remaining_ticks -= 1;
                    if t.remaining_ticks == 0 {
                        self.need_resched = true;
                        self.preemptions += 1;
                    }
                }
            }
        }

        self.need_resched
    }

    /// Move the current task to the sleeping queue until `ms` milliseconds
    /// from now, then dispatch another task.
    pub fn sleep_ms(&mut self, ms: u64) {
        let Some(cur) = self.current else { return };
        if Some(cur) == self.idle {
            return;
        }
        if ms == 0 {
            self.yield_now();
            return;
        }
        let wake = self.uptime_ms() + ms;
        if let Some(t) = self.slots[cur].as_mut() {
            t.state = TaskState::Sleeping;
            t.wake_at_ms = wake;
        }
        self.sleeping.push_back(&mut self.slots, cur);
        self.schedule();
    }

    /// Block the current task and dispatch another.
    pub fn block(&mut self, reason: BlockReason) {
        let Some(cur) = self.current else { return };
        if Some(cur) == self.idle {
            return;
        }
        if let Some(t) = self.slots[cur].as_mut() {
            t.state = TaskState::Blocked;
            t.block_reason = Some(reason);
        }
        self.blocked.push_back(&mut self.slots, cur);
        self.schedule();
    }

    /// Make a blocked or sleeping task ready again. Unknown ids are a no-op.
    pub fn unblock(&mut self, id: TaskId) {
        let Some(idx) = self.index_of(id) else { return };
        let state = self.slots[idx].as_ref().map(|t| t.state);
        match state {
            Some(TaskState::Blocked) => self.blocked.remove(&mut self.slots, idx),
            Some(TaskState::Sleeping) => self.sleeping.remove(&mut self.slots, idx),
            _ => return,
        }
        if let Some(t) = self.slots[idx].as_mut() {
            t.state = TaskState::Ready;
            t.block_reason = None;
        }
        self.ready.push_back(&mut self.slots, idx);
        self.need_resched = true;
    }

    /// Terminate a task: unlink it from every queue, release its stack (when
    /// scheduler-owned) and retire the id. Unknown ids are a no-op.
    /// Terminating the current task dispatches the next one.
    pub fn terminate<S: StackProvider>(&mut self, stacks: &mut S, id: TaskId) {
        let Some(idx) = self.index_of(id) else { return };

        self.ready.remove(&mut self.slots, idx);
        self.blocked.remove(&mut self.slots, idx);
        self.sleeping.remove(&mut self.slots, idx);

        let stack = {
            let t = self.slots[idx].as_mut().expect("slot live");
            t.state = TaskState::Terminated;
            if t.owns_stack { t.stack.take() } else { None }
        };
        if let Some(stack) = stack {
            stacks.release(stack);
        }
        trace!("sched: terminated {id}");

        if self.current == Some(idx) {
            // The record stays in the slot (ids retire, slots recycle), so
            // the outgoing context has a valid place to be saved into.
            self.schedule();
        }
    }

    pub fn set_priority(&mut self, id: TaskId, priority: Priority) {
        if let Some(t) = self.index_of(id).and_then(|idx| self.slots[idx].as_mut()) {
            t.priority = priority;
        }
    }

    /// Sentinel [`Priority::Low`] for unknown or retired ids.
    #[must_use]
    pub fn get_priority(&self, id: TaskId) -> Priority {
        self.index_of(id)
            .and_then(|idx| self.slots[idx].as_ref())
            .map_or(Priority::Low, |t| t.priority)
    }

    /// Replace a task's nominal time slice (and current budget).
    pub fn set_time_slice(&mut self, id: TaskId, ticks: u32) {
        if let Some(t) = self.index_of(id).and_then(|idx| self.slots[idx].as_mut()) {
            t.slice_ticks = ticks;
            t.remaining_ticks = ticks;
        }
    }

    pub fn set_policy(&mut self, id: TaskId, policy: Policy) {
        if let Some(t) = self.index_of(id).and_then(|idx| self.slots[idx].as_mut()) {
            t.policy = policy;
        }
    }

    /// Whether the caller runs in a context that may suspend: the scheduler
    /// is started and the CPU is not held by the idle task.
    #[must_use]
    pub fn can_block(&self) -> bool {
        self.running && self.current.is_some() && self.current != self.idle
    }

    /// Id of the task currently holding the CPU.
    #[must_use]
    pub fn current(&self) -> Option<TaskId> {
        self.current
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|t| t.id)
    }

    /// Live (non-terminated) tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|t| t.state != TaskState::Terminated)
            .count()
    }

    #[must_use]
    pub const fn uptime_ms(&self) -> u64 {
        self.ticks * 1000 / TICK_HZ
    }

    #[must_use]
    pub fn stats(&self) -> SchedStats {
        SchedStats {
            tasks: self.count(),
            context_switches: self.context_switches,
            preemptions: self.preemptions,
            ticks: self.ticks,
            uptime_ms: self.uptime_ms(),
        }
    }

    /// Accumulated CPU time of a task, in milliseconds.
    #[must_use]
    pub fn cpu_time_ms(&self, id: TaskId) -> u64 {
        self.index_of(id)
            .and_then(|idx| self.slots[idx].as_ref())
            .map_or(0, |t| t.cpu_time_ms)
    }

    /// State of a task; `None` for unknown or retired ids.
    #[must_use]
    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.index_of(id)
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|t| t.state)
    }

    /// Introspection snapshot of one task.
    #[must_use]
    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.index_of(id)
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|t| TaskInfo {
                id: t.id,
                name: t.name,
                state: t.state,
                priority: t.priority,
                policy: t.policy,
                created_at_ms: t.created_at_ms,
                cpu_time_ms: t.cpu_time_ms,
                block_reason: t.block_reason,
            })
    }

    fn index_of(&self, id: TaskId) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|t| t.id == id && t.state != TaskState::Terminated)
        })
    }
}
