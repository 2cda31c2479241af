//! # Kernel Export Surface
//!
//! The operations the monolithic layer programs against: memory, tasks,
//! IPC, terminal-driver hooks and introspection. Every entry point guards
//! on initialization and maps subsystem errors into [`KernelError`].
//!
//! The flag values of [`VmFlags`] (`Read=1, Write=2, Exec=4, User=8`) and
//! the destination tags are part of this contract.

use crate::init::KernelError;
use crate::mapper::phys;
use crate::state::{CPUS, IPC, KERNEL_SPACE, PMM, SCHED, VmStacks, idle_task};
use kernel_addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use kernel_ipc::{Destination, IpcError, MessageFlags, MessageType, RecvInfo, ServiceHandler, WaitOps};
use kernel_pmm::{PmmFrameSource, order_for_bytes};
use kernel_sched::{BlockReason, Priority, TaskEntry, TaskId};
use kernel_sync::SpinLock;
use kernel_vmem::VmFlags;
use log::warn;

fn ensure_init() -> Result<(), KernelError> {
    if crate::state::initialized() {
        Ok(())
    } else {
        Err(KernelError::NotInitialized)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Allocate one physical page.
///
/// # Errors
/// [`KernelError::NotInitialized`] or the allocator's failure.
pub fn alloc_page() -> Result<PhysAddr, KernelError> {
    ensure_init()?;
    let block = PMM.lock().alloc(&phys(), 0)?;
    Ok(block.base())
}

/// Return a page from [`alloc_page`]. Freeing the null page is a no-op.
pub fn free_page(page: PhysAddr) {
    if page == PhysAddr::NULL || ensure_init().is_err() {
        return;
    }
    PMM.lock().free(&phys(), page.frame(), 0);
}

/// Allocate a naturally-aligned block covering `n` pages (rounded up to a
/// power of two).
///
/// # Errors
/// [`KernelError::NotInitialized`] or the allocator's failure.
pub fn alloc_pages(n: usize) -> Result<PhysAddr, KernelError> {
    ensure_init()?;
    let order = order_for_bytes(n as u64 * PAGE_SIZE);
    let block = PMM.lock().alloc(&phys(), order)?;
    Ok(block.base())
}

/// Return a block from [`alloc_pages`] with the same `n`.
pub fn free_pages(base: PhysAddr, n: usize) {
    if base == PhysAddr::NULL || ensure_init().is_err() {
        return;
    }
    let order = order_for_bytes(n as u64 * PAGE_SIZE);
    PMM.lock().free(&phys(), base.frame(), order);
}

/// Allocate the smallest block covering `bytes` of physical memory.
///
/// # Errors
/// [`KernelError::NotInitialized`] or the allocator's failure.
pub fn alloc_bytes(bytes: u64) -> Result<PhysAddr, KernelError> {
    ensure_init()?;
    let block = PMM.lock().alloc_bytes(&phys(), bytes)?;
    Ok(block.base())
}

/// Return a block from [`alloc_bytes`] with the same `bytes`.
pub fn free_bytes(base: PhysAddr, bytes: u64) {
    if base == PhysAddr::NULL || ensure_init().is_err() {
        return;
    }
    PMM.lock().free(&phys(), base.frame(), order_for_bytes(bytes));
}

/// Map one page `vaddr → paddr` in the kernel address space.
///
/// # Errors
/// Initialization, canonicality, double-map and table-allocation failures.
pub fn map(vaddr: VirtAddr, paddr: PhysAddr, flags: VmFlags) -> Result<(), KernelError> {
    ensure_init()?;
    let m = phys();
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NotInitialized)?;
    let mut pmm = PMM.lock();
    let mut frames = PmmFrameSource::new(&mut pmm, &m);
    space.map_page(&m, &mut frames, vaddr, paddr, flags)?;
    Ok(())
}

/// Clear the mapping at `vaddr` in the kernel address space.
///
/// # Errors
/// Initialization and not-mapped failures.
pub fn unmap(vaddr: VirtAddr) -> Result<(), KernelError> {
    ensure_init()?;
    let m = phys();
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NotInitialized)?;
    space.unmap_page(&m, vaddr)?;
    Ok(())
}

/// Translate a kernel virtual address.
#[must_use]
pub fn translate(vaddr: VirtAddr) -> Option<PhysAddr> {
    if ensure_init().is_err() {
        return None;
    }
    let m = phys();
    let space = KERNEL_SPACE.lock();
    space.as_ref()?.translate(&m, vaddr)
}

/// Allocate `size` bytes of kernel virtual memory backed by fresh frames.
///
/// # Errors
/// Initialization, admission and out-of-memory failures.
pub fn vm_alloc(size: u64, flags: VmFlags) -> Result<VirtAddr, KernelError> {
    ensure_init()?;
    let m = phys();
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NotInitialized)?;
    let mut pmm = PMM.lock();
    let mut frames = PmmFrameSource::new(&mut pmm, &m);
    Ok(space.alloc(&m, &mut frames, size, flags)?)
}

/// Release a region from [`vm_alloc`].
///
/// # Errors
/// Initialization and argument failures.
pub fn vm_free(base: VirtAddr, size: u64) -> Result<(), KernelError> {
    ensure_init()?;
    let m = phys();
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NotInitialized)?;
    let mut pmm = PMM.lock();
    let mut frames = PmmFrameSource::new(&mut pmm, &m);
    space.free(&m, &mut frames, base, size)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Create a kernel task at [`Priority::Normal`].
///
/// # Errors
/// Initialization, table-full and stack-allocation failures.
pub fn create_task(entry: TaskEntry, name: &'static str) -> Result<TaskId, KernelError> {
    create_task_with_priority(entry, name, Priority::Normal)
}

/// Create a kernel task with an explicit priority.
///
/// # Errors
/// Initialization, table-full and stack-allocation failures.
pub fn create_task_with_priority(
    entry: TaskEntry,
    name: &'static str,
    priority: Priority,
) -> Result<TaskId, KernelError> {
    ensure_init()?;
    Ok(SCHED.lock_irq().create(&mut VmStacks, entry, name, priority)?)
}

/// Create a task on a caller-provided stack.
///
/// # Errors
/// Initialization and table-full failures.
pub fn create_thread(
    stack_base: VirtAddr,
    stack_size: usize,
    entry: TaskEntry,
) -> Result<TaskId, KernelError> {
    ensure_init()?;
    Ok(SCHED.lock_irq().create_thread(stack_base, stack_size, entry)?)
}

/// Start scheduling: creates the idle task and dispatches the first ready
/// task. On bare metal this does not return to the caller's context.
///
/// # Errors
/// Initialization and idle-creation failures.
pub fn start_scheduler() -> Result<(), KernelError> {
    ensure_init()?;
    Ok(SCHED.lock_irq().start(&mut VmStacks, idle_task)?)
}

/// Give up the rest of the current time slice.
pub fn yield_now() {
    SCHED.lock_irq().yield_now();
}

/// Park the current task for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    SCHED.lock_irq().sleep_ms(ms);
}

pub fn set_priority(id: TaskId, priority: Priority) {
    SCHED.lock_irq().set_priority(id, priority);
}

/// [`Priority::Low`] for unknown ids, per the sentinel contract.
#[must_use]
pub fn get_priority(id: TaskId) -> Priority {
    SCHED.lock_irq().get_priority(id)
}

/// The task currently holding this CPU.
#[must_use]
pub fn current_task() -> Option<TaskId> {
    SCHED.lock_irq().current()
}

/// Terminate a task (unknown ids are a no-op).
pub fn terminate(id: TaskId) {
    SCHED.lock_irq().terminate(&mut VmStacks, id);
}

/// Exit path of the task trampoline: terminate the current task and never
/// come back.
pub extern "C" fn task_exit() -> ! {
    if let Some(id) = current_task() {
        terminate(id);
    }
    // Only reached when the scheduler had nowhere to go; park the CPU.
    loop {
        kernel_arch::halt();
    }
}

/// Timer hook: advance scheduler time and preempt when the slice is gone.
/// Called from the timer interrupt on bare metal; hosted runs inject ticks
/// directly.
pub fn timer_tick() {
    let mut sched = SCHED.lock_irq();
    if sched.on_tick() {
        sched.schedule();
    }
}

// ---------------------------------------------------------------------------
// IPC
// ---------------------------------------------------------------------------

/// [`WaitOps`] double that keeps the lock order intact: the scheduler is
/// consulted once *before* the IPC critical section (caller identity,
/// clock), and wake-ups collected inside it are applied once *after* the
/// IPC and frame locks are released. The frame-allocator lock is therefore
/// never held while the scheduler lock is taken.
struct DeferredWait {
    current: Option<TaskId>,
    now: u64,
    // Broadcast can wake one receiver per service queue plus the system
    // queue's.
    wakes: [Option<TaskId>; kernel_ipc::MAX_SERVICES + 2],
    count: usize,
}

impl DeferredWait {
    fn snapshot() -> Self {
        let sched = SCHED.lock_irq();
        Self {
            current: sched.current(),
            now: sched.uptime_ms(),
            wakes: [None; kernel_ipc::MAX_SERVICES + 2],
            count: 0,
        }
    }

    /// Apply the collected wake-ups; call with no IPC or memory lock held.
    fn apply(&self) {
        for id in self.wakes.iter().take(self.count).flatten() {
            SCHED.lock_irq().unblock(*id);
        }
    }
}

impl WaitOps for DeferredWait {
    fn current(&mut self) -> Option<TaskId> {
        self.current
    }

    fn unblock(&mut self, id: TaskId) {
        if self.count < self.wakes.len() {
            self.wakes[self.count] = Some(id);
            self.count += 1;
        }
    }

    fn now_ms(&mut self) -> u64 {
        self.now
    }
}

/// Non-blocking data send.
///
/// # Errors
/// See [`send_message`].
pub fn send(dest: Destination<'_>, payload: &[u8]) -> Result<(), KernelError> {
    send_message(dest, payload, MessageType::Data, MessageFlags::NON_BLOCKING)
}

/// Send with explicit type and flags. A blocking send parks the caller
/// (outside the IPC lock) until the destination drains, then retries.
///
/// # Errors
/// [`IpcError::TooLarge`], [`IpcError::NoRoute`], [`IpcError::QueueFull`]
/// (non-blocking or no task context), [`IpcError::OutOfMemory`], wrapped in
/// [`KernelError`].
pub fn send_message(
    dest: Destination<'_>,
    payload: &[u8],
    mtype: MessageType,
    flags: MessageFlags,
) -> Result<(), KernelError> {
    ensure_init()?;
    let m = phys();
    let blocking =
        flags.contains(MessageFlags::BLOCKING) && !flags.contains(MessageFlags::NON_BLOCKING);

    loop {
        let mut wait = DeferredWait::snapshot();
        let attempt = {
            let mut ipc = IPC.lock();
            let mut pmm = PMM.lock();
            let mut frames = PmmFrameSource::new(&mut pmm, &m);
            ipc.send(&m, &mut frames, &mut wait, dest, payload, mtype, flags)
        };
        wait.apply();
        match attempt {
            Err(IpcError::QueueFull) if blocking => {
                let mut sched = SCHED.lock_irq();
                if !sched.can_block() {
                    return Err(IpcError::QueueFull.into());
                }
                // The send registered us as the waiting sender; park until
                // a receive drains the queue.
                sched.block(BlockReason::Ipc);
            }
            other => return Ok(other?),
        }
    }
}

/// Receive into `buf` from `src`.
///
/// `timeout_ms == 0` polls, `u64::MAX` waits indefinitely, anything else
/// parks the caller on the sleeping queue until a send arrives or the
/// deadline passes.
///
/// # Errors
/// [`IpcError::Empty`] (poll), [`IpcError::Timeout`],
/// [`IpcError::BufferTooSmall`], [`IpcError::NoRoute`], wrapped in
/// [`KernelError`].
pub fn recv(
    src: Destination<'_>,
    buf: &mut [u8],
    timeout_ms: u64,
) -> Result<RecvInfo, KernelError> {
    ensure_init()?;
    let m = phys();
    let deadline = (timeout_ms != 0 && timeout_ms != u64::MAX)
        .then(|| SCHED.lock_irq().uptime_ms().saturating_add(timeout_ms));

    loop {
        let mut wait = DeferredWait::snapshot();
        let attempt = {
            let mut ipc = IPC.lock();
            let mut pmm = PMM.lock();
            let mut frames = PmmFrameSource::new(&mut pmm, &m);
            ipc.recv(&m, &mut frames, &mut wait, src, buf, timeout_ms)
        };
        wait.apply();
        match attempt {
            Err(IpcError::Empty) if timeout_ms != 0 => {}
            other => return Ok(other?),
        }

        // Park outside the IPC lock; the next send (or the deadline) wakes
        // us.
        let mut sched = SCHED.lock_irq();
        let Some(current) = sched.current() else {
            return Err(IpcError::Timeout.into());
        };
        if !sched.can_block() {
            drop(sched);
            IPC.lock().clear_receiver(src, current);
            return Err(IpcError::Timeout.into());
        }
        match deadline {
            Some(dl) => {
                let now = sched.uptime_ms();
                if now >= dl {
                    drop(sched);
                    IPC.lock().clear_receiver(src, current);
                    return Err(IpcError::Timeout.into());
                }
                sched.sleep_ms(dl - now);
            }
            None => sched.block(BlockReason::Ipc),
        }
    }
}

/// Register a named service with its own queue.
///
/// # Errors
/// [`IpcError::AlreadyRegistered`], [`IpcError::RegistryFull`] or
/// [`IpcError::InvalidArgument`], wrapped in [`KernelError`].
pub fn register_handler(name: &str, handler: ServiceHandler) -> Result<(), KernelError> {
    ensure_init()?;
    Ok(IPC.lock().register_service(name, handler)?)
}

/// Look a service up by name.
///
/// # Errors
/// [`IpcError::NotFound`], wrapped in [`KernelError`].
pub fn lookup(name: &str) -> Result<ServiceHandler, KernelError> {
    ensure_init()?;
    Ok(IPC.lock().lookup_service(name)?)
}

/// Remove a service and drop its queued messages.
///
/// # Errors
/// [`IpcError::NotFound`], wrapped in [`KernelError`].
pub fn unregister_handler(name: &str) -> Result<(), KernelError> {
    ensure_init()?;
    let m = phys();
    let mut ipc = IPC.lock();
    let mut pmm = PMM.lock();
    let mut frames = PmmFrameSource::new(&mut pmm, &m);
    Ok(ipc.unregister_service(&m, &mut frames, name)?)
}

/// Broadcast to the system queue and every service queue; returns the
/// delivery count.
#[must_use]
pub fn broadcast(payload: &[u8], mtype: MessageType) -> usize {
    if ensure_init().is_err() {
        return 0;
    }
    let m = phys();
    let mut wait = DeferredWait::snapshot();
    let delivered = {
        let mut ipc = IPC.lock();
        let mut pmm = PMM.lock();
        let mut frames = PmmFrameSource::new(&mut pmm, &m);
        ipc.broadcast(&m, &mut frames, &mut wait, payload, mtype)
    };
    wait.apply();
    delivered
}

// ---------------------------------------------------------------------------
// Driver hooks and introspection
// ---------------------------------------------------------------------------

/// Sink the terminal driver installs for kernel output.
pub type TerminalWrite = fn(&[u8]);

/// Source the terminal driver installs for kernel input; returns the bytes
/// read.
pub type TerminalRead = fn(&mut [u8]) -> usize;

struct TerminalHooks {
    write: Option<TerminalWrite>,
    read: Option<TerminalRead>,
}

static TERMINAL: SpinLock<TerminalHooks> = SpinLock::new(TerminalHooks {
    write: None,
    read: None,
});

/// Install the terminal driver's entry points; later registrations replace
/// earlier ones.
pub fn register_terminal_driver(write: TerminalWrite, read: TerminalRead) {
    let mut hooks = TERMINAL.lock();
    if hooks.write.is_some() {
        warn!("kapi: replacing registered terminal driver");
    }
    hooks.write = Some(write);
    hooks.read = Some(read);
}

#[must_use]
pub fn get_terminal_write() -> Option<TerminalWrite> {
    TERMINAL.lock().write
}

#[must_use]
pub fn get_terminal_read() -> Option<TerminalRead> {
    TERMINAL.lock().read
}

/// Snapshot for `get_system_info`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub cpu_count: u32,
    pub initialized: bool,
}

/// Memory and CPU summary of the running kernel.
#[must_use]
pub fn get_system_info() -> SystemInfo {
    let stats = PMM.lock().stats();
    SystemInfo {
        mem_total: stats.total_frames * PAGE_SIZE,
        mem_free: stats.free_frames * PAGE_SIZE,
        cpu_count: CPUS.get().map_or(0, |t| t.count() as u32),
        initialized: crate::state::initialized(),
    }
}

/// Milliseconds since the scheduler tick source started; monotonically
/// non-decreasing.
#[must_use]
pub fn get_uptime() -> u64 {
    SCHED.lock_irq().uptime_ms()
}

/// Ask a remote CPU to park itself.
///
/// # Errors
/// [`SmpError::InvalidCpu`] via [`KernelError`] for unknown ids; a no-op
/// without a programmed LAPIC (hosted runs).
pub fn stop_cpu(cpu_id: u32) -> Result<(), KernelError> {
    ensure_init()?;
    let cpus = CPUS.get().ok_or(KernelError::NotInitialized)?;
    let target = cpus.get(cpu_id).ok_or(kernel_smp::SmpError::InvalidCpu)?;
    let apic_id = target.apic_id;
    if let Some(lapic) = crate::state::LAPIC.lock_irq().as_mut() {
        lapic.stop_cpu(apic_id, crate::interrupts::STOP_VECTOR);
    }
    Ok(())
}
