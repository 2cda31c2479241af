//! # Process-Wide Kernel State
//!
//! The singletons of the kernel core, each behind its component-owned lock.
//! They exist from [`init`](crate::init::init) to shutdown; accessors in
//! [`kapi`](crate::kapi) surface `NotInitialized` before that.

use crate::mapper::phys;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_addr::VirtAddr;
use kernel_heap::KernelHeap;
use kernel_ipc::Ipc;
use kernel_pmm::{BuddyAllocator, PmmFrameSource};
use kernel_sched::{
    ContextOps, KernelStack, SavedContext, Scheduler, StackProvider, TaskEntry,
};
use kernel_smp::{CpuTable, LocalApic, MmioRegs};
use kernel_sync::{OnceLock, SpinLock};
use kernel_vmem::{AddressSpace, VmFlags};

/// Physical frame allocator (C1). Leaf lock.
pub(crate) static PMM: SpinLock<BuddyAllocator> = SpinLock::new(BuddyAllocator::new());

/// The kernel address space (C2/C3); `None` before init.
pub(crate) static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

/// The scheduler (C4). Interrupt-safe lock; always acquire with `lock_irq`.
pub(crate) static SCHED: SpinLock<Scheduler<KernelContextOps>> =
    SpinLock::new(Scheduler::new(KernelContextOps));

/// The IPC router (C5). Outermost lock of the hierarchy.
pub(crate) static IPC: SpinLock<Ipc> = SpinLock::new(Ipc::new());

/// Discovered CPU topology (C6).
pub(crate) static CPUS: OnceLock<CpuTable> = OnceLock::new();

/// The BSP's local APIC once programmed (bare metal only).
pub(crate) static LAPIC: SpinLock<Option<LocalApic<MmioRegs>>> = SpinLock::new(None);

/// The kernel byte heap; serves as the global allocator on bare metal.
/// Hosted builds keep the host allocator and never initialize it.
#[cfg_attr(target_os = "none", global_allocator)]
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
pub(crate) static HEAP: KernelHeap = KernelHeap::new();

pub(crate) static INITIALIZED: AtomicBool = AtomicBool::new(false);

pub(crate) fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Context operations of the real kernel: build initial frames and switch
/// stacks on bare metal, stay inert on hosted builds (where the stack
/// addresses are fictional).
pub(crate) struct KernelContextOps;

impl ContextOps for KernelContextOps {
    #[cfg(target_os = "none")]
    fn prepare(&mut self, stack_top: VirtAddr, entry: TaskEntry) -> SavedContext {
        // The trampoline passes one argument register; a plain entry fn
        // simply ignores it.
        let entry: extern "C" fn(usize) = unsafe { core::mem::transmute(entry) };
        let sp = unsafe {
            kernel_arch::init_stack_frame(
                stack_top.as_u64() as *mut u8,
                entry,
                0,
                first_dispatch,
                crate::kapi::task_exit,
            )
        };
        SavedContext(sp)
    }

    #[cfg(not(target_os = "none"))]
    fn prepare(&mut self, stack_top: VirtAddr, entry: TaskEntry) -> SavedContext {
        let _ = entry;
        SavedContext(stack_top.as_u64())
    }

    #[cfg(target_os = "none")]
    fn switch(&mut self, old: *mut SavedContext, new: SavedContext) {
        unsafe { kernel_arch::switch_stacks(old.cast::<u64>(), new.0) }
    }

    #[cfg(not(target_os = "none"))]
    fn switch(&mut self, old: *mut SavedContext, new: SavedContext) {
        let _ = (old, new);
    }
}

/// Kernel stacks come from the VMM: mapped, writable, supervisor-only.
pub(crate) struct VmStacks;

impl StackProvider for VmStacks {
    fn allocate(&mut self, size: usize) -> Option<KernelStack> {
        let m = phys();
        let mut space = KERNEL_SPACE.lock();
        let space = space.as_mut()?;
        let mut pmm = PMM.lock();
        let mut frames = PmmFrameSource::new(&mut pmm, &m);
        let base = space
            .alloc(&m, &mut frames, size as u64, VmFlags::KERNEL_DATA)
            .ok()?;
        Some(KernelStack { base, size })
    }

    fn release(&mut self, stack: KernelStack) {
        let m = phys();
        let mut space = KERNEL_SPACE.lock();
        let Some(space) = space.as_mut() else { return };
        let mut pmm = PMM.lock();
        let mut frames = PmmFrameSource::new(&mut pmm, &m);
        let _ = space.free(&m, &mut frames, stack.base, stack.size as u64);
    }
}

/// Lock-handoff release for freshly dispatched tasks: the scheduler lock is
/// still held by the context that switched here and a fresh task has no
/// guard to drop.
#[cfg(target_os = "none")]
extern "C" fn first_dispatch() {
    // Safety: runs exactly once per fresh task, as the logical owner of the
    // dispatching context's acquisition.
    unsafe { SCHED.force_unlock() }
}

/// Idle body: halt until the next interrupt, forever.
pub(crate) extern "C" fn idle_task() {
    loop {
        kernel_arch::halt();
    }
}
