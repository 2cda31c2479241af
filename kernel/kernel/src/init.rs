//! # Ordered Bring-Up
//!
//! `PFA → VMM (+ kernel heap) → SMP → scheduler → IPC`, per the dependency
//! order of the subsystems: the page-table and heap pages come from the
//! frame allocator, the timer needs the APIC, the scheduler needs VMM
//! stacks, and messages need frames.

use crate::mapper::phys;
use crate::state::{CPUS, INITIALIZED, IPC, KERNEL_SPACE, PMM, SCHED};
use crate::{boot::BootInfo, logger};
use core::sync::atomic::Ordering;
use kernel_ipc::IpcError;
use kernel_pmm::{PmmError, PmmFrameSource};
use kernel_sched::SchedError;
use kernel_smp::{BootCpuid, SmpError, discover};
use kernel_vmem::{AddressSpace, MapError, VmmError, WalkError};
use log::info;

/// Top-level error of the kernel export surface: the subsystem failures
/// plus the pre-init guard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("kernel core is not initialized")]
    NotInitialized,
    #[error("kernel core is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Frames(#[from] PmmError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Smp(#[from] SmpError),
}

/// Whether [`init`] has completed.
#[must_use]
pub fn is_initialized() -> bool {
    crate::state::initialized()
}

/// Bring the kernel core up from the boot handoff.
///
/// After this returns, the memory exports are live and
/// [`start_scheduler`](crate::kapi::start_scheduler) may be called; on bare
/// metal the periodic timer is armed and starts delivering ticks as soon as
/// interrupts are enabled.
///
/// # Errors
/// [`KernelError::AlreadyInitialized`] on a second call, otherwise the
/// failing subsystem's error.
pub fn init(boot: &BootInfo<'_>) -> Result<(), KernelError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(KernelError::AlreadyInitialized);
    }
    logger::init();
    let m = phys();

    // The frame allocator owns all usable physical memory.
    PMM.lock().set_memory_map(&m, boot.memory_map);

    // The kernel address space, adopted from the boot stage or built
    // fresh.
    let space = match boot.page_table_root {
        Some(root) => AddressSpace::adopt_kernel(root),
        None => {
            let mut pmm = PMM.lock();
            let mut frames = PmmFrameSource::new(&mut pmm, &m);
            AddressSpace::new_kernel(&m, &mut frames)?
        }
    };
    *KERNEL_SPACE.lock() = Some(space);

    // The byte heap lives in a VMM region; only bare metal can touch the
    // mapped addresses.
    #[cfg(target_os = "none")]
    init_heap()?;

    // CPU discovery, Local APIC, IO APIC, timer.
    let cpus = discover(&BootCpuid)?;
    let cpu_count = cpus.count();
    let _ = CPUS.set(cpus);
    #[cfg(target_os = "none")]
    init_interrupt_controllers();

    // The scheduler and the IPC router are statics; scheduling starts
    // explicitly via `kapi::start_scheduler`, the router is live now.
    debug_assert!(!SCHED.lock_irq().is_started());
    debug_assert!(IPC.lock().depth(kernel_ipc::Destination::System).is_some());

    info!("kernel: core initialized ({cpu_count} CPUs)");
    Ok(())
}

#[cfg(target_os = "none")]
fn init_heap() -> Result<(), KernelError> {
    use kernel_addr::layout::KERNEL_HEAP_SIZE;
    use kernel_vmem::VmFlags;

    let m = phys();
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NotInitialized)?;
    let mut pmm = PMM.lock();
    let mut frames = PmmFrameSource::new(&mut pmm, &m);
    let base = space.alloc(&m, &mut frames, KERNEL_HEAP_SIZE, VmFlags::KERNEL_DATA)?;
    unsafe {
        crate::state::HEAP.init(base.as_u64() as usize, KERNEL_HEAP_SIZE as usize);
    }
    Ok(())
}

#[cfg(target_os = "none")]
fn init_interrupt_controllers() {
    use crate::interrupts::{SPURIOUS_VECTOR, TIMER_VECTOR, init_idt};
    use kernel_addr::VirtAddr;
    use kernel_addr::layout::{HHDM_BASE, TICK_HZ};
    use kernel_smp::{IoApic, LAPIC_DEFAULT_BASE, LocalApic, MmioRegs};

    // Assumed APIC timer input clock; QEMU and most chipsets feed the
    // bus clock here.
    // TODO: calibrate against the TSC (CPUID leaf 15H) instead of assuming.
    const APIC_TIMER_HZ: u64 = 1_000_000_000;

    const IOAPIC_DEFAULT_BASE: u64 = 0xFEC0_0000;

    init_idt();

    let regs = unsafe { MmioRegs::new(VirtAddr::new(HHDM_BASE + LAPIC_DEFAULT_BASE)) };
    let mut lapic = LocalApic::new(regs);
    lapic.enable(SPURIOUS_VECTOR);
    lapic.timer_periodic(TIMER_VECTOR, APIC_TIMER_HZ, TICK_HZ);
    *crate::state::LAPIC.lock_irq() = Some(lapic);

    let io_regs = unsafe { MmioRegs::new(VirtAddr::new(HHDM_BASE + IOAPIC_DEFAULT_BASE)) };
    IoApic::new(io_regs).mask_all();
}
