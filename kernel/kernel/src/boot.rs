//! # Boot Contract

use kernel_addr::{FrameNumber, VirtAddr};
use kernel_pmm::MemoryRegion;

/// Everything the boot stage hands to [`init`](crate::init::init).
///
/// The boot code owns the multiboot parsing and the early environment; the
/// kernel core only needs the memory map, the page-table root it is already
/// running on (if paging is up), and the boot stack for diagnostics.
#[derive(Debug, Copy, Clone)]
pub struct BootInfo<'a> {
    /// Firmware memory map; only `Available` entries contribute frames.
    pub memory_map: &'a [MemoryRegion],

    /// PML4 the boot stage installed (CR3 at handoff), adopted as the
    /// kernel address space. `None` means no usable tree was handed over
    /// and the kernel builds a fresh one.
    pub page_table_root: Option<FrameNumber>,

    /// Top of the stack the boot stage is running the initializer on.
    pub boot_stack_top: VirtAddr,
}
