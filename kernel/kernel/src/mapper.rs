//! # Physical Memory Access
//!
//! The kernel's [`PhysAccess`] implementation. On bare metal physical
//! memory is visible through the higher-half direct map installed by the
//! boot stage; hosted builds substitute a fixed in-process arena so the
//! same init and allocation paths run under the test suite.

use kernel_addr::PhysAddr;
use kernel_vmem::PhysAccess;

#[cfg(target_os = "none")]
mod imp {
    use super::{PhysAccess, PhysAddr};
    use kernel_addr::layout::HHDM_BASE;

    /// Physical access through the higher-half direct map.
    #[derive(Copy, Clone)]
    pub struct KernelPhys;

    impl PhysAccess for KernelPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let va = HHDM_BASE + pa.as_u64();
            unsafe { &mut *(va as *mut T) }
        }
    }

    /// Unused on bare metal; kept so the boot-contract surface is uniform.
    pub const SIM_MEMORY_BYTES: u64 = 0;
}

#[cfg(not(target_os = "none"))]
mod imp {
    use super::{PhysAccess, PhysAddr};
    use core::cell::UnsafeCell;

    const SIM_FRAMES: usize = 2048;

    /// Simulated physical RAM for hosted runs: frame `n` is backed by the
    /// `n`-th page of this arena.
    pub const SIM_MEMORY_BYTES: u64 = (SIM_FRAMES as u64) * 4096;

    #[repr(C, align(4096))]
    struct Arena(UnsafeCell<[u8; SIM_FRAMES * 4096]>);

    // Safety: access is serialized by the component locks, exactly like
    // real physical memory.
    unsafe impl Sync for Arena {}

    static ARENA: Arena = Arena(UnsafeCell::new([0; SIM_FRAMES * 4096]));

    /// Physical access into the simulated arena.
    #[derive(Copy, Clone)]
    pub struct KernelPhys;

    impl PhysAccess for KernelPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let offset = pa.as_u64() as usize;
            assert!(
                offset + size_of::<T>() <= SIM_FRAMES * 4096,
                "physical address {pa} outside the simulated arena"
            );
            let base = ARENA.0.get().cast::<u8>();
            unsafe { &mut *base.add(offset).cast::<T>() }
        }
    }
}

pub use imp::SIM_MEMORY_BYTES;
pub(crate) use imp::KernelPhys;

/// The kernel's physical-access handle (zero-sized; copy freely).
pub(crate) const fn phys() -> KernelPhys {
    KernelPhys
}
