//! # Virtual Memory: Page Tables, Address Spaces and the VMM
//!
//! Four-level x86-64 paging for the kernel core.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Each canonical 48-bit virtual address splits into four 9-bit table
//! indices plus a 12-bit page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The walk descends `PML4 → PDPT → PD → PT`; every level is a 4 KiB table
//! of 512 [`PageTableEntry`] values. Only 4 KiB leaves are installed
//! here; huge pages stay out of scope.
//!
//! ## Layers
//!
//! - [`PageTableEntry`] / [`PageTable`]: the 64-bit entry encoding.
//! - [`AddressSpace`]: one PML4-rooted tree. Raw `map_page` / `unmap_page` /
//!   `translate` / `walk`, kernel-half sharing, CR3 activation, full
//!   teardown with frame reclaim.
//! - [`AddressSpace::alloc`] / [`AddressSpace::free`]: the virtual memory
//!   manager proper: admission checks, a per-space free-range table, frame
//!   backing via [`FrameAlloc`], and unwind on partial failure.
//!
//! ## Trait seams
//!
//! Physical memory is only touched through [`PhysAccess`] (phys → pointer in
//! the current mapping) and frames only come from [`FrameAlloc`]. Both are
//! implemented by the real allocator stack on bare metal and by in-memory
//! arenas in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod entry;
mod flags;
mod ranges;

pub use address_space::{AddressSpace, SpaceKind, VmmError};
pub use entry::{MapError, PageTable, PageTableEntry, WalkError};
pub use flags::VmFlags;

use kernel_addr::{FrameNumber, PhysAddr};

/// Source of 4 KiB physical frames (page-table pages, allocation backing,
/// message frames) plus the counters the admission rules consult.
pub trait FrameAlloc {
    /// Allocate one frame. Contents are undefined; page-table code zeroes
    /// what it needs. `None` on out-of-memory.
    fn alloc_frame(&mut self) -> Option<FrameNumber>;

    /// Return a frame previously handed out by [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: FrameNumber);

    /// Frames under management in total.
    fn total_frames(&self) -> u64;

    /// Frames currently free.
    fn free_frames(&self) -> u64;
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (identity mapping early on, the higher-half direct map once
/// the kernel tables are live, a plain buffer in tests).
pub trait PhysAccess {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped and writable in the current address space for
    ///   the lifetime `'a`.
    /// - The bytes at `pa` must be a valid `T`; no other alias may be live.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}

/// Borrow the page table stored in `frame`.
///
/// # Safety
/// `frame` must hold a (possibly zeroed) page table, writable via `m`.
#[inline]
pub(crate) unsafe fn table_mut<'a, M: PhysAccess>(m: &M, frame: FrameNumber) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}
