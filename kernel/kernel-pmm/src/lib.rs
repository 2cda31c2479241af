//! # Physical Frame Allocator
//!
//! A power-of-two buddy allocator over 4 KiB frames. A *block of order `k`*
//! is `2^k` contiguous frames aligned on a `2^k`-frame boundary; the buddy of
//! a block is found by flipping bit `k` of its frame number, so split and
//! coalesce are constant-address-math walks.
//!
//! One free list per order, `0..=MAX_ORDER`. Free blocks carry a small
//! header (`next` link and their order) in the frame memory itself, reached
//! through the [`PhysAccess`] seam, so the allocator struct stays a fixed-size
//! table of list heads and counters. Allocated blocks carry no metadata at
//! all, which is why `free` must be called with the order used at `alloc`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod buddy;
mod region;

pub use buddy::{BuddyAllocator, MAX_ORDER, PmmError, PmmStats, order_for_bytes};
pub use region::{MemoryRegion, MemoryRegionKind};

use kernel_vmem::{FrameAlloc, PhysAccess};

/// Adapter binding a [`BuddyAllocator`] to a [`PhysAccess`] implementation
/// so it can serve the [`FrameAlloc`] seam (page tables, stacks, message
/// frames all draw single frames through this).
pub struct PmmFrameSource<'a, M: PhysAccess> {
    pmm: &'a mut BuddyAllocator,
    mapper: &'a M,
}

impl<'a, M: PhysAccess> PmmFrameSource<'a, M> {
    pub fn new(pmm: &'a mut BuddyAllocator, mapper: &'a M) -> Self {
        Self { pmm, mapper }
    }
}

impl<M: PhysAccess> FrameAlloc for PmmFrameSource<'_, M> {
    fn alloc_frame(&mut self) -> Option<kernel_addr::FrameNumber> {
        self.pmm.alloc(self.mapper, 0).ok()
    }

    fn free_frame(&mut self, frame: kernel_addr::FrameNumber) {
        self.pmm.free(self.mapper, frame, 0);
    }

    fn total_frames(&self) -> u64 {
        self.pmm.stats().total_frames
    }

    fn free_frames(&self) -> u64 {
        self.pmm.stats().free_frames
    }
}
