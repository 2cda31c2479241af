//! # Buddy Allocator

use crate::region::{MemoryRegion, MemoryRegionKind};
use kernel_addr::{FrameNumber, PAGE_SIZE, pages_for};
use kernel_vmem::PhysAccess;
use log::{info, warn};

/// Largest supported block order: `2^20` frames (4 GiB).
pub const MAX_ORDER: usize = 20;

/// Defensive cap on a single request, in bytes.
const MAX_REQUEST_BYTES: u64 = 100 * 1024 * 1024;

/// List terminator in free-block headers.
const NIL: u64 = u64::MAX;

/// Header written into the first bytes of every **free** block.
///
/// `next` is the frame number of the next free block of the same order (or
/// [`NIL`]); `order` tags the block so coalescing can sanity-check its
/// partner. Allocated blocks have no header.
#[repr(C)]
struct FreeHeader {
    next: u64,
    order: u64,
}

/// Allocation failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    /// No memory map has been consumed yet.
    #[error("frame allocator is not initialized")]
    NotInitialized,
    /// The request fails the admission rules before any search.
    #[error("invalid allocation request")]
    InvalidRequest,
    /// No free block of a sufficient order exists.
    #[error("out of physical memory")]
    OutOfMemory,
}

/// Allocator statistics snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PmmStats {
    pub total_frames: u64,
    pub free_frames: u64,
    pub used_frames: u64,
}

/// The physical frame allocator.
///
/// All list manipulation happens under the owner's single lock; the
/// walks are bounded by `MAX_ORDER`.
pub struct BuddyAllocator {
    heads: [u64; MAX_ORDER + 1],
    counts: [u64; MAX_ORDER + 1],
    total_frames: u64,
    free_frames: u64,
    initialized: bool,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [NIL; MAX_ORDER + 1],
            counts: [0; MAX_ORDER + 1],
            total_frames: 0,
            free_frames: 0,
            initialized: false,
        }
    }

    /// Consume the boot memory map: every `Available` entry is trimmed to
    /// whole frames and carved into the largest naturally-aligned
    /// power-of-two blocks that fit.
    pub fn set_memory_map<M: PhysAccess>(&mut self, m: &M, regions: &[MemoryRegion]) {
        *self = Self::new();

        for region in regions {
            if region.kind != MemoryRegionKind::Available {
                continue;
            }
            let start = kernel_addr::align_up(region.base.as_u64(), PAGE_SIZE) / PAGE_SIZE;
            let end = kernel_addr::align_down(region.base.as_u64() + region.len, PAGE_SIZE)
                / PAGE_SIZE;
            if start >= end {
                continue;
            }

            let mut frame = start;
            while frame < end {
                let align_order = if frame == 0 {
                    MAX_ORDER
                } else {
                    frame.trailing_zeros() as usize
                };
                let size_order = (63 - (end - frame).leading_zeros()) as usize;
                let order = align_order.min(size_order).min(MAX_ORDER);

                self.push(m, FrameNumber::new(frame), order);
                frame += 1 << order;
            }

            self.total_frames += end - start;
            self.free_frames += end - start;
        }

        self.initialized = true;
        info!(
            "pmm: {} frames usable ({} MiB)",
            self.total_frames,
            self.total_frames * PAGE_SIZE / (1024 * 1024)
        );
    }

    /// Allocate a naturally-aligned block of `2^order` frames.
    ///
    /// # Errors
    /// - [`PmmError::NotInitialized`] before [`set_memory_map`](Self::set_memory_map).
    /// - [`PmmError::InvalidRequest`] when the admission rules reject the
    ///   order: above `MAX_ORDER`, more than half of physical memory, or
    ///   over the 100 MiB single-request cap.
    /// - [`PmmError::OutOfMemory`] when no list from `order` upward has a
    ///   block.
    pub fn alloc<M: PhysAccess>(
        &mut self,
        m: &M,
        order: usize,
    ) -> Result<FrameNumber, PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInitialized);
        }
        if order > MAX_ORDER {
            return Err(PmmError::InvalidRequest);
        }
        let frames = 1_u64 << order;
        if frames > self.total_frames
            || frames > self.total_frames / 2
            || frames * PAGE_SIZE > MAX_REQUEST_BYTES
        {
            return Err(PmmError::InvalidRequest);
        }

        let from = (order..=MAX_ORDER)
            .find(|&k| self.heads[k] != NIL)
            .ok_or(PmmError::OutOfMemory)?;

        let block = self.pop(m, from).ok_or(PmmError::OutOfMemory)?;

        // Split down, keeping the lower half and parking the upper buddy.
        let mut k = from;
        while k > order {
            k -= 1;
            self.push(m, block.buddy(k), k);
        }

        self.free_frames -= frames;
        Ok(block)
    }

    /// Return a block previously obtained with `alloc(order)`.
    ///
    /// The order must match the allocation; the allocator records no
    /// per-block order for live blocks, so a mismatch corrupts the lists.
    /// Coalesces with free buddies as far as possible.
    pub fn free<M: PhysAccess>(&mut self, m: &M, block: FrameNumber, order: usize) {
        if !self.initialized {
            warn!("pmm: free before init, dropping {block:?}");
            return;
        }
        debug_assert!(order <= MAX_ORDER);
        debug_assert!(block.is_aligned_for(order), "{block:?} unaligned for {order}");

        let mut merged = block;
        let mut k = order;
        while k < MAX_ORDER {
            let buddy = merged.buddy(k);
            if !self.unlink(m, buddy, k) {
                break;
            }
            merged = merged.min(buddy);
            k += 1;
        }

        self.push(m, merged, k);
        self.free_frames += 1 << order;
    }

    /// Allocate the smallest block covering `bytes`
    /// (see [`order_for_bytes`]).
    ///
    /// # Errors
    /// As for [`alloc`](Self::alloc).
    pub fn alloc_bytes<M: PhysAccess>(
        &mut self,
        m: &M,
        bytes: u64,
    ) -> Result<FrameNumber, PmmError> {
        self.alloc(m, order_for_bytes(bytes))
    }

    #[must_use]
    pub const fn stats(&self) -> PmmStats {
        PmmStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            used_frames: self.total_frames - self.free_frames,
        }
    }

    /// Number of free blocks on the list of `order` (debugging aid).
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> u64 {
        self.counts.get(order).copied().unwrap_or(0)
    }

    fn push<M: PhysAccess>(&mut self, m: &M, block: FrameNumber, order: usize) {
        let header = unsafe { header_mut(m, block) };
        header.next = self.heads[order];
        header.order = order as u64;
        self.heads[order] = block.as_u64();
        self.counts[order] += 1;
    }

    fn pop<M: PhysAccess>(&mut self, m: &M, order: usize) -> Option<FrameNumber> {
        if self.heads[order] == NIL {
            return None;
        }
        let block = FrameNumber::new(self.heads[order]);
        self.heads[order] = unsafe { header_mut(m, block) }.next;
        self.counts[order] -= 1;
        Some(block)
    }

    /// Remove `target` from the list of `order` if it is linked there.
    fn unlink<M: PhysAccess>(&mut self, m: &M, target: FrameNumber, order: usize) -> bool {
        let mut current = self.heads[order];
        if current == target.as_u64() {
            let header = unsafe { header_mut(m, target) };
            debug_assert_eq!(header.order, order as u64);
            self.heads[order] = header.next;
            self.counts[order] -= 1;
            return true;
        }

        while current != NIL {
            let header = unsafe { header_mut(m, FrameNumber::new(current)) };
            if header.next == target.as_u64() {
                let gone = unsafe { header_mut(m, target) };
                debug_assert_eq!(gone.order, order as u64);
                header.next = gone.next;
                self.counts[order] -= 1;
                return true;
            }
            current = header.next;
        }
        false
    }
}

/// Borrow the free-block header stored in `frame`.
///
/// # Safety callers
/// Only used on frames owned by the free lists; serialized by the owner's
/// lock.
unsafe fn header_mut<'a, M: PhysAccess>(m: &M, frame: FrameNumber) -> &'a mut FreeHeader {
    unsafe { m.phys_to_mut::<FreeHeader>(frame.base()) }
}

/// The smallest order whose block covers `bytes`.
#[must_use]
pub const fn order_for_bytes(bytes: u64) -> usize {
    let pages = pages_for(bytes);
    if pages <= 1 {
        return 0;
    }
    (u64::BITS - (pages - 1).leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addr::PhysAddr;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    /// Sparse simulated physical memory: frames materialize on first touch,
    /// so seeding a 64 MiB map only costs the handful of frames that ever
    /// hold free-list headers.
    struct TestPhys {
        frames: RefCell<HashMap<u64, Box<Frame>>>,
    }

    impl TestPhys {
        fn new() -> Self {
            Self {
                frames: RefCell::new(HashMap::new()),
            }
        }
    }

    impl PhysAccess for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let mut frames = self.frames.borrow_mut();
            let frame = frames
                .entry(pa.as_u64() >> 12)
                .or_insert_with(|| Box::new(Frame([0; 4096])));
            let ptr = core::ptr::from_mut(frame.as_mut()).cast::<u8>();
            unsafe { &mut *ptr.add(pa.page_offset() as usize).cast::<T>() }
        }
    }

    const MIB: u64 = 1024 * 1024;

    fn seeded(map_bytes: u64) -> (TestPhys, BuddyAllocator) {
        let phys = TestPhys::new();
        let mut pmm = BuddyAllocator::new();
        pmm.set_memory_map(&phys, &[MemoryRegion::usable(0, map_bytes)]);
        (phys, pmm)
    }

    /// Invariant 1: `sum(2^k * |list[k]|) + used == total`.
    fn assert_accounting(pmm: &BuddyAllocator) {
        let listed: u64 = (0..=MAX_ORDER).map(|k| (1_u64 << k) * pmm.free_blocks(k)).sum();
        assert_eq!(listed, pmm.stats().free_frames);
        assert_eq!(
            listed + pmm.stats().used_frames,
            pmm.stats().total_frames
        );
    }

    /// Invariant 2: no block's buddy sits on the same free list.
    fn assert_fully_coalesced(phys: &TestPhys, pmm: &BuddyAllocator) {
        for order in 0..MAX_ORDER {
            let mut current = pmm.heads[order];
            while current != NIL {
                let frame = FrameNumber::new(current);
                let header = unsafe { header_mut(phys, frame) };
                let mut other = header.next;
                let buddy = frame.buddy(order).as_u64();
                while other != NIL {
                    assert_ne!(other, buddy, "uncoalesced buddies at order {order}");
                    other = unsafe { header_mut(phys, FrameNumber::new(other)) }.next;
                }
                // Also scan from the head up to `frame` itself.
                let mut scan = pmm.heads[order];
                while scan != NIL && scan != current {
                    assert_ne!(scan, buddy, "uncoalesced buddies at order {order}");
                    scan = unsafe { header_mut(phys, FrameNumber::new(scan)) }.next;
                }
                current = header.next;
            }
        }
    }

    #[test]
    fn seeds_one_maximal_block() {
        let (_, pmm) = seeded(64 * MIB);
        assert_eq!(pmm.stats().total_frames, 16384);
        assert_eq!(pmm.stats().free_frames, 16384);
        // 64 MiB at base 0 is exactly one order-14 block.
        assert_eq!(pmm.free_blocks(14), 1);
    }

    #[test]
    fn split_hands_out_adjacent_buddies_and_coalesces_back() {
        let (phys, mut pmm) = seeded(64 * MIB);

        let p0 = pmm.alloc(&phys, 0).unwrap();
        let p1 = pmm.alloc(&phys, 0).unwrap();
        // Sibling from the same split: addresses differ by exactly one page.
        assert_eq!(p1.base().as_u64(), p0.base().as_u64() ^ 4096);
        assert_accounting(&pmm);

        pmm.free(&phys, p0, 0);
        pmm.free(&phys, p1, 0);
        assert_eq!(pmm.stats().free_frames, 64 * MIB / 4096);
        // Everything merged back into the single maximal block.
        assert_eq!(pmm.free_blocks(0), 0);
        assert_eq!(pmm.free_blocks(14), 1);
        assert_fully_coalesced(&phys, &pmm);
    }

    #[test]
    fn alloc_free_restores_stats() {
        let (phys, mut pmm) = seeded(64 * MIB);
        let before = pmm.stats();
        let block = pmm.alloc(&phys, 3).unwrap();
        assert_eq!(pmm.stats().used_frames, 8);
        pmm.free(&phys, block, 3);
        assert_eq!(pmm.stats(), before);
        assert_fully_coalesced(&phys, &pmm);
    }

    #[test]
    fn admission_rules() {
        let (phys, mut pmm) = seeded(64 * MIB);
        // Whole memory: more than half → rejected, not OOM.
        assert_eq!(pmm.alloc(&phys, 14), Err(PmmError::InvalidRequest));
        // Exactly half passes the admission rules.
        assert!(pmm.alloc(&phys, 13).is_ok());
        // Above MAX_ORDER.
        assert_eq!(pmm.alloc(&phys, MAX_ORDER + 1), Err(PmmError::InvalidRequest));
        // MAX_ORDER itself never panics; here it exceeds the request cap.
        assert_eq!(pmm.alloc(&phys, MAX_ORDER), Err(PmmError::InvalidRequest));
    }

    #[test]
    fn oversized_byte_requests_are_rejected() {
        let (phys, mut pmm) = seeded(128 * MIB);
        assert_eq!(pmm.alloc_bytes(&phys, 200 * MIB), Err(PmmError::InvalidRequest));
        assert!(pmm.alloc_bytes(&phys, 2 * MIB).is_ok());
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let (phys, mut pmm) = seeded(16 * 4096);
        // order-2 blocks of a 16-frame map: admission allows up to order 3
        // (half). Drain with order-2 allocations.
        let a = pmm.alloc(&phys, 2).unwrap();
        let b = pmm.alloc(&phys, 2).unwrap();
        let c = pmm.alloc(&phys, 2).unwrap();
        let d = pmm.alloc(&phys, 2).unwrap();
        assert_eq!(pmm.alloc(&phys, 2), Err(PmmError::OutOfMemory));
        pmm.free(&phys, a, 2);
        pmm.free(&phys, b, 2);
        pmm.free(&phys, c, 2);
        pmm.free(&phys, d, 2);
        assert_eq!(pmm.stats().free_frames, 16);
        assert_fully_coalesced(&phys, &pmm);
    }

    #[test]
    fn uninitialized_allocator_refuses() {
        let phys = TestPhys::new();
        let mut pmm = BuddyAllocator::new();
        assert_eq!(pmm.alloc(&phys, 0), Err(PmmError::NotInitialized));
    }

    #[test]
    fn reserved_regions_contribute_nothing() {
        let phys = TestPhys::new();
        let mut pmm = BuddyAllocator::new();
        pmm.set_memory_map(
            &phys,
            &[
                MemoryRegion::usable(MIB, 4 * MIB),
                MemoryRegion::new(16 * MIB, 8 * MIB, MemoryRegionKind::Reserved),
                MemoryRegion::new(32 * MIB, MIB, MemoryRegionKind::Unusable),
            ],
        );
        assert_eq!(pmm.stats().total_frames, 4 * MIB / 4096);
        assert_accounting(&pmm);
    }

    #[test]
    fn unaligned_region_edges_are_trimmed() {
        let phys = TestPhys::new();
        let mut pmm = BuddyAllocator::new();
        pmm.set_memory_map(&phys, &[MemoryRegion::usable(0x1234, 3 * 4096 + 100)]);
        // [0x2000, 0x4000) survives the trim: two frames.
        assert_eq!(pmm.stats().total_frames, 2);
    }

    #[test]
    fn mixed_workload_keeps_invariants() {
        let (phys, mut pmm) = seeded(32 * MIB);
        let mut live = Vec::new();
        for order in [0, 3, 1, 5, 0, 2, 7, 4] {
            live.push((pmm.alloc(&phys, order).unwrap(), order));
            assert_accounting(&pmm);
        }
        // Free interleaved: evens first, then odds.
        let (evens, odds): (Vec<_>, Vec<_>) =
            live.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
        for (_, (block, order)) in evens.into_iter().chain(odds) {
            pmm.free(&phys, block, order);
            assert_accounting(&pmm);
            assert_fully_coalesced(&phys, &pmm);
        }
        assert_eq!(pmm.stats().used_frames, 0);
    }

    #[test]
    fn order_for_bytes_math() {
        assert_eq!(order_for_bytes(1), 0);
        assert_eq!(order_for_bytes(4096), 0);
        assert_eq!(order_for_bytes(4097), 1);
        assert_eq!(order_for_bytes(5 * 4096), 3);
        assert_eq!(order_for_bytes(16 * 4096), 4);
    }
}
