//! # Address Spaces and the Virtual Memory Manager
//!
//! An [`AddressSpace`] owns one PML4-rooted page-table tree plus the
//! free-range table for its allocation window. The raw paging operations
//! (`map_page`, `unmap_page`, `translate`, `walk`) implement the four-level
//! engine; `alloc`/`free` on top of them are the VMM: admission checks,
//! frame backing, distinct virtual bases, full unwind on partial failure.
//!
//! Concurrency: one lock per address space around the table walk (the owner
//! wraps the space in a `SpinLock`); operations on different spaces take no
//! common lock.

use crate::ranges::RangeAllocator;
use crate::{FrameAlloc, MapError, PageTableEntry, PhysAccess, VmFlags, WalkError, table_mut};
use kernel_addr::{FrameNumber, PAGE_SIZE, PhysAddr, VirtAddr, layout, pages_for};
use log::{trace, warn};

/// Whether a space is the kernel's own or a user space sharing the kernel
/// half.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Defensive cap on a single allocation request.
const MAX_REQUEST_BYTES: u64 = 100 * 1024 * 1024;

/// VMM-level failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    /// The request fails the admission rules (too large for the machine, or
    /// no virtual window left).
    #[error("request rejected by admission rules")]
    Rejected,
    /// Physical frames ran out mid-way; everything mapped so far was undone.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Zero size, unaligned base, or an address outside this space.
    #[error("invalid argument")]
    InvalidArgument,
}

/// One four-level address space.
pub struct AddressSpace {
    root: FrameNumber,
    kind: SpaceKind,
    ranges: RangeAllocator,
}

impl AddressSpace {
    /// Create the kernel address space: an empty tree plus the kernel
    /// allocation window.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when no frame is left for the root.
    pub fn new_kernel<M: PhysAccess, A: FrameAlloc>(
        m: &M,
        alloc: &mut A,
    ) -> Result<Self, VmmError> {
        let root = Self::fresh_table(m, alloc).ok_or(VmmError::OutOfMemory)?;
        Ok(Self {
            root,
            kind: SpaceKind::Kernel,
            ranges: RangeAllocator::new(layout::KERNEL_ALLOC_BASE, layout::KERNEL_ALLOC_SIZE),
        })
    }

    /// Create a user address space whose kernel half aliases `kernel`'s
    /// upper 256 PML4 slots.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when no frame is left for the root.
    pub fn new_user<M: PhysAccess, A: FrameAlloc>(
        m: &M,
        alloc: &mut A,
        kernel: &Self,
    ) -> Result<Self, VmmError> {
        let root = Self::fresh_table(m, alloc).ok_or(VmmError::OutOfMemory)?;

        // Alias the shared kernel subtrees; lower levels are untouched.
        let src = unsafe { table_mut(m, kernel.root) };
        let dst = unsafe { table_mut(m, root) };
        for i in 256..512 {
            dst.set(i, src.get(i));
        }

        Ok(Self {
            root,
            kind: SpaceKind::User,
            ranges: RangeAllocator::new(layout::USER_ALLOC_BASE, layout::USER_ALLOC_SIZE),
        })
    }

    /// Wrap the boot-installed kernel tree (root read from CR3 at handoff)
    /// without touching its mappings. The allocation window is still fresh.
    #[must_use]
    pub fn adopt_kernel(root: FrameNumber) -> Self {
        Self {
            root,
            kind: SpaceKind::Kernel,
            ranges: RangeAllocator::new(layout::KERNEL_ALLOC_BASE, layout::KERNEL_ALLOC_SIZE),
        }
    }

    fn fresh_table<M: PhysAccess, A: FrameAlloc>(m: &M, alloc: &mut A) -> Option<FrameNumber> {
        let frame = alloc.alloc_frame()?;
        unsafe { table_mut(m, frame) }.zero();
        Some(frame)
    }

    /// Physical frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> FrameNumber {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Load this space's root into the page-table base register.
    ///
    /// # Safety
    /// The tree must map the currently executing code, stack and the direct
    /// map; see [`kernel_arch::write_cr3`].
    pub unsafe fn activate(&self) {
        unsafe { kernel_arch::write_cr3(self.root.base().as_u64()) }
    }

    /// Whether this space is the one the CPU is walking right now.
    #[must_use]
    pub fn is_active(&self) -> bool {
        kernel_arch::read_cr3() == self.root.base().as_u64()
    }

    /// Install a 4 KiB mapping `va → pa`.
    ///
    /// Intermediate tables are created on demand from `alloc`, zeroed, and
    /// linked Present + Writable (plus User when the leaf is user-visible;
    /// an existing interior entry is upgraded to User if needed, keeping
    /// interior permissions at least as permissive as any child).
    ///
    /// # Errors
    /// - [`MapError::NonCanonical`] for an invalid `va`.
    /// - [`MapError::AlreadyMapped`] when the leaf is already present.
    /// - [`MapError::OutOfMemory`] when an interior table cannot be
    ///   allocated. Interior tables created before the failure are retained;
    ///   they cost one frame each and are reclaimed on
    ///   [`destroy`](Self::destroy).
    pub fn map_page<M: PhysAccess, A: FrameAlloc>(
        &self,
        m: &M,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        flags: VmFlags,
    ) -> Result<(), MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical);
        }
        let user = flags.contains(VmFlags::USER);

        let mut table = self.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            let t = unsafe { table_mut(m, table) };
            let entry = t.get(index);
            if entry.present() {
                if user && !entry.user() {
                    t.set(index, entry.with_user(true));
                }
                table = entry.frame_number();
            } else {
                let fresh = Self::fresh_table(m, alloc).ok_or(MapError::OutOfMemory)?;
                t.set(
                    index,
                    PageTableEntry::new()
                        .with_present(true)
                        .with_writable(true)
                        .with_user(user)
                        .with_frame_number(fresh),
                );
                table = fresh;
            }
        }

        let pt = unsafe { table_mut(m, table) };
        if pt.get(va.pt_index()).present() {
            return Err(MapError::AlreadyMapped);
        }
        pt.set(
            va.pt_index(),
            flags.to_leaf_entry().with_frame_number(pa.frame()),
        );
        trace!("map {va} -> {pa} ({flags:?})");
        Ok(())
    }

    /// Clear the leaf mapping at `va` if present.
    ///
    /// Empty interior tables are not torn down here; they go with
    /// [`destroy`](Self::destroy).
    ///
    /// # Errors
    /// [`WalkError`] when `va` is non-canonical or not mapped.
    pub fn unmap_page<M: PhysAccess>(&self, m: &M, va: VirtAddr) -> Result<(), WalkError> {
        let (pt_frame, index) = self.leaf_slot(m, va)?;
        let pt = unsafe { table_mut(m, pt_frame) };
        if !pt.get(index).present() {
            return Err(WalkError::NotMapped);
        }
        pt.set(index, PageTableEntry::ZERO);
        if self.is_active() {
            kernel_arch::invlpg(va.as_u64());
        }
        trace!("unmap {va}");
        Ok(())
    }

    /// The leaf entry covering `va`.
    ///
    /// # Errors
    /// [`WalkError`] when `va` is non-canonical or the chain is incomplete.
    pub fn walk<M: PhysAccess>(&self, m: &M, va: VirtAddr) -> Result<PageTableEntry, WalkError> {
        let (pt_frame, index) = self.leaf_slot(m, va)?;
        let entry = unsafe { table_mut(m, pt_frame) }.get(index);
        if entry.present() {
            Ok(entry)
        } else {
            Err(WalkError::NotMapped)
        }
    }

    /// Translate `va` to the mapped physical address plus page offset.
    #[must_use]
    pub fn translate<M: PhysAccess>(&self, m: &M, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.walk(m, va).ok()?;
        Some(entry.address() + va.page_offset())
    }

    /// Descend to the PT covering `va`, without touching the leaf.
    fn leaf_slot<M: PhysAccess>(
        &self,
        m: &M,
        va: VirtAddr,
    ) -> Result<(FrameNumber, usize), WalkError> {
        if !va.is_canonical() {
            return Err(WalkError::NonCanonical);
        }
        let mut table = self.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            let entry = unsafe { table_mut(m, table) }.get(index);
            if !entry.present() {
                return Err(WalkError::NotMapped);
            }
            table = entry.frame_number();
        }
        Ok((table, va.pt_index()))
    }

    /// Admission predicate shared by [`alloc`](Self::alloc): a request is
    /// admitted when it is non-zero, fits in the free frames, stays under
    /// half of physical memory, and stays under the 100 MiB single-request
    /// cap.
    pub fn can_alloc<A: FrameAlloc>(alloc: &A, size: u64) -> bool {
        let free_bytes = alloc.free_frames() * PAGE_SIZE;
        let total_bytes = alloc.total_frames() * PAGE_SIZE;
        // The request cap bounds `size` before the doubling below.
        size > 0 && size <= MAX_REQUEST_BYTES && size <= free_bytes && size * 2 < total_bytes
    }

    /// Allocate `size` bytes of virtual memory backed by fresh frames.
    ///
    /// Rounds up to whole pages, picks a distinct base from the space's
    /// free-range table and maps frame by frame. Kernel spaces implicitly
    /// map Writable and supervisor-only.
    ///
    /// # Errors
    /// - [`VmmError::Rejected`] when the admission rules or the virtual
    ///   window refuse the request.
    /// - [`VmmError::OutOfMemory`] when frames run out mid-way; every page
    ///   mapped before the failure has been unmapped and freed.
    pub fn alloc<M: PhysAccess, A: FrameAlloc>(
        &mut self,
        m: &M,
        alloc: &mut A,
        size: u64,
        flags: VmFlags,
    ) -> Result<VirtAddr, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidArgument);
        }
        if !Self::can_alloc(alloc, size) {
            warn!("vmm: rejecting {size}-byte request");
            return Err(VmmError::Rejected);
        }

        let flags = match self.kind {
            SpaceKind::Kernel => (flags | VmFlags::KERNEL_DATA) - VmFlags::USER,
            SpaceKind::User => flags | VmFlags::READ | VmFlags::USER,
        };

        let pages = pages_for(size);
        let base = self.ranges.allocate(pages).ok_or(VmmError::Rejected)?;

        for i in 0..pages {
            let va = base + i * PAGE_SIZE;
            let frame = match alloc.alloc_frame() {
                Some(frame) => frame,
                None => {
                    self.unwind(m, alloc, base, i);
                    self.ranges.free(base, pages);
                    return Err(VmmError::OutOfMemory);
                }
            };
            if let Err(err) = self.map_page(m, alloc, va, frame.base(), flags) {
                alloc.free_frame(frame);
                self.unwind(m, alloc, base, i);
                self.ranges.free(base, pages);
                return Err(match err {
                    MapError::OutOfMemory => VmmError::OutOfMemory,
                    MapError::NonCanonical | MapError::AlreadyMapped => VmmError::InvalidArgument,
                });
            }
        }

        trace!("vmm: allocated {pages} pages at {base}");
        Ok(base)
    }

    /// Release `[va, va + size)`: recover the backing frames by walking the
    /// tables, unmap, and return the virtual range to the free table.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for a zero size or an unaligned base.
    pub fn free<M: PhysAccess, A: FrameAlloc>(
        &mut self,
        m: &M,
        alloc: &mut A,
        va: VirtAddr,
        size: u64,
    ) -> Result<(), VmmError> {
        if size == 0 || !va.is_page_aligned() {
            return Err(VmmError::InvalidArgument);
        }
        let pages = pages_for(size);
        for i in 0..pages {
            let page = va + i * PAGE_SIZE;
            if let Some(pa) = self.translate(m, page) {
                // The walk is the reverse lookup: no frame leaks on free.
                let _ = self.unmap_page(m, page);
                alloc.free_frame(pa.frame());
            } else {
                warn!("vmm: free of unmapped page {page}");
            }
        }
        self.ranges.free(va, pages);
        Ok(())
    }

    /// Unmap and free the first `mapped` pages starting at `base`.
    fn unwind<M: PhysAccess, A: FrameAlloc>(
        &self,
        m: &M,
        alloc: &mut A,
        base: VirtAddr,
        mapped: u64,
    ) {
        for i in 0..mapped {
            let va = base + i * PAGE_SIZE;
            if let Some(pa) = self.translate(m, va) {
                let _ = self.unmap_page(m, va);
                alloc.free_frame(pa.frame());
            }
        }
    }

    /// Tear the space down: free every mapped frame and every non-shared
    /// page-table page of the lower half, then the root itself.
    ///
    /// The shared kernel half (PML4 slots 256..512) is left alone; those
    /// subtrees belong to the kernel space.
    pub fn destroy<M: PhysAccess, A: FrameAlloc>(self, m: &M, alloc: &mut A) {
        let pml4 = unsafe { table_mut(m, self.root) };
        for i4 in 0..256 {
            let e4 = pml4.get(i4);
            if !e4.present() {
                continue;
            }
            let pdpt = unsafe { table_mut(m, e4.frame_number()) };
            for i3 in 0..512 {
                let e3 = pdpt.get(i3);
                if !e3.present() {
                    continue;
                }
                let pd = unsafe { table_mut(m, e3.frame_number()) };
                for i2 in 0..512 {
                    let e2 = pd.get(i2);
                    if !e2.present() {
                        continue;
                    }
                    let pt = unsafe { table_mut(m, e2.frame_number()) };
                    for i1 in 0..512 {
                        let e1 = pt.get(i1);
                        if e1.present() {
                            alloc.free_frame(e1.frame_number());
                        }
                    }
                    alloc.free_frame(e2.frame_number());
                }
                alloc.free_frame(e3.frame_number());
            }
            alloc.free_frame(e4.frame_number());
        }
        alloc.free_frame(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhysAccess;

    /// A 4 KiB-aligned frame used as simulated physical RAM.
    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    /// In-memory "physical" arena: frame `n` lives at physical address
    /// `n << 12`.
    struct TestPhys {
        frames: core::cell::RefCell<Vec<Box<Frame>>>,
    }

    impl TestPhys {
        fn new(frames: usize) -> Self {
            Self {
                frames: core::cell::RefCell::new(
                    (0..frames).map(|_| Box::new(Frame([0; 4096]))).collect(),
                ),
            }
        }
    }

    impl PhysAccess for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            assert_eq!(pa.page_offset(), 0);
            let ptr = core::ptr::from_mut(self.frames.borrow_mut()[idx].as_mut()).cast::<T>();
            unsafe { &mut *ptr }
        }
    }

    /// Free-list backed test allocator over the arena, with exact counters.
    struct TestAlloc {
        free: Vec<FrameNumber>,
        total: u64,
    }

    impl TestAlloc {
        fn new(frames: u64) -> Self {
            Self::with_total(frames, frames)
        }

        /// Free list of `frames` frames while reporting `total` managed
        /// frames, modelling memory already consumed by earlier users.
        fn with_total(frames: u64, total: u64) -> Self {
            Self {
                free: (0..frames).rev().map(FrameNumber::new).collect(),
                total,
            }
        }
    }

    impl FrameAlloc for TestAlloc {
        fn alloc_frame(&mut self) -> Option<FrameNumber> {
            self.free.pop()
        }

        fn free_frame(&mut self, frame: FrameNumber) {
            assert!(!self.free.contains(&frame), "double free of {frame:?}");
            self.free.push(frame);
        }

        fn total_frames(&self) -> u64 {
            self.total
        }

        fn free_frames(&self) -> u64 {
            self.free.len() as u64
        }
    }

    fn setup(frames: u64) -> (TestPhys, TestAlloc, AddressSpace) {
        let phys = TestPhys::new(frames as usize);
        let mut alloc = TestAlloc::new(frames);
        let space = AddressSpace::new_kernel(&phys, &mut alloc).unwrap();
        (phys, alloc, space)
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let (phys, mut alloc, space) = setup(64);
        let va = VirtAddr::new(0x40_0000);
        let pa = PhysAddr::new(0x30_0000);

        space
            .map_page(&phys, &mut alloc, va, pa, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        assert_eq!(space.translate(&phys, va), Some(pa));
        assert_eq!(space.translate(&phys, va + 0x123), Some(pa + 0x123));

        space.unmap_page(&phys, va).unwrap();
        assert_eq!(space.translate(&phys, va), None);
        assert_eq!(space.walk(&phys, va), Err(WalkError::NotMapped));
    }

    #[test]
    fn non_canonical_addresses_are_rejected() {
        let (phys, mut alloc, space) = setup(64);
        let bad = VirtAddr::new(0x0000_8000_0000_0000);
        assert_eq!(
            space.map_page(&phys, &mut alloc, bad, PhysAddr::new(0x1000), VmFlags::READ),
            Err(MapError::NonCanonical)
        );
        assert_eq!(space.walk(&phys, bad), Err(WalkError::NonCanonical));
    }

    #[test]
    fn double_map_reports_already_mapped() {
        let (phys, mut alloc, space) = setup(64);
        let va = VirtAddr::new(0x40_0000);
        space
            .map_page(&phys, &mut alloc, va, PhysAddr::new(0x1000), VmFlags::READ)
            .unwrap();
        assert_eq!(
            space.map_page(&phys, &mut alloc, va, PhysAddr::new(0x2000), VmFlags::READ),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn user_leaf_upgrades_interior_entries() {
        let (phys, mut alloc, space) = setup(64);
        let kernel_va = VirtAddr::new(0x40_0000);
        let user_va = VirtAddr::new(0x40_1000);
        space
            .map_page(&phys, &mut alloc, kernel_va, PhysAddr::new(0x1000), VmFlags::READ)
            .unwrap();
        space
            .map_page(
                &phys,
                &mut alloc,
                user_va,
                PhysAddr::new(0x2000),
                VmFlags::READ | VmFlags::USER,
            )
            .unwrap();

        // The shared PML4 entry must now be user-visible.
        let pml4 = unsafe { table_mut(&phys, space.root()) };
        assert!(pml4.get(user_va.pml4_index()).user());
    }

    #[test]
    fn alloc_backs_every_page() {
        let (phys, mut alloc, mut space) = setup(128);
        let size = 5 * PAGE_SIZE + 123; // rounds to 6 pages
        let base = space
            .alloc(&phys, &mut alloc, size, VmFlags::KERNEL_DATA)
            .unwrap();
        for i in 0..6 {
            assert!(space.translate(&phys, base + i * PAGE_SIZE).is_some());
        }
        assert!(space.translate(&phys, base + 6 * PAGE_SIZE).is_none());
    }

    #[test]
    fn free_then_alloc_same_size_succeeds() {
        let (phys, mut alloc, mut space) = setup(128);
        let before = alloc.free_frames();
        let base = space
            .alloc(&phys, &mut alloc, 8 * PAGE_SIZE, VmFlags::KERNEL_DATA)
            .unwrap();
        space.free(&phys, &mut alloc, base, 8 * PAGE_SIZE).unwrap();
        // Leaf frames come back; interior tables stay until destroy.
        assert_eq!(alloc.free_frames() + 3, before);
        assert!(
            space
                .alloc(&phys, &mut alloc, 8 * PAGE_SIZE, VmFlags::KERNEL_DATA)
                .is_ok()
        );
    }

    #[test]
    fn admission_rejects_half_of_memory() {
        let (phys, mut alloc, mut space) = setup(64);
        let total = 64 * PAGE_SIZE;
        assert!(!AddressSpace::can_alloc(&alloc, total / 2));
        assert!(AddressSpace::can_alloc(&alloc, total / 2 - PAGE_SIZE));
        assert_eq!(
            space.alloc(&phys, &mut alloc, total / 2, VmFlags::KERNEL_DATA),
            Err(VmmError::Rejected)
        );
    }

    #[test]
    fn admission_rejects_oversized_and_zero() {
        let (_, alloc, _) = setup(64);
        assert!(!AddressSpace::can_alloc(&alloc, 0));
        assert!(!AddressSpace::can_alloc(&alloc, 200 * 1024 * 1024));
    }

    #[test]
    fn failed_alloc_unwinds_completely() {
        // 16 live frames in a nominally larger machine: the root takes one,
        // and a 13-page request (3 interior tables + 13 leaves = 16 frames)
        // must fail on the last leaf.
        let phys = TestPhys::new(16);
        let mut alloc = TestAlloc::with_total(16, 64);
        let mut space = AddressSpace::new_kernel(&phys, &mut alloc).unwrap();
        let free_before = alloc.free_frames();
        assert_eq!(
            space.alloc(&phys, &mut alloc, 13 * PAGE_SIZE, VmFlags::KERNEL_DATA),
            Err(VmmError::OutOfMemory)
        );
        // Leaf frames all came back; at most the interior chain (3 tables)
        // is retained, as documented.
        assert!(alloc.free_frames() + 3 >= free_before);
        // The virtual window was returned: a smaller request lands at the
        // same base region and succeeds.
        assert!(
            space
                .alloc(&phys, &mut alloc, 2 * PAGE_SIZE, VmFlags::KERNEL_DATA)
                .is_ok()
        );
    }

    #[test]
    fn user_space_shares_kernel_half() {
        let phys = TestPhys::new(64);
        let mut alloc = TestAlloc::new(64);
        let mut kernel = AddressSpace::new_kernel(&phys, &mut alloc).unwrap();

        // Something in the kernel half, via the kernel space.
        let kva = VirtAddr::new(0xFFFF_9000_0000_0000);
        let base = kernel
            .alloc(&phys, &mut alloc, PAGE_SIZE, VmFlags::KERNEL_DATA)
            .unwrap();
        assert_eq!(base, kva);

        let user = AddressSpace::new_user(&phys, &mut alloc, &kernel).unwrap();
        // Visible through the user space's shared half too.
        assert_eq!(
            user.translate(&phys, kva),
            kernel.translate(&phys, kva)
        );
    }

    #[test]
    fn destroy_reclaims_tables_and_frames() {
        let phys = TestPhys::new(128);
        let mut alloc = TestAlloc::new(128);
        let kernel = AddressSpace::new_kernel(&phys, &mut alloc).unwrap();
        let mut user = AddressSpace::new_user(&phys, &mut alloc, &kernel).unwrap();

        let free_before = alloc.free_frames();
        let base = user
            .alloc(&phys, &mut alloc, 4 * PAGE_SIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        assert!(user.translate(&phys, base).is_some());

        user.destroy(&phys, &mut alloc);
        // Root + interiors + leaves all returned.
        assert_eq!(alloc.free_frames(), free_before + 1);
    }

    #[test]
    fn activate_loads_root() {
        let (_, _, space) = setup(16);
        unsafe { space.activate() };
        assert!(space.is_active());
    }
}
