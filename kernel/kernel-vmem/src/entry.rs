//! # Page-Table Entry Encoding

use bitfield_struct::bitfield;
use kernel_addr::{FrameNumber, PhysAddr};

/// One 64-bit x86-64 paging entry, at any of the four levels.
///
/// Non-leaf entries point at the next table (PS must stay 0 there); the PT
/// level always maps a 4 KiB page. Bits that only matter on leaves (`dirty`,
/// `global`) are ignored by hardware in non-leaf entries.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0): valid entry if set.
    pub present: bool,

    /// **Writable** (bit 1): write permission; intersects across the walk.
    pub writable: bool,

    /// **User/Supervisor** (bit 2): user-mode access if set.
    pub user: bool,

    /// **Page Write-Through** (bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU on first access.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on first write; leaf only.
    pub dirty: bool,

    /// **Page Size** (bit 7): large-leaf marker in PDPT/PD entries. Always
    /// zero here; only 4 KiB mappings are installed.
    pub page_size: bool,

    /// **Global** (bit 8): TLB entry survives CR3 reloads; leaf only.
    pub global: bool,

    /// OS-available (bits 9..=11), not interpreted by hardware.
    #[bits(3)]
    pub os_bits: u8,

    /// Physical frame number of the next table or the mapped page
    /// (bits 12..=51).
    #[bits(40)]
    frame: u64,

    /// Reserved / OS-available high bits (52..=62).
    #[bits(11)]
    __: u16,

    /// **No-Execute** (bit 63): instruction fetch faults when set
    /// (requires EFER.NXE).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Entry with every bit clear.
    pub const ZERO: Self = Self::new();

    /// The physical address encoded in bits 12..=51
    /// (`entry & 0x000F_FFFF_FFFF_F000`).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }

    /// The frame number encoded in bits 12..=51.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.frame())
    }

    /// This entry with the target frame replaced.
    #[inline]
    #[must_use]
    pub const fn with_frame_number(self, frame: FrameNumber) -> Self {
        self.with_frame(frame.as_u64())
    }
}

/// A 4 KiB page table: 512 entries at any walk level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::ZERO; 512];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

/// Failure modes of a page-table walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// Bits 48..=63 of the address are not a sign-extension of bit 47.
    #[error("non-canonical virtual address")]
    NonCanonical,
    /// The chain ends before the PT level or the leaf is not present.
    #[error("address is not mapped")]
    NotMapped,
}

/// Failure modes of installing a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Bits 48..=63 of the address are not a sign-extension of bit 47.
    #[error("non-canonical virtual address")]
    NonCanonical,
    /// The leaf entry is already present.
    #[error("virtual address is already mapped")]
    AlreadyMapped,
    /// An intermediate table could not be allocated.
    #[error("out of physical memory for page tables")]
    OutOfMemory,
}
