//! # IO APIC

use crate::ApicRegs;
use bitfield_struct::bitfield;
use log::info;

// Indirect access: write the register index to REGSEL, data through WINDOW.
const REGSEL: u32 = 0x00;
const WINDOW: u32 = 0x10;

// Register indices.
const REG_VERSION: u8 = 0x01;
const REG_REDTBL_BASE: u8 = 0x10;

/// One 64-bit redirection-table entry, programmed as two 32-bit halves.
#[bitfield(u64)]
pub struct RedirectionEntry {
    /// Interrupt vector delivered to the target CPU.
    pub vector: u8,

    /// Delivery mode; 0 is fixed.
    #[bits(3)]
    pub delivery_mode: u8,

    /// Destination mode: physical (0) or logical (1).
    pub logical_dest: bool,

    /// Delivery status (read-only in hardware).
    pub pending: bool,

    /// Pin polarity: active-low when set.
    pub active_low: bool,

    /// Remote IRR (read-only in hardware).
    pub remote_irr: bool,

    /// Trigger mode: level when set; edge (clear) is the default here.
    pub level_triggered: bool,

    /// Masked entries deliver nothing.
    pub masked: bool,

    #[bits(39)]
    __: u64,

    /// Target APIC id (physical destination mode).
    pub destination: u8,
}

/// Driver for the system IO APIC.
pub struct IoApic<R: ApicRegs> {
    regs: R,
}

impl<R: ApicRegs> IoApic<R> {
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    /// Number of redirection entries this IO APIC implements.
    #[must_use]
    pub fn entry_count(&mut self) -> u16 {
        (((self.read_reg(REG_VERSION) >> 16) & 0xFF) + 1) as u16
    }

    /// Mask every redirection entry; bring-up state until lines are routed.
    pub fn mask_all(&mut self) {
        let entries = self.entry_count();
        for irq in 0..entries {
            self.write_entry(irq as u8, RedirectionEntry::new().with_masked(true));
        }
        info!("ioapic: masked {entries} redirection entries");
    }

    /// Route `irq` to `apic_id` with the given vector: fixed delivery,
    /// physical destination, edge-triggered, unmasked.
    pub fn route(&mut self, irq: u8, apic_id: u32, vector: u8) {
        let entry = RedirectionEntry::new()
            .with_vector(vector)
            .with_destination(apic_id as u8);
        self.write_entry(irq, entry);
        info!("ioapic: irq {irq} -> cpu apic {apic_id}, vector {vector:#x}");
    }

    /// Mask `irq` again, keeping the rest of the entry for re-routing.
    pub fn unroute(&mut self, irq: u8) {
        let entry = self.read_entry(irq).with_masked(true);
        self.write_entry(irq, entry);
    }

    #[must_use]
    pub fn read_entry(&mut self, irq: u8) -> RedirectionEntry {
        let lo = self.read_reg(REG_REDTBL_BASE + irq * 2);
        let hi = self.read_reg(REG_REDTBL_BASE + irq * 2 + 1);
        RedirectionEntry::from((u64::from(hi) << 32) | u64::from(lo))
    }

    fn write_entry(&mut self, irq: u8, entry: RedirectionEntry) {
        let raw: u64 = entry.into();
        // Write the high half first so a masked entry never fires with a
        // stale destination.
        self.write_reg(REG_REDTBL_BASE + irq * 2 + 1, (raw >> 32) as u32);
        self.write_reg(REG_REDTBL_BASE + irq * 2, raw as u32);
    }

    fn read_reg(&mut self, index: u8) -> u32 {
        self.regs.write(REGSEL, u32::from(index));
        self.regs.read(WINDOW)
    }

    fn write_reg(&mut self, index: u8, value: u32) {
        self.regs.write(REGSEL, u32::from(index));
        self.regs.write(WINDOW, value);
    }
}
