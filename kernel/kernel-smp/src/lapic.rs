//! # Local APIC (xAPIC, MMIO)

use crate::ApicRegs;
use log::info;

/// Architectural default physical base of the local-APIC window.
pub const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

// Register byte offsets.
const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ESR: u32 = 0x280;
const REG_ICR_LO: u32 = 0x300;
const REG_ICR_HI: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INIT: u32 = 0x380;
const REG_TIMER_DIV: u32 = 0x3E0;

// SVR bits.
const SVR_ENABLE: u32 = 1 << 8;

// LVT bits.
const LVT_MASKED: u32 = 1 << 16;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

// ICR bits.
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_MODE_INIT: u32 = 0b101 << 8;
const ICR_MODE_STARTUP: u32 = 0b110 << 8;
const ICR_ALL_EXCL_SELF: u32 = 0b11 << 18;

/// Divide-configuration encodings of the timer.
pub mod lapic_div {
    pub const DIV_1: u32 = 0b1011;
    pub const DIV_16: u32 = 0b0011;
    pub const DIV_128: u32 = 0b1010;
}

/// Driver for one CPU's local APIC.
pub struct LocalApic<R: ApicRegs> {
    regs: R,
}

impl<R: ApicRegs> LocalApic<R> {
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    /// This APIC's id (bits 31..24 of the ID register).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.regs.read(REG_ID) >> 24
    }

    /// Software-enable the APIC: set the spurious vector, clear the error
    /// status and any pending EOI.
    pub fn enable(&mut self, spurious_vector: u8) {
        self.regs
            .write(REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
        // ESR latches until written; write twice to clear both banks.
        self.regs.write(REG_ESR, 0);
        self.regs.write(REG_ESR, 0);
        self.regs.write(REG_EOI, 0);
        info!("lapic {}: enabled", self.id());
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&mut self) {
        self.regs.write(REG_EOI, 0);
    }

    /// Arm the periodic timer: divide-by-16, initial count chosen so the
    /// counter expires `tick_hz` times per second given the timer input
    /// clock `timer_hz`.
    pub fn timer_periodic(&mut self, vector: u8, timer_hz: u64, tick_hz: u64) {
        let initial = (timer_hz / 16 / tick_hz.max(1)).max(1) as u32;
        self.regs.write(REG_TIMER_DIV, lapic_div::DIV_16);
        self.regs
            .write(REG_LVT_TIMER, u32::from(vector) | LVT_TIMER_PERIODIC);
        self.regs.write(REG_TIMER_INIT, initial);
        info!("lapic {}: periodic timer {tick_hz} Hz (count {initial})", self.id());
    }

    /// Mask the timer and stop the counter.
    pub fn timer_stop(&mut self) {
        let lvt = self.regs.read(REG_LVT_TIMER);
        self.regs.write(REG_LVT_TIMER, lvt | LVT_MASKED);
        self.regs.write(REG_TIMER_INIT, 0);
    }

    /// Send a directed IPI and busy-wait until the delivery-status bit
    /// clears.
    pub fn send_ipi(&mut self, target_apic_id: u32, vector: u8) {
        self.regs.write(REG_ICR_HI, target_apic_id << 24);
        self.regs
            .write(REG_ICR_LO, u32::from(vector) | ICR_LEVEL_ASSERT);
        self.wait_delivered();
    }

    /// Broadcast an IPI to every CPU but this one.
    pub fn broadcast_ipi(&mut self, vector: u8) {
        self.regs.write(
            REG_ICR_LO,
            u32::from(vector) | ICR_LEVEL_ASSERT | ICR_ALL_EXCL_SELF,
        );
        self.wait_delivered();
    }

    /// Wake an application processor: INIT, then two STARTUP IPIs pointing
    /// at `start_page` (the 4 KiB-aligned real-mode entry, encoded as its
    /// page number).
    pub fn start_cpu(&mut self, target_apic_id: u32, start_page: u8) {
        self.regs.write(REG_ICR_HI, target_apic_id << 24);
        self.regs.write(REG_ICR_LO, ICR_MODE_INIT | ICR_LEVEL_ASSERT);
        self.wait_delivered();

        for _ in 0..2 {
            self.regs.write(REG_ICR_HI, target_apic_id << 24);
            self.regs
                .write(REG_ICR_LO, ICR_MODE_STARTUP | u32::from(start_page));
            self.wait_delivered();
        }
    }

    /// Tell a CPU to park itself by delivering the stop vector.
    pub fn stop_cpu(&mut self, target_apic_id: u32, stop_vector: u8) {
        self.send_ipi(target_apic_id, stop_vector);
    }

    fn wait_delivered(&mut self) {
        while self.regs.read(REG_ICR_LO) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Halt the current CPU until the next interrupt.
pub fn cpu_sleep() {
    kernel_arch::halt();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records all register traffic; reads return the last written value.
    #[derive(Default)]
    struct RecRegs {
        regs: RefCell<HashMap<u32, u32>>,
        writes: RefCell<Vec<(u32, u32)>>,
    }

    impl ApicRegs for RecRegs {
        fn read(&self, reg: u32) -> u32 {
            self.regs.borrow().get(&reg).copied().unwrap_or(0)
        }

        fn write(&mut self, reg: u32, value: u32) {
            self.regs.borrow_mut().insert(reg, value);
            self.writes.borrow_mut().push((reg, value));
        }
    }

    #[test]
    fn enable_programs_svr_and_clears_esr() {
        let mut apic = LocalApic::new(RecRegs::default());
        apic.enable(0xFF);
        assert_eq!(apic.regs.read(REG_SVR), SVR_ENABLE | 0xFF);
        assert_eq!(apic.regs.read(REG_ESR), 0);
        assert_eq!(apic.regs.read(REG_EOI), 0);
    }

    #[test]
    fn timer_math_for_one_khz() {
        let mut apic = LocalApic::new(RecRegs::default());
        // 64 MHz timer clock, divide-by-16 → 4 M decrements per second;
        // 1 kHz ticks need an initial count of 4000.
        apic.timer_periodic(0xE0, 64_000_000, 1000);
        assert_eq!(apic.regs.read(REG_TIMER_DIV), lapic_div::DIV_16);
        assert_eq!(apic.regs.read(REG_TIMER_INIT), 4000);
        let lvt = apic.regs.read(REG_LVT_TIMER);
        assert_eq!(lvt & 0xFF, 0xE0);
        assert_ne!(lvt & LVT_TIMER_PERIODIC, 0);
        assert_eq!(lvt & LVT_MASKED, 0);
    }

    #[test]
    fn timer_stop_masks_the_lvt() {
        let mut apic = LocalApic::new(RecRegs::default());
        apic.timer_periodic(0xE0, 64_000_000, 1000);
        apic.timer_stop();
        assert_ne!(apic.regs.read(REG_LVT_TIMER) & LVT_MASKED, 0);
        assert_eq!(apic.regs.read(REG_TIMER_INIT), 0);
    }

    #[test]
    fn directed_ipi_targets_the_apic_id() {
        let mut apic = LocalApic::new(RecRegs::default());
        apic.send_ipi(3, 0x40);
        assert_eq!(apic.regs.read(REG_ICR_HI), 3 << 24);
        assert_eq!(apic.regs.read(REG_ICR_LO), 0x40 | ICR_LEVEL_ASSERT);
    }

    #[test]
    fn broadcast_uses_all_excluding_self() {
        let mut apic = LocalApic::new(RecRegs::default());
        apic.broadcast_ipi(0x41);
        let lo = apic.regs.read(REG_ICR_LO);
        assert_eq!(lo & ICR_ALL_EXCL_SELF, ICR_ALL_EXCL_SELF);
        assert_eq!(lo & 0xFF, 0x41);
    }

    #[test]
    fn startup_sequence_is_init_then_two_sipis() {
        let mut apic = LocalApic::new(RecRegs::default());
        apic.start_cpu(1, 0x08);
        let writes = apic.regs.writes.borrow();
        let icr_lo: Vec<u32> = writes
            .iter()
            .filter(|(reg, _)| *reg == REG_ICR_LO)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(icr_lo.len(), 3);
        assert_eq!(icr_lo[0] & (0b111 << 8), ICR_MODE_INIT);
        for sipi in &icr_lo[1..] {
            assert_eq!(sipi & (0b111 << 8), ICR_MODE_STARTUP);
            assert_eq!(sipi & 0xFF, 0x08);
        }
    }
}
