//! # Interrupt Plumbing
//!
//! The minimal descriptor-table setup the core needs: gates for the
//! Local-APIC timer (the scheduler tick), the spurious vector, and the stop
//! vector used by [`stop_cpu`](crate::kapi::stop_cpu). Exception policy
//! stays with the monolithic layer. Hosted builds carry only the vector
//! numbers; ticks are injected by calling
//! [`timer_tick`](crate::kapi::timer_tick) directly.

/// Vector of the Local-APIC timer interrupt.
pub const TIMER_VECTOR: u8 = 0xE0;

/// Spurious-interrupt vector programmed into the SVR.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Vector delivered by `stop_cpu`; parks the CPU for good.
pub const STOP_VECTOR: u8 = 0xF0;

#[cfg(target_os = "none")]
pub(crate) use imp::init_idt;

#[cfg(target_os = "none")]
mod imp {
    use super::{SPURIOUS_VECTOR, STOP_VECTOR, TIMER_VECTOR};
    use core::cell::UnsafeCell;

    /// One 16-byte long-mode interrupt gate.
    #[derive(Debug, Copy, Clone)]
    #[repr(C)]
    struct IdtEntry {
        offset_low: u16,
        selector: u16,
        /// IST index (bits 0..2), gate type and present bit (bits 8..15).
        options: u16,
        offset_mid: u16,
        offset_high: u32,
        reserved: u32,
    }

    impl IdtEntry {
        const fn missing() -> Self {
            Self {
                offset_low: 0,
                selector: 0,
                options: 0,
                offset_mid: 0,
                offset_high: 0,
                reserved: 0,
            }
        }

        fn set_handler(&mut self, handler: u64) {
            self.offset_low = handler as u16;
            self.offset_mid = (handler >> 16) as u16;
            self.offset_high = (handler >> 32) as u32;
            self.selector = 0x08; // kernel code segment of the boot GDT
            self.options = 0x8E00; // present, DPL 0, 64-bit interrupt gate
        }
    }

    #[repr(C, align(16))]
    struct Idt {
        entries: [IdtEntry; 256],
    }

    struct IdtStore(UnsafeCell<Idt>);

    // Safety: written once during init on the BSP, read by the CPU after.
    unsafe impl Sync for IdtStore {}

    static IDT: IdtStore = IdtStore(UnsafeCell::new(Idt {
        entries: [IdtEntry::missing(); 256],
    }));

    /// Build the IDT gates and load IDTR.
    pub(crate) fn init_idt() {
        #[repr(C, packed)]
        struct IdtPointer {
            limit: u16,
            base: u64,
        }

        unsafe {
            let idt = &mut *IDT.0.get();
            let timer: extern "C" fn() = timer_entry;
            let spurious: extern "C" fn() = spurious_entry;
            let stop: extern "C" fn() = stop_entry;
            idt.entries[usize::from(TIMER_VECTOR)].set_handler(timer as usize as u64);
            idt.entries[usize::from(SPURIOUS_VECTOR)].set_handler(spurious as usize as u64);
            idt.entries[usize::from(STOP_VECTOR)].set_handler(stop as usize as u64);

            let pointer = IdtPointer {
                limit: (size_of::<Idt>() - 1) as u16,
                base: IDT.0.get() as u64,
            };
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &raw const pointer,
                options(readonly, nostack, preserves_flags)
            );
        }
    }

    /// Timer entry stub: interrupts arrive with only the CPU-pushed frame,
    /// so every caller-saved register is preserved manually and the stack
    /// is re-aligned for the System V call into Rust.
    #[unsafe(naked)]
    extern "C" fn timer_entry() {
        core::arch::naked_asm!(
            "cld",
            "push rax",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            // Force 16-byte alignment for the call regardless of what was
            // interrupted; the original stack pointer rides along.
            "mov rax, rsp",
            "and rsp, -16",
            "push rax",
            "sub rsp, 8",
            "call {handler}",
            "add rsp, 8",
            "pop rsp",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rax",
            "iretq",
            handler = sym timer_interrupt,
        );
    }

    #[unsafe(naked)]
    extern "C" fn spurious_entry() {
        // No EOI for spurious interrupts.
        core::arch::naked_asm!("iretq");
    }

    #[unsafe(naked)]
    extern "C" fn stop_entry() {
        core::arch::naked_asm!("cli", "2:", "hlt", "jmp 2b");
    }

    /// Rust half of the timer tick: acknowledge, then drive the scheduler.
    extern "C" fn timer_interrupt() {
        if let Some(lapic) = crate::state::LAPIC.lock_irq().as_mut() {
            lapic.eoi();
        }
        crate::kapi::timer_tick();
    }
}
