//! # Serial Logger
//!
//! `log` facade backend writing to the COM1 UART. Early enough for every
//! init message; hosted builds keep the same code path with inert port I/O.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::SpinLock;
use log::{LevelFilter, Log, Metadata, Record};

const COM1: u16 = 0x3F8;

struct SerialPort;

impl SerialPort {
    /// 115200 baud, 8N1, FIFOs on.
    fn init(&mut self) {
        unsafe {
            kernel_arch::outb(COM1 + 1, 0x00); // interrupts off
            kernel_arch::outb(COM1 + 3, 0x80); // DLAB
            kernel_arch::outb(COM1, 0x01); // divisor 1
            kernel_arch::outb(COM1 + 1, 0x00);
            kernel_arch::outb(COM1 + 3, 0x03); // 8N1
            kernel_arch::outb(COM1 + 2, 0xC7); // FIFO, cleared, 14-byte trigger
        }
    }

    fn put(&mut self, byte: u8) {
        unsafe {
            // Wait for the transmit holding register to empty.
            while kernel_arch::inb(COM1 + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            kernel_arch::outb(COM1, byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}

static PORT: SpinLock<SerialPort> = SpinLock::new(SerialPort);

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = PORT.lock_irq();
        let _ = writeln!(port, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the serial logger once; later calls are no-ops (including the
/// hosted case where the test harness may own the global logger already).
pub(crate) fn init() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    PORT.lock().init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
