//! COM1 serial driver for kernel diagnostics output.
//!
//! 16550-compatible UART at I/O port 0x3F8, programmed for 115200 8N1.

use core::{arch::asm, fmt};

use lazy_static::lazy_static;
use spin::Mutex;

const COM1: u16 = 0x3F8;

fn outb(port: u16, value: u8) {
    // SAFETY: Port writes to the COM1 register block only affect the UART.
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

fn inb(port: u16) -> u8 {
    let value: u8;
    // SAFETY: Port reads from the COM1 register block have no side effects
    // beyond the UART itself.
    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    }
    value
}

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    fn new(base: u16) -> Self {
        let port = Self { base };
        port.init();
        port
    }

    fn init(&self) {
        outb(self.base + 1, 0x00); // disable interrupts
        outb(self.base + 3, 0x80); // DLAB on
        outb(self.base, 0x01); // divisor 1 = 115200 baud
        outb(self.base + 1, 0x00);
        outb(self.base + 3, 0x03); // 8N1, DLAB off
        outb(self.base + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
        outb(self.base + 4, 0x0B); // RTS/DSR set
    }

    fn write_byte(&mut self, byte: u8) {
        while inb(self.base + 5) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        outb(self.base, byte);
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    let flags = super::interrupts_save_disable();
    SERIAL1
        .lock()
        .write_fmt(args)
        .expect("serial write_fmt failed");
    super::interrupts_restore(flags);
}
