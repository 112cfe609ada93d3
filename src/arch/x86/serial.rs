//! 16550 UART on COM1, the kernel console on x86.
use super::{inb, outb};
use spin::Mutex;

const COM1: u16 = 0x3F8;

struct SerialPort {
    port: u16,
}

impl SerialPort {
    const fn new(port: u16) -> Self {
        Self { port }
    }

    /// 115200 baud, 8N1, FIFOs on.
    fn init(&mut self) {
        unsafe {
            outb(self.port + 1, 0x00);
            outb(self.port + 3, 0x80);
            outb(self.port, 0x01);
            outb(self.port + 1, 0x00);
            outb(self.port + 3, 0x03);
            outb(self.port + 2, 0xC7);
            outb(self.port + 4, 0x0B);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { inb(self.port + 5) & 0x20 != 0 }
    }

    fn write_byte(&mut self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe { outb(self.port, byte) }
    }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

pub fn init() {
    SERIAL.lock().init();
}

pub fn write_str(s: &str) {
    let mut serial = SERIAL.lock();
    for byte in s.bytes() {
        if byte == b'\n' {
            serial.write_byte(b'\r');
        }
        serial.write_byte(byte);
    }
}

/// Release the port if the panicking code held it.
///
/// # Safety
///
/// Only for the panic path, where nothing else will run again.
pub unsafe fn force_unlock() {
    if SERIAL.is_locked() {
        SERIAL.force_unlock();
    }
}
