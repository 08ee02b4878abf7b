//! Serial console on the PL011 UART.
//! Provides thread-safe access to write formatted text to the serial port.

use crate::constants::devices::PL011_BASE;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

/// Data register offset
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const DR: usize = 0x00;
/// Flag register offset
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const FR: usize = 0x18;
/// Flag: Transmit FIFO full
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const FR_TXFF: u32 = 1 << 5;
/// Flag: Receive FIFO empty
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
const FR_RXFE: u32 = 1 << 4;

pub struct Pl011 {
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    base: usize,
}

impl Pl011 {
    /// # Safety
    ///
    /// `base` must be the MMIO base of a PL011 that firmware has already configured.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    #[cfg(target_os = "none")]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[cfg(target_os = "none")]
    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    pub fn send(&mut self, byte: u8) {
        #[cfg(target_os = "none")]
        {
            while self.read_reg(FR) & FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            self.write_reg(DR, byte as u32);
        }
        // Host builds have no UART; mirror to stdout so test output stays readable.
        #[cfg(not(target_os = "none"))]
        {
            use std::io::Write;
            let _ = std::io::stdout().write_all(&[byte]);
        }
    }

    pub fn try_receive(&mut self) -> Option<u8> {
        #[cfg(target_os = "none")]
        {
            if self.read_reg(FR) & FR_RXFE != 0 {
                return None;
            }
            Some((self.read_reg(DR) & 0xFF) as u8)
        }
        #[cfg(not(target_os = "none"))]
        None
    }

    /// Raw bytes, with `\n` expanded to `\r\n` for the terminal.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
    }
}

impl fmt::Write for Pl011 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

lazy_static! {
    /// Thread-safe wrapper around the board's first UART.
    pub static ref SERIAL1: Mutex<Pl011> = Mutex::new(unsafe { Pl011::new(PL011_BASE) });
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL1.lock().write_fmt(args);
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```
/// myras::serial_print!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
///
/// # Examples
/// ```
/// myras::serial_println!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
