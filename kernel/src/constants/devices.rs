//! MMIO addresses for the QEMU `virt` board.

pub const PL011_BASE: usize = 0x0900_0000;

/// Bytes buffered between the console pump and the shell.
pub const CONSOLE_QUEUE_SIZE: usize = 256;

pub const CTRL_C: u8 = 0x03;
