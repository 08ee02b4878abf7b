//! Device access: the PL011 serial port and the console input built on it.

pub mod console;
pub mod serial;
