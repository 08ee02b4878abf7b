//! System-wide constants and hardware-specific values.
//!
//! Everything tunable about the kernel is fixed at compile time here; there is
//! no runtime configuration source.

pub mod devices;
pub mod fs;
pub mod memory;
pub mod sched;
pub mod shell;
