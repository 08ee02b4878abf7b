#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod devices;
pub mod errors;
pub mod filesys;
pub mod init;
pub mod logging;
pub mod memory;
pub mod programs;
pub mod sched;
pub mod services;
pub mod shell;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

pub fn idle_loop() -> ! {
    loop {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        aarch64_cpu::asm::wfe();
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        core::hint::spin_loop();
    }
}
