//! Boot sequence.

use crate::{
    devices::console::{self, SerialTerminal},
    errors::KernelError,
    filesys, sched, serial_println, services,
    shell::Shell,
};

/// Full bring-up on the board: logging, memory, then everything else.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn init() -> Result<(), KernelError> {
    crate::logging::init();
    serial_println!("Booting myras...");
    crate::memory::init()?;
    start_system()
}

/// Everything after memory: the scheduler, console, filesystem and services,
/// then the console pump and the shell as the first two tasks.
pub fn start_system() -> Result<(), KernelError> {
    sched::init();
    console::init();
    filesys::init()?;
    services::init();

    let pump = sched::spawn("console", console::pump()).ok_or(KernelError::OutOfMemory)?;
    let shell = sched::spawn("shell", Shell::new(SerialTerminal).run())
        .ok_or(KernelError::OutOfMemory)?;
    log::info!("boot: console pump pid {}, shell pid {}", pump, shell);
    serial_println!("myras ready. Type `help` for commands.");
    Ok(())
}
