#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod boot {
    use myras::{idle_loop, init, sched, serial_println};

    // Core 0 enables FP/SIMD, takes the stack from the linker script, clears
    // .bss and enters kmain. Other cores park.
    core::arch::global_asm!(
        ".section .text.boot, \"ax\"",
        ".global _start",
        "_start:",
        "    mrs x1, mpidr_el1",
        "    and x1, x1, #3",
        "    cbz x1, 2f",
        "1:  wfe",
        "    b 1b",
        "2:  mov x1, #(3 << 20)",
        "    msr cpacr_el1, x1",
        "    isb",
        "    ldr x1, =__stack_top",
        "    mov sp, x1",
        "    ldr x1, =__bss_start",
        "    ldr x2, =__bss_end",
        "3:  cmp x1, x2",
        "    b.hs 4f",
        "    str xzr, [x1], #8",
        "    b 3b",
        "4:  bl kmain",
        "    b 1b",
    );

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        match init::init() {
            Ok(()) => sched::run(),
            Err(err) => {
                serial_println!("boot failed: {}", err);
                idle_loop();
            }
        }
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        idle_loop();
    }
}

// The host build only exists so the library's tests can run.
#[cfg(not(target_os = "none"))]
fn main() {}
