//! Cache, barrier, and TLB maintenance for page-table updates.
//!
//! On the bare-metal target these issue the real AArch64 instructions. Host
//! builds (unit tests) compile them to compiler fences so the table-walking
//! code can run unchanged against ordinary memory.

use crate::constants::memory::CACHE_LINE_SIZE;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use core::arch::asm;

/// Clean and invalidate the data cache line holding `addr` to the point of coherency.
#[inline]
pub fn clean_invalidate_line(addr: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        asm!("dc civac, {}", in(reg) addr, options(nostack));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = addr;
}

/// `dc civac` every line of `[start, start + len)`.
pub fn clean_invalidate_range(start: usize, len: usize) {
    let mut line = start & !(CACHE_LINE_SIZE - 1);
    let end = start + len;
    while line < end {
        clean_invalidate_line(line);
        line += CACHE_LINE_SIZE;
    }
}

#[inline]
pub fn dmb_sy() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        asm!("dmb sy", options(nostack));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[inline]
pub fn dsb_sy() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[inline]
pub fn isb() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Publish a page-table entry write to the table walker.
#[inline]
pub fn flush_entry(entry: *const u64) {
    clean_invalidate_line(entry as usize);
    dmb_sy();
}

/// Drop every cached translation for the current translation regime.
pub fn flush_all() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        asm!("tlbi vmalle1is", options(nostack));
    }
    dsb_sy();
    isb();
}
