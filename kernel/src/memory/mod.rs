pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;
pub mod paging;
pub mod tlb;

use crate::constants::memory::PAGE_SIZE;
use crate::errors::KernelError;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    static __kernel_end: u8;
}

/// First page after the kernel image; the boot frame pool starts here.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn pool_base() -> usize {
    let end = unsafe { core::ptr::addr_of!(__kernel_end) } as usize;
    end.next_multiple_of(PAGE_SIZE)
}

/// Bring up physical frames, the heap, and the kernel page tables, in that order.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn init() -> Result<(), KernelError> {
    init_with_pool(pool_base(), crate::constants::memory::BOOT_POOL_PAGES)
}

pub fn init_with_pool(pool_base: usize, page_count: usize) -> Result<(), KernelError> {
    debug_assert!(pool_base % PAGE_SIZE == 0);
    frame_allocator::init(pool_base, page_count);
    heap::init();
    paging::init()?;
    log::info!(
        "memory: {} of {} frames free after paging setup",
        frame_allocator::free_frames(),
        page_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_globals, page_pool};

    #[test]
    fn test_bring_up_on_private_pool() {
        let _guard = lock_globals();
        let pages = 1024;
        init_with_pool(page_pool(pages), pages).unwrap();

        let root = paging::kernel_root().unwrap();
        assert_eq!(paging::active_root(), root);
        let (pa, flags) = paging::translate(root, 0x4008_1000).unwrap();
        assert_eq!(pa, 0x4008_1000);
        assert!(flags.contains(paging::PageTableFlags::ACCESSED));

        let user = paging::create_user_pgd().unwrap();
        let before = frame_allocator::free_frames();
        paging::destroy_user_pgd(user);
        assert_eq!(frame_allocator::free_frames(), before + 1);

        let block = heap::kmalloc(64).unwrap();
        unsafe { heap::kfree(block.as_ptr()) }.unwrap();
    }
}
