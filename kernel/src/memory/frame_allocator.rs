use crate::constants::memory::PAGE_SIZE;
use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use spin::Mutex;

/// Global frame allocator that makes it so we just have one actual allocator throughout codebase
/// Requires some basic synchronization
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::empty());

/// Anything that can hand out physical pages.
///
/// The heap and the page-table code are written against this so they can run on
/// the global pool in the kernel and on a private pool in tests.
pub trait PageSource {
    fn alloc_page(&mut self) -> Option<usize>;
    fn alloc_pages(&mut self, count: usize) -> Option<usize>;
    fn free_pages(&mut self, addr: usize, count: usize);

    /// A single page with every byte cleared.
    fn alloc_zeroed_page(&mut self) -> Option<usize> {
        let page = self.alloc_page()?;
        unsafe { core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
        Some(page)
    }
}

impl PageSource for BitmapFrameAllocator {
    fn alloc_page(&mut self) -> Option<usize> {
        self.allocate_frame()
    }

    fn alloc_pages(&mut self, count: usize) -> Option<usize> {
        self.allocate_contiguous(count)
    }

    fn free_pages(&mut self, addr: usize, count: usize) {
        self.deallocate_frames(addr, count)
    }
}

impl<T: PageSource + ?Sized> PageSource for &mut T {
    fn alloc_page(&mut self) -> Option<usize> {
        (**self).alloc_page()
    }

    fn alloc_pages(&mut self, count: usize) -> Option<usize> {
        (**self).alloc_pages(count)
    }

    fn free_pages(&mut self, addr: usize, count: usize) {
        (**self).free_pages(addr, count)
    }
}

/// Handle onto `FRAME_ALLOCATOR`; each call takes the lock for its own duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalFrameAllocator;

impl PageSource for GlobalFrameAllocator {
    fn alloc_page(&mut self) -> Option<usize> {
        alloc_frame()
    }

    fn alloc_pages(&mut self, count: usize) -> Option<usize> {
        alloc_frames(count)
    }

    fn free_pages(&mut self, addr: usize, count: usize) {
        dealloc_frames(addr, count)
    }
}

/// Hand the pool `[pool_base, pool_base + page_count * PAGE_SIZE)` to the global allocator.
pub fn init(pool_base: usize, page_count: usize) {
    FRAME_ALLOCATOR.lock().init(pool_base, page_count);
}

/// Exposed function to allocate a frame from the global pool
pub fn alloc_frame() -> Option<usize> {
    with_frame_allocator(|allocator| allocator.allocate_frame())
}

/// Allocate `count` physically contiguous frames from the global pool
pub fn alloc_frames(count: usize) -> Option<usize> {
    with_frame_allocator(|allocator| allocator.allocate_contiguous(count))
}

/// Exposed function to return frames to the global pool
pub fn dealloc_frames(addr: usize, count: usize) {
    with_frame_allocator(|allocator| allocator.deallocate_frames(addr, count))
}

pub fn free_frames() -> usize {
    with_frame_allocator(|allocator| allocator.free_frames())
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    let mut guard = FRAME_ALLOCATOR.lock();
    f(&mut guard)
}
