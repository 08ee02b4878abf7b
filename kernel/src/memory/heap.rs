//! The Kernel Heap
//!
//! A first-fit allocator over an address-ordered, singly linked free list.
//! Blocks that fit in a page are carved out of pages taken from the frame
//! allocator one at a time; anything larger goes straight to a contiguous run
//! of frames and is returned to it on free. Freed blocks are merged with their
//! physical neighbours as they are put back on the list.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::constants::memory::{HEAP_ALIGN, HEAP_CYCLE_GUARD, HEAP_MIN_BLOCK, PAGE_SIZE};
use crate::memory::frame_allocator::{GlobalFrameAllocator, PageSource};

const BLOCK_USED: usize = 0xA110_CA7E;
const BLOCK_FREE: usize = 0xF4EE_B10C;

/// Precedes every payload. `next` is meaningful only while the block is free.
#[repr(C)]
struct BlockHeader {
    size: usize,
    /// 0 for blocks carved from heap pages, otherwise the frame count backing the block.
    large_pages: usize,
    next: *mut BlockHeader,
    state: usize,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % HEAP_ALIGN == 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The block is already on the free list.
    DoubleFree,
    /// The pointer was never returned by this heap.
    InvalidPointer,
    /// A list walk exceeded the cycle guard.
    Corrupted,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::DoubleFree => write!(f, "double free"),
            HeapError::InvalidPointer => write!(f, "pointer not owned by the heap"),
            HeapError::Corrupted => write!(f, "free list cycle detected"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub free_bytes: usize,
    pub free_blocks: usize,
}

pub struct KernelHeap<S: PageSource> {
    head: *mut BlockHeader,
    pages: S,
}

// The raw list pointers are only touched through `&mut self`.
unsafe impl<S: PageSource + Send> Send for KernelHeap<S> {}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

fn payload_of(block: *mut BlockHeader) -> NonNull<u8> {
    // Block headers are never null; they live inside pages handed out by `pages`.
    unsafe { NonNull::new_unchecked((block as *mut u8).add(HEADER_SIZE)) }
}

fn end_of(block: *mut BlockHeader) -> usize {
    block as usize + HEADER_SIZE + unsafe { (*block).size }
}

impl<S: PageSource> KernelHeap<S> {
    pub const fn new(pages: S) -> Self {
        Self {
            head: ptr::null_mut(),
            pages,
        }
    }

    /// Forget the free list. Pages already handed to the heap are not returned.
    pub fn reset(&mut self) {
        self.head = ptr::null_mut();
    }

    /// Allocate `size` bytes with a 16-byte aligned payload.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, HEAP_ALIGN)?;
        if size > PAGE_SIZE - HEADER_SIZE {
            return self.alloc_large(size);
        }

        match self.take_first_fit(size) {
            Ok(Some(payload)) => return Some(payload),
            Ok(None) => {}
            Err(_) => return None,
        }

        self.expand()?;
        self.take_first_fit(size).ok().flatten()
    }

    /// Return a payload to the heap.
    ///
    /// # Safety
    ///
    /// `payload` must be null or a pointer previously returned by `alloc` on this heap.
    /// Freeing the same pointer twice is detected and rejected as long as the block
    /// has not been handed out again in between.
    pub unsafe fn free(&mut self, payload: *mut u8) -> Result<(), HeapError> {
        if payload.is_null() {
            return Ok(());
        }
        if payload as usize % HEAP_ALIGN != 0 || (payload as usize) < HEADER_SIZE {
            log::error!("heap: free of misaligned pointer {:p}", payload);
            return Err(HeapError::InvalidPointer);
        }

        let block = payload.sub(HEADER_SIZE) as *mut BlockHeader;
        match (*block).state {
            BLOCK_USED => {}
            BLOCK_FREE => {
                log::error!("heap: double free of {:p}", payload);
                return Err(HeapError::DoubleFree);
            }
            _ => {
                log::error!("heap: free of unknown pointer {:p}", payload);
                return Err(HeapError::InvalidPointer);
            }
        }

        let pages = (*block).large_pages;
        if pages != 0 {
            (*block).state = BLOCK_FREE;
            self.pages.free_pages(block as usize, pages);
            return Ok(());
        }

        self.insert_free(block)
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut cur = self.head;
        let mut steps = 0;
        while !cur.is_null() && steps < HEAP_CYCLE_GUARD {
            unsafe {
                stats.free_bytes += (*cur).size;
                cur = (*cur).next;
            }
            stats.free_blocks += 1;
            steps += 1;
        }
        stats
    }

    /// Check the free-list invariants: bounded, sorted, non-overlapping and fully coalesced.
    pub fn is_consistent(&self) -> bool {
        let mut cur = self.head;
        let mut steps = 0;
        while !cur.is_null() {
            steps += 1;
            if steps > HEAP_CYCLE_GUARD {
                return false;
            }
            unsafe {
                if (*cur).state != BLOCK_FREE || (*cur).size < HEAP_MIN_BLOCK {
                    return false;
                }
                let next = (*cur).next;
                if !next.is_null() && end_of(cur) >= next as usize {
                    return false;
                }
                cur = next;
            }
        }
        true
    }

    fn alloc_large(&mut self, size: usize) -> Option<NonNull<u8>> {
        let pages = size.checked_add(HEADER_SIZE)?.div_ceil(PAGE_SIZE);
        let base = self.pages.alloc_pages(pages)?;
        let block = base as *mut BlockHeader;
        unsafe {
            block.write(BlockHeader {
                size: pages * PAGE_SIZE - HEADER_SIZE,
                large_pages: pages,
                next: ptr::null_mut(),
                state: BLOCK_USED,
            });
        }
        Some(payload_of(block))
    }

    /// Wrap one fresh page as a free block.
    fn expand(&mut self) -> Option<()> {
        let page = self.pages.alloc_page()?;
        let block = page as *mut BlockHeader;
        unsafe {
            block.write(BlockHeader {
                size: PAGE_SIZE - HEADER_SIZE,
                large_pages: 0,
                next: ptr::null_mut(),
                state: BLOCK_USED,
            });
        }
        match self.insert_free(block) {
            Ok(()) => Some(()),
            Err(_) => {
                self.pages.free_pages(page, 1);
                None
            }
        }
    }

    fn link(&mut self, prev: *mut BlockHeader, next: *mut BlockHeader) {
        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { (*prev).next = next };
        }
    }

    fn take_first_fit(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.head;
        let mut steps = 0;

        while !cur.is_null() {
            steps += 1;
            if steps > HEAP_CYCLE_GUARD {
                log::error!("heap: free list cycle detected during alloc");
                return Err(HeapError::Corrupted);
            }

            let block = unsafe { &mut *cur };
            if block.size >= size {
                if block.size - size >= HEADER_SIZE + HEAP_MIN_BLOCK {
                    let rest = (cur as usize + HEADER_SIZE + size) as *mut BlockHeader;
                    unsafe {
                        rest.write(BlockHeader {
                            size: block.size - size - HEADER_SIZE,
                            large_pages: 0,
                            next: block.next,
                            state: BLOCK_FREE,
                        });
                    }
                    block.size = size;
                    self.link(prev, rest);
                } else {
                    self.link(prev, block.next);
                }

                block.next = ptr::null_mut();
                block.state = BLOCK_USED;
                return Ok(Some(payload_of(cur)));
            }

            prev = cur;
            cur = block.next;
        }

        Ok(None)
    }

    /// Splice `block` into the list in address order, then merge it with its neighbours.
    fn insert_free(&mut self, block: *mut BlockHeader) -> Result<(), HeapError> {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.head;
        let mut steps = 0;

        while !cur.is_null() && (cur as usize) < block as usize {
            steps += 1;
            if steps > HEAP_CYCLE_GUARD {
                log::error!("heap: free list cycle detected during free");
                return Err(HeapError::Corrupted);
            }
            prev = cur;
            cur = unsafe { (*cur).next };
        }

        if cur == block || (!prev.is_null() && end_of(prev) > block as usize) {
            log::error!("heap: block {:p} is already free", block);
            return Err(HeapError::DoubleFree);
        }

        unsafe {
            (*block).state = BLOCK_FREE;
            (*block).next = cur;
            self.link(prev, block);

            if !cur.is_null() && end_of(block) == cur as usize {
                (*block).size += HEADER_SIZE + (*cur).size;
                (*block).next = (*cur).next;
            }
            if !prev.is_null() && end_of(prev) == block as usize {
                (*prev).size += HEADER_SIZE + (*block).size;
                (*prev).next = (*block).next;
            }
        }

        Ok(())
    }
}

/// The heap behind `alloc::` collections, fed from the global frame allocator.
pub struct LockedHeap(Mutex<KernelHeap<GlobalFrameAllocator>>);

impl LockedHeap {
    pub const fn new() -> Self {
        LockedHeap(Mutex::new(KernelHeap::new(GlobalFrameAllocator)))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, KernelHeap<GlobalFrameAllocator>> {
        self.0.lock()
    }
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.0.lock();
        if layout.align() <= HEAP_ALIGN {
            return heap
                .alloc(layout.size().max(1))
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate and stash the real payload just below the aligned one.
        let Some(raw) = layout
            .size()
            .checked_add(layout.align())
            .and_then(|size| heap.alloc(size))
        else {
            return ptr::null_mut();
        };
        // The payload is `align` bytes longer than asked, so this cannot wrap.
        let aligned = (raw.as_ptr() as usize + layout.align()) & !(layout.align() - 1);
        (aligned as *mut usize).sub(1).write(raw.as_ptr() as usize);
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= HEAP_ALIGN {
            ptr
        } else {
            (ptr as *mut usize).sub(1).read() as *mut u8
        };
        if let Err(err) = self.0.lock().free(raw) {
            log::error!("heap: dealloc of {:p} ({} bytes) rejected: {}", ptr, layout.size(), err);
        }
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap::new();

/// Start the kernel heap with an empty free list. Pages are pulled in on demand.
pub fn init() {
    ALLOCATOR.lock().reset();
    log::info!("kernel heap ready");
}

/// Allocate from the kernel heap outside the `alloc::` collections.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    ALLOCATOR.lock().alloc(size)
}

/// # Safety
///
/// `ptr` must come from `kmalloc`.
pub unsafe fn kfree(ptr: *mut u8) -> Result<(), HeapError> {
    ALLOCATOR.lock().free(ptr)
}

pub fn stats() -> HeapStats {
    ALLOCATOR.lock().stats()
}
