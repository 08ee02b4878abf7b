use crate::constants::memory::{
    BITMAP_ENTRIES, BITMAP_ENTRY_SIZE, FULL_BITMAP_ENTRY, PAGE_SIZE, PALLOC_MAX_PAGES,
};

/// First-fit page allocator over one contiguous pool.
///
/// A set bit means the frame is handed out. Bits past `total_frames` stay set so
/// whole-word scans never walk off the pool.
pub struct BitmapFrameAllocator {
    base: usize,
    total_frames: usize,
    free_frames: usize,
    bitmap: [u64; BITMAP_ENTRIES],
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::empty()
    }
}

impl BitmapFrameAllocator {
    /// An allocator that owns no pages until `init` is called.
    pub const fn empty() -> Self {
        Self {
            base: 0,
            total_frames: 0,
            free_frames: 0,
            bitmap: [FULL_BITMAP_ENTRY; BITMAP_ENTRIES],
        }
    }

    /// Take ownership of `page_count` pages starting at `pool_base` and mark all of them free.
    ///
    /// `pool_base` must be page aligned. Counts above `PALLOC_MAX_PAGES` are clamped.
    pub fn init(&mut self, pool_base: usize, page_count: usize) {
        let page_count = if page_count > PALLOC_MAX_PAGES {
            log::warn!(
                "page pool of {} pages clamped to {}",
                page_count,
                PALLOC_MAX_PAGES
            );
            PALLOC_MAX_PAGES
        } else {
            page_count
        };

        self.base = pool_base;
        self.total_frames = page_count;
        self.free_frames = 0;
        self.bitmap.fill(FULL_BITMAP_ENTRY);
        self.free_region(0, page_count);

        log::debug!(
            "page allocator: {} pages at {:#x}",
            page_count,
            pool_base
        );
    }

    /// Mark frames [start, start + count) as free in the bitmap.
    fn free_region(&mut self, start: usize, count: usize) {
        for frame_index in start..start + count {
            self.clear_bit(frame_index);
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Whether `addr` lies inside the pool.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.total_frames * PAGE_SIZE
    }

    /// Check if the frame holding `addr` is handed out.
    pub fn is_frame_used(&self, addr: usize) -> bool {
        self.contains(addr) && self.is_bit_set((addr - self.base) / PAGE_SIZE)
    }

    /// Allocate a single page, lowest address first.
    pub fn allocate_frame(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }

        let words = self.total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        for word_index in 0..words {
            let word = self.bitmap[word_index];
            if word == FULL_BITMAP_ENTRY {
                continue;
            }

            let frame_index = word_index * BITMAP_ENTRY_SIZE + (!word).trailing_zeros() as usize;
            if frame_index >= self.total_frames {
                break;
            }
            self.set_bit(frame_index);
            return Some(self.frame_address(frame_index));
        }

        None
    }

    /// Allocate the lowest-addressed run of `count` consecutive free pages.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_frames {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame_index = 0;
        while frame_index < self.total_frames {
            // A full word cannot host any part of a run.
            if frame_index % BITMAP_ENTRY_SIZE == 0
                && self.bitmap[frame_index / BITMAP_ENTRY_SIZE] == FULL_BITMAP_ENTRY
            {
                frame_index += BITMAP_ENTRY_SIZE;
                run_start = frame_index;
                run_len = 0;
                continue;
            }

            if self.is_bit_set(frame_index) {
                run_start = frame_index + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    for index in run_start..run_start + count {
                        self.set_bit(index);
                    }
                    return Some(self.frame_address(run_start));
                }
            }
            frame_index += 1;
        }

        None
    }

    /// Return `count` pages starting at `addr` to the pool.
    ///
    /// Pointers that are unaligned or outside the pool are reported and ignored.
    pub fn deallocate_frames(&mut self, addr: usize, count: usize) {
        let in_pool = addr % PAGE_SIZE == 0
            && addr >= self.base
            && ((addr - self.base) / PAGE_SIZE)
                .checked_add(count)
                .is_some_and(|end| end <= self.total_frames);
        if !in_pool {
            log::error!(
                "page allocator: rejecting free of {} pages at {:#x}",
                count,
                addr
            );
            return;
        }

        let first = (addr - self.base) / PAGE_SIZE;
        for frame_index in first..first + count {
            if !self.is_bit_set(frame_index) {
                log::warn!(
                    "page allocator: page {:#x} freed while already free",
                    self.frame_address(frame_index)
                );
                continue;
            }
            self.clear_bit(frame_index);
        }
    }

    fn frame_address(&self, frame_index: usize) -> usize {
        self.base + frame_index * PAGE_SIZE
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask == 0 {
            self.bitmap[word_index] |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask != 0 {
            self.bitmap[word_index] &= !mask;
            self.free_frames += 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[word_index] & mask) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::page_pool;
    use alloc::boxed::Box;

    fn allocator(pages: usize) -> Box<BitmapFrameAllocator> {
        let mut frames = Box::new(BitmapFrameAllocator::empty());
        frames.init(page_pool(pages), pages);
        frames
    }

    #[test]
    fn test_single_pages_are_first_fit() {
        let mut frames = allocator(8);
        let base = frames.base();

        assert_eq!(frames.allocate_frame(), Some(base));
        assert_eq!(frames.allocate_frame(), Some(base + PAGE_SIZE));
        frames.deallocate_frames(base, 1);
        assert_eq!(frames.allocate_frame(), Some(base));
        assert_eq!(frames.free_frames(), 6);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut frames = allocator(3);
        for _ in 0..3 {
            assert!(frames.allocate_frame().is_some());
        }
        assert_eq!(frames.allocate_frame(), None);
        assert_eq!(frames.allocate_contiguous(1), None);
    }

    #[test]
    fn test_contiguous_picks_lowest_run() {
        let mut frames = allocator(16);
        let base = frames.base();

        let a = frames.allocate_contiguous(2).unwrap();
        let b = frames.allocate_contiguous(3).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + 2 * PAGE_SIZE);

        // Leave a one-page hole that a two-page run must skip.
        frames.deallocate_frames(a, 1);
        let c = frames.allocate_contiguous(2).unwrap();
        assert_eq!(c, base + 5 * PAGE_SIZE);
        assert_eq!(frames.allocate_contiguous(1), Some(base));
    }

    #[test]
    fn test_contiguous_spans_bitmap_words() {
        let mut frames = allocator(200);
        let base = frames.base();

        for _ in 0..60 {
            frames.allocate_frame().unwrap();
        }
        let run = frames.allocate_contiguous(70).unwrap();
        assert_eq!(run, base + 60 * PAGE_SIZE);
        for index in 60..130 {
            assert!(frames.is_frame_used(base + index * PAGE_SIZE));
        }
        assert!(!frames.is_frame_used(base + 130 * PAGE_SIZE));
    }

    #[test]
    fn test_alloc_free_restores_free_count() {
        let mut frames = allocator(64);
        let before = frames.free_frames();

        for count in [1, 3, 17, 64] {
            let run = frames.allocate_contiguous(count).unwrap();
            frames.deallocate_frames(run, count);
            assert_eq!(frames.free_frames(), before);
        }
    }

    #[test]
    fn test_bad_free_is_ignored() {
        let mut frames = allocator(4);
        let base = frames.base();
        let page = frames.allocate_frame().unwrap();

        frames.deallocate_frames(page + 1, 1);
        frames.deallocate_frames(base + 8 * PAGE_SIZE, 1);
        frames.deallocate_frames(base, 5);
        frames.deallocate_frames(page, usize::MAX);
        assert_eq!(frames.free_frames(), 3);

        // Freeing twice does not inflate the count.
        frames.deallocate_frames(page, 1);
        frames.deallocate_frames(page, 1);
        assert_eq!(frames.free_frames(), 4);
    }

    #[test]
    fn test_runs_never_overlap() {
        let mut frames = allocator(32);
        let mut runs = alloc::vec::Vec::new();
        while let Some(run) = frames.allocate_contiguous(3) {
            runs.push(run);
        }
        assert_eq!(runs.len(), 10);
        for pair in runs.windows(2) {
            assert!(pair[0] + 3 * PAGE_SIZE <= pair[1]);
        }
    }
}
