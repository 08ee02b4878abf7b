pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Upper bound on the number of pages the page allocator can track.
pub const PALLOC_MAX_PAGES: usize = 256 * 1024;
pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const BITMAP_ENTRIES: usize = PALLOC_MAX_PAGES / BITMAP_ENTRY_SIZE;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// Pages handed to the page allocator at boot, carved out right after the image.
pub const BOOT_POOL_PAGES: usize = 16 * 1024; // 64 MiB

/// Every heap payload is aligned to this.
pub const HEAP_ALIGN: usize = 16;
/// Smallest payload a free block may carry after a split.
pub const HEAP_MIN_BLOCK: usize = 16;
/// Bound on free-list traversal before the list is declared corrupt.
pub const HEAP_CYCLE_GUARD: usize = 10_000;

pub const CACHE_LINE_SIZE: usize = 64;

pub const ENTRIES_PER_TABLE: usize = 512;
pub const PHYS_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

pub const GIB: usize = 1024 * 1024 * 1024;
pub const L2_BLOCK_SIZE: usize = 2 * 1024 * 1024;

// Identity-mapped regions installed by paging::init.
pub const DEVICE_REGION_START: usize = 0;
pub const DEVICE_REGION_SIZE: usize = GIB;
pub const RAM_REGION_START: usize = GIB;
pub const RAM_REGION_SIZE: usize = GIB / 2;

/// First virtual address that is never covered by the kernel's shared L0[0] slot.
pub const USER_SPACE_START: usize = 512 * GIB;

// MAIR_EL1: index 0 normal write-back RA/WA, index 1 device nGnRnE.
pub const MAIR_NORMAL_WB: u64 = 0xFF;
pub const MAIR_DEVICE_NGNRNE: u64 = 0x00;
