//! AArch64 translation tables: 4 KiB granule, four levels, 48-bit input addresses.
//!
//! The kernel runs identity mapped, so a table's physical address is also the
//! pointer used to edit it. Every entry written to a table that the walker may
//! already see is cleaned to the point of coherency and followed by `dmb sy`.

use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::constants::memory::{
    DEVICE_REGION_SIZE, DEVICE_REGION_START, ENTRIES_PER_TABLE, L2_BLOCK_SIZE, PAGE_SHIFT,
    PAGE_SIZE, PHYS_ADDR_MASK, RAM_REGION_SIZE, RAM_REGION_START,
};
use crate::memory::frame_allocator::{GlobalFrameAllocator, PageSource};
use crate::memory::tlb;

bitflags! {
    /// Descriptor bits, minus the output address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at L0-L2, page descriptor at L3.
        const TABLE = 1 << 1;
        /// MAIR index 1 (device nGnRnE); index 0 is normal memory.
        const DEVICE = 1 << 2;
        const USER = 1 << 6;
        const READ_ONLY = 1 << 7;
        const INNER_SHAREABLE = 3 << 8;
        const ACCESSED = 1 << 10;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

impl PageTableFlags {
    pub const PAGE: Self = Self::TABLE;
    pub const NORMAL: Self = Self::empty();
    const ATTRIBUTE_MASK: u64 = !PHYS_ADDR_MASK;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Not enough frames for the intermediate tables.
    OutOfMemory,
    /// An intermediate level holds a block descriptor where a table is needed.
    BlockInTheWay,
    /// The kernel tables have not been built yet.
    NoKernelRoot,
    /// The range wraps past the end of the address space.
    AddressOverflow,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of frames for page tables"),
            MapError::BlockInTheWay => write!(f, "block descriptor in the way"),
            MapError::NoKernelRoot => write!(f, "kernel page tables not initialised"),
            MapError::AddressOverflow => write!(f, "range wraps the address space"),
        }
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    /// Write an entry and publish it to the table walker.
    fn set(&mut self, index: usize, value: u64) {
        self.entries[index] = value;
        tlb::flush_entry(&self.entries[index]);
    }

    fn is_valid(&self, index: usize) -> bool {
        self.entries[index] & PageTableFlags::VALID.bits() != 0
    }

    fn next_table_address(&self, index: usize) -> Result<Option<usize>, MapError> {
        let entry = self.entries[index];
        if entry & PageTableFlags::VALID.bits() == 0 {
            return Ok(None);
        }
        if entry & PageTableFlags::TABLE.bits() == 0 {
            return Err(MapError::BlockInTheWay);
        }
        Ok(Some((entry & PHYS_ADDR_MASK) as usize))
    }
}

/// # Safety
///
/// `addr` must be the address of a live, identity-mapped page table.
unsafe fn table_at<'a>(addr: usize) -> &'a mut PageTable {
    &mut *(addr as *mut PageTable)
}

/// Page table level indices from a virtual address
#[derive(Debug, Clone, Copy)]
pub struct VirtAddrParts {
    pub l0: usize,
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
    pub offset: usize,
}

impl VirtAddrParts {
    pub const fn from_vaddr(vaddr: usize) -> Self {
        Self {
            l0: (vaddr >> (PAGE_SHIFT + 27)) & 0x1FF,
            l1: (vaddr >> (PAGE_SHIFT + 18)) & 0x1FF,
            l2: (vaddr >> (PAGE_SHIFT + 9)) & 0x1FF,
            l3: (vaddr >> PAGE_SHIFT) & 0x1FF,
            offset: vaddr & (PAGE_SIZE - 1),
        }
    }
}

/// Frames set aside for new tables before a mapping starts, kept as an
/// intrusive stack threaded through the first word of each frame.
struct TableReserve {
    head: usize,
    len: usize,
}

impl TableReserve {
    fn fill(count: usize, frames: &mut impl PageSource) -> Result<Self, MapError> {
        let mut reserve = TableReserve { head: 0, len: 0 };
        for _ in 0..count {
            match frames.alloc_page() {
                Some(page) => {
                    unsafe { (page as *mut usize).write(reserve.head) };
                    reserve.head = page;
                    reserve.len += 1;
                }
                None => {
                    reserve.release(frames);
                    return Err(MapError::OutOfMemory);
                }
            }
        }
        Ok(reserve)
    }

    /// A zeroed, cache-clean table frame.
    fn take(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let page = self.head;
        self.head = unsafe { (page as *const usize).read() };
        self.len -= 1;
        unsafe { core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
        tlb::clean_invalidate_range(page, PAGE_SIZE);
        Some(page)
    }

    fn release(&mut self, frames: &mut impl PageSource) {
        while self.len > 0 {
            let page = self.head;
            self.head = unsafe { (page as *const usize).read() };
            self.len -= 1;
            frames.free_pages(page, 1);
        }
    }
}

/// Number of tables `map` has to create to cover `[start, end)`.
fn missing_tables(root: usize, start: usize, end: usize) -> Result<usize, MapError> {
    let mut needed = 0;
    let mut last_l1 = None;
    let mut last_l2 = None;

    let mut chunk = start & !(L2_BLOCK_SIZE - 1);
    while chunk < end {
        let parts = VirtAddrParts::from_vaddr(chunk);
        let l0 = unsafe { table_at(root) };

        let (need_l1, need_l2, need_l3) = match l0.next_table_address(parts.l0)? {
            None => (true, true, true),
            Some(l1_addr) => match unsafe { table_at(l1_addr) }.next_table_address(parts.l1)? {
                None => (false, true, true),
                Some(l2_addr) => {
                    let present = unsafe { table_at(l2_addr) }.next_table_address(parts.l2)?;
                    (false, false, present.is_none())
                }
            },
        };

        if need_l1 && last_l1 != Some(chunk >> 39) {
            last_l1 = Some(chunk >> 39);
            needed += 1;
        }
        if need_l2 && last_l2 != Some(chunk >> 30) {
            last_l2 = Some(chunk >> 30);
            needed += 1;
        }
        if need_l3 {
            needed += 1;
        }

        chunk += L2_BLOCK_SIZE;
    }

    Ok(needed)
}

/// Follow `table[index]`, linking in a reserved frame if the slot is empty.
fn next_level(table_addr: usize, index: usize, reserve: &mut TableReserve) -> Result<usize, MapError> {
    let table = unsafe { table_at(table_addr) };
    if let Some(next) = table.next_table_address(index)? {
        return Ok(next);
    }

    let next = reserve.take().ok_or(MapError::OutOfMemory)?;
    table.set(
        index,
        next as u64 | (PageTableFlags::VALID | PageTableFlags::TABLE).bits(),
    );
    Ok(next)
}

/// Map `[va, va + size)` onto `[pa, pa + size)` in the tree rooted at `root`.
///
/// Both ends are widened to page boundaries. All missing tables are reserved up
/// front, so on error the tree is exactly as it was.
pub fn map(
    root: usize,
    va: usize,
    pa: usize,
    size: usize,
    flags: PageTableFlags,
    frames: &mut impl PageSource,
) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }

    let start = va & !(PAGE_SIZE - 1);
    let end = va
        .checked_add(size)
        .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
        .ok_or(MapError::AddressOverflow)?;
    let phys_start = pa & !(PAGE_SIZE - 1);
    phys_start
        .checked_add(end - start)
        .ok_or(MapError::AddressOverflow)?;

    let needed = missing_tables(root, start, end)?;
    let mut reserve = TableReserve::fill(needed, frames)?;

    let leaf_bits = (flags | PageTableFlags::VALID | PageTableFlags::PAGE).bits();
    let mut page = start;
    let result = loop {
        if page >= end {
            break Ok(());
        }
        let parts = VirtAddrParts::from_vaddr(page);
        let l3 = match next_level(root, parts.l0, &mut reserve)
            .and_then(|l1| next_level(l1, parts.l1, &mut reserve))
            .and_then(|l2| next_level(l2, parts.l2, &mut reserve))
        {
            Ok(l3) => l3,
            Err(err) => break Err(err),
        };

        let frame = (phys_start + (page - start)) as u64 & PHYS_ADDR_MASK;
        unsafe { table_at(l3) }.set(parts.l3, frame | leaf_bits);
        page += PAGE_SIZE;
    };

    reserve.release(frames);
    tlb::flush_all();
    result
}

/// Clear the leaf entries covering `[va, va + size)`. Tables are left in place.
pub fn unmap(root: usize, va: usize, size: usize) {
    let start = va & !(PAGE_SIZE - 1);
    let Some(end) = va
        .checked_add(size)
        .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
    else {
        log::error!("paging: unmap of {:#x}+{:#x} wraps, ignored", va, size);
        return;
    };

    let mut page = start;
    while page < end {
        if let Some(l3) = leaf_table(root, page) {
            let parts = VirtAddrParts::from_vaddr(page);
            let table = unsafe { table_at(l3) };
            if table.is_valid(parts.l3) {
                table.set(parts.l3, 0);
            }
        }
        page += PAGE_SIZE;
    }
    tlb::flush_all();
}

fn leaf_table(root: usize, va: usize) -> Option<usize> {
    let parts = VirtAddrParts::from_vaddr(va);
    let l1 = unsafe { table_at(root) }.next_table_address(parts.l0).ok()??;
    let l2 = unsafe { table_at(l1) }.next_table_address(parts.l1).ok()??;
    unsafe { table_at(l2) }.next_table_address(parts.l2).ok()?
}

/// Walk the tables for `va`, returning the physical address and the leaf's attribute bits.
pub fn translate(root: usize, va: usize) -> Option<(usize, PageTableFlags)> {
    let l3 = leaf_table(root, va)?;
    let parts = VirtAddrParts::from_vaddr(va);
    let entry = unsafe { table_at(l3) }.get(parts.l3);
    if entry & PageTableFlags::VALID.bits() == 0 {
        return None;
    }
    let pa = (entry & PHYS_ADDR_MASK) as usize + parts.offset;
    Some((
        pa,
        PageTableFlags::from_bits_truncate(entry & PageTableFlags::ATTRIBUTE_MASK),
    ))
}

/// A fresh root sharing the kernel's L0[0] slot.
pub fn new_user_root(kernel_root: usize, frames: &mut impl PageSource) -> Option<usize> {
    let root = frames.alloc_zeroed_page()?;
    let shared = unsafe { table_at(kernel_root) }.get(0);
    unsafe { table_at(root) }.entries[0] = shared;
    tlb::clean_invalidate_range(root, PAGE_SIZE);
    tlb::dmb_sy();
    Some(root)
}

/// Free every table owned by a user root, then the root itself.
///
/// The shared kernel slot is skipped. Frames mapped by L3 entries belong to
/// whoever mapped them and are not touched.
pub fn free_user_root(root: usize, kernel_root: usize, frames: &mut impl PageSource) {
    let shared = unsafe { table_at(kernel_root) }.get(0);
    let table = unsafe { table_at(root) };
    for index in 0..ENTRIES_PER_TABLE {
        if index == 0 && table.get(0) == shared {
            continue;
        }
        if let Ok(Some(child)) = table.next_table_address(index) {
            free_subtree(child, 1, frames);
        }
    }
    frames.free_pages(root, 1);
}

fn free_subtree(table_addr: usize, level: usize, frames: &mut impl PageSource) {
    if level < 3 {
        let table = unsafe { table_at(table_addr) };
        for index in 0..ENTRIES_PER_TABLE {
            if let Ok(Some(child)) = table.next_table_address(index) {
                free_subtree(child, level + 1, frames);
            }
        }
    }
    frames.free_pages(table_addr, 1);
}

/// Allocate a kernel root and install the boot identity map.
pub fn build_kernel_tables(frames: &mut impl PageSource) -> Result<usize, MapError> {
    let root = frames.alloc_zeroed_page().ok_or(MapError::OutOfMemory)?;
    tlb::clean_invalidate_range(root, PAGE_SIZE);

    let built = map(
        root,
        DEVICE_REGION_START,
        DEVICE_REGION_START,
        DEVICE_REGION_SIZE,
        PageTableFlags::ACCESSED | PageTableFlags::DEVICE,
        frames,
    )
    .and_then(|()| {
        map(
            root,
            RAM_REGION_START,
            RAM_REGION_START,
            RAM_REGION_SIZE,
            PageTableFlags::ACCESSED | PageTableFlags::INNER_SHAREABLE | PageTableFlags::NORMAL,
            frames,
        )
    });

    if let Err(err) = built {
        free_subtree(root, 0, frames);
        return Err(err);
    }
    Ok(root)
}

/// Root of the kernel address space, set once by `init`.
pub static KERNEL_ROOT: Mutex<Option<usize>> = Mutex::new(None);

/// Root currently loaded in TTBR0_EL1.
static ACTIVE_ROOT: AtomicUsize = AtomicUsize::new(0);

pub fn kernel_root() -> Option<usize> {
    *KERNEL_ROOT.lock()
}

pub fn active_root() -> usize {
    ACTIVE_ROOT.load(Ordering::Acquire)
}

/// Build the kernel tables and turn the MMU on.
pub fn init() -> Result<(), MapError> {
    let root = build_kernel_tables(&mut GlobalFrameAllocator)?;
    *KERNEL_ROOT.lock() = Some(root);
    ACTIVE_ROOT.store(root, Ordering::Release);

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        clean_bss();
        enable_mmu(root);
    }

    log::info!("paging: kernel root at {:#x}, MMU on", root);
    Ok(())
}

/// Map into the kernel address space using the global frame pool.
pub fn map_kernel(va: usize, pa: usize, size: usize, flags: PageTableFlags) -> Result<(), MapError> {
    let root = kernel_root().ok_or(MapError::NoKernelRoot)?;
    map(root, va, pa, size, flags, &mut GlobalFrameAllocator)
}

pub fn create_user_pgd() -> Option<usize> {
    new_user_root(kernel_root()?, &mut GlobalFrameAllocator)
}

pub fn destroy_user_pgd(root: usize) {
    match kernel_root() {
        Some(kernel) if kernel != root => free_user_root(root, kernel, &mut GlobalFrameAllocator),
        _ => log::error!("paging: refusing to free root {:#x}", root),
    }
}

/// Load `root` into TTBR0_EL1 and drop stale translations.
pub fn switch(root: usize) {
    if ACTIVE_ROOT.swap(root, Ordering::AcqRel) == root {
        return;
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        use aarch64_cpu::registers::{Writeable, TTBR0_EL1};
        TTBR0_EL1.set(root as u64);
    }
    tlb::isb();
    tlb::flush_all();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
unsafe fn clean_bss() {
    extern "C" {
        static __bss_start: u8;
        static __bss_end: u8;
    }
    let start = core::ptr::addr_of!(__bss_start) as usize;
    let end = core::ptr::addr_of!(__bss_end) as usize;
    tlb::clean_invalidate_range(start, end - start);
    tlb::dsb_sy();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
unsafe fn enable_mmu(root: usize) {
    use crate::constants::memory::{MAIR_DEVICE_NGNRNE, MAIR_NORMAL_WB};
    use aarch64_cpu::registers::{Readable, Writeable, MAIR_EL1, SCTLR_EL1, TCR_EL1, TTBR0_EL1};

    const T0SZ_48BIT: u64 = 16;
    const IRGN0_WBWA: u64 = 0b01 << 8;
    const ORGN0_WBWA: u64 = 0b01 << 10;
    const SH0_INNER: u64 = 0b11 << 12;
    const TG0_4KB: u64 = 0b00 << 14;
    const EPD1: u64 = 1 << 23;
    const IPS_40BIT: u64 = 0b010 << 32;

    const SCTLR_M: u64 = 1 << 0;
    const SCTLR_C: u64 = 1 << 2;
    const SCTLR_I: u64 = 1 << 12;

    MAIR_EL1.set(MAIR_NORMAL_WB | (MAIR_DEVICE_NGNRNE << 8));
    TCR_EL1.set(T0SZ_48BIT | IRGN0_WBWA | ORGN0_WBWA | SH0_INNER | TG0_4KB | EPD1 | IPS_40BIT);
    TTBR0_EL1.set(root as u64);
    tlb::dsb_sy();
    tlb::isb();
    tlb::flush_all();

    SCTLR_EL1.set(SCTLR_EL1.get() | SCTLR_M | SCTLR_C | SCTLR_I);
    tlb::isb();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::{GIB, USER_SPACE_START};
    use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
    use crate::test_support::page_pool;
    use alloc::boxed::Box;

    fn frames(pages: usize) -> Box<BitmapFrameAllocator> {
        let mut frames = Box::new(BitmapFrameAllocator::empty());
        frames.init(page_pool(pages), pages);
        frames
    }

    fn data_flags() -> PageTableFlags {
        PageTableFlags::ACCESSED | PageTableFlags::INNER_SHAREABLE | PageTableFlags::UXN
    }

    #[test]
    fn test_map_translates_every_page() {
        let mut pool = frames(16);
        let root = pool.alloc_zeroed_page().unwrap();

        let va = 0x4000_1234;
        map(root, va, 0x8000_0000, 3 * PAGE_SIZE, data_flags(), &mut *pool).unwrap();

        // Rounded out to four pages: 0x4000_1000..0x4000_5000.
        for page in 0..4 {
            let (pa, flags) = translate(root, 0x4000_1000 + page * PAGE_SIZE + 8).unwrap();
            assert_eq!(pa, 0x8000_0000 + page * PAGE_SIZE + 8);
            assert!(flags.contains(data_flags() | PageTableFlags::VALID | PageTableFlags::PAGE));
        }
        assert!(translate(root, 0x4000_5000).is_none());
        assert!(translate(root, 0x4000_0000).is_none());
    }

    #[test]
    fn test_map_reuses_tables() {
        let mut pool = frames(16);
        let root = pool.alloc_zeroed_page().unwrap();
        let before = pool.free_frames();

        map(root, 0x1000, 0x1000, PAGE_SIZE, data_flags(), &mut *pool).unwrap();
        assert_eq!(pool.free_frames(), before - 3);
        map(root, 0x2000, 0x2000, PAGE_SIZE, data_flags(), &mut *pool).unwrap();
        assert_eq!(pool.free_frames(), before - 3);
        // A new 2 MiB region needs one more L3 table.
        map(root, L2_BLOCK_SIZE, 0, PAGE_SIZE, data_flags(), &mut *pool).unwrap();
        assert_eq!(pool.free_frames(), before - 4);
    }

    #[test]
    fn test_failed_map_leaves_tree_untouched() {
        let mut pool = frames(4);
        let root = pool.alloc_zeroed_page().unwrap();
        let before = pool.free_frames();

        // Spanning four 2 MiB regions needs 1 + 1 + 4 tables; only 3 frames remain.
        let result = map(root, 0, 0, 4 * L2_BLOCK_SIZE, data_flags(), &mut *pool);
        assert_eq!(result, Err(MapError::OutOfMemory));
        assert_eq!(pool.free_frames(), before);
        let l0 = unsafe { table_at(root) };
        assert!((0..ENTRIES_PER_TABLE).all(|index| l0.get(index) == 0));
    }

    #[test]
    fn test_wrapping_range_is_refused() {
        let mut pool = frames(8);
        let root = pool.alloc_zeroed_page().unwrap();
        let before = pool.free_frames();

        let va = usize::MAX - PAGE_SIZE;
        assert_eq!(
            map(root, va, 0, 2 * PAGE_SIZE, data_flags(), &mut *pool),
            Err(MapError::AddressOverflow)
        );
        assert_eq!(
            map(root, 0, usize::MAX - PAGE_SIZE, 4 * PAGE_SIZE, data_flags(), &mut *pool),
            Err(MapError::AddressOverflow)
        );
        assert_eq!(pool.free_frames(), before);
        unmap(root, va, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_unmap_clears_leaves() {
        let mut pool = frames(8);
        let root = pool.alloc_zeroed_page().unwrap();
        map(root, 0x10_0000, 0x10_0000, 2 * PAGE_SIZE, data_flags(), &mut *pool).unwrap();

        unmap(root, 0x10_0000, PAGE_SIZE);
        assert!(translate(root, 0x10_0000).is_none());
        assert!(translate(root, 0x10_1000).is_some());
    }

    #[test]
    fn test_kernel_identity_map() {
        let mut pool = frames(800);
        let root = build_kernel_tables(&mut *pool).unwrap();

        let (pa, flags) = translate(root, 0x0900_0000).unwrap();
        assert_eq!(pa, 0x0900_0000);
        assert!(flags.contains(PageTableFlags::DEVICE | PageTableFlags::ACCESSED));

        let (pa, flags) = translate(root, GIB + 0x8_1234).unwrap();
        assert_eq!(pa, GIB + 0x8_1234);
        assert!(flags.contains(PageTableFlags::INNER_SHAREABLE | PageTableFlags::ACCESSED));
        assert!(!flags.contains(PageTableFlags::DEVICE));

        let last = GIB + GIB / 2 - PAGE_SIZE;
        assert_eq!(translate(root, last).map(|(pa, _)| pa), Some(last));
        assert!(translate(root, GIB + GIB / 2).is_none());
    }

    #[test]
    fn test_user_root_shares_kernel_slot_and_frees_its_tables() {
        let mut pool = frames(32);
        let kernel = pool.alloc_zeroed_page().unwrap();
        map(kernel, 0x20_0000, 0x20_0000, PAGE_SIZE, data_flags(), &mut *pool).unwrap();
        let before = pool.free_frames();

        let user = new_user_root(kernel, &mut *pool).unwrap();
        assert_eq!(translate(user, 0x20_0000).map(|(pa, _)| pa), Some(0x20_0000));

        let user_flags = data_flags() | PageTableFlags::USER;
        map(user, USER_SPACE_START, 0x30_0000, 2 * PAGE_SIZE, user_flags, &mut *pool).unwrap();
        assert!(translate(kernel, USER_SPACE_START).is_none());
        assert!(pool.free_frames() < before);

        free_user_root(user, kernel, &mut *pool);
        assert_eq!(pool.free_frames(), before);
        // The kernel's own tables survive.
        assert!(translate(kernel, 0x20_0000).is_some());
    }

    #[test]
    fn test_block_descriptor_is_rejected() {
        let mut pool = frames(4);
        let root = pool.alloc_zeroed_page().unwrap();
        unsafe { table_at(root) }.entries[0] = PageTableFlags::VALID.bits();

        assert_eq!(
            map(root, 0, 0, PAGE_SIZE, data_flags(), &mut *pool),
            Err(MapError::BlockInTheWay)
        );
    }
}
