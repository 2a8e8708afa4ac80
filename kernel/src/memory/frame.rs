//! Physical frame allocator with per-frame reference counts.
//!
//! Two lock domains, acquired free-list-then-ref-count and never nested
//! across a suspension point, mirroring `kalloc.c`'s separation of the
//! free-list pointer from `phys_page_data[].ref_count`.

use alloc::vec;
use alloc::vec::Vec;
use x86_64::PhysAddr;
use x86_64::structures::paging::{
    FrameAllocator as X86FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB,
};

use crate::memory::{PAGE_SIZE, phys_to_virt};
use crate::sync::SpinLock;

struct RefCountTable {
    base: u64,
    counts: Vec<u32>,
}

impl RefCountTable {
    const fn new() -> Self {
        RefCountTable {
            base: 0,
            counts: Vec::new(),
        }
    }

    fn index_of(&self, pa: PhysAddr) -> usize {
        ((pa.as_u64() - self.base) / PAGE_SIZE) as usize
    }
}

struct FrameTable {
    free_list: SpinLock<Vec<PhysFrame<Size4KiB>>>,
    ref_counts: SpinLock<RefCountTable>,
}

static FRAME_TABLE: FrameTable = FrameTable {
    free_list: SpinLock::new(Vec::new()),
    ref_counts: SpinLock::new(RefCountTable::new()),
};

/// Populates the free list and sizes the ref-count table from the usable
/// regions reported by the bootloader's memory map.
pub fn init(regions: impl Iterator<Item = (PhysAddr, PhysAddr)>) {
    let regions: Vec<(PhysAddr, PhysAddr)> = regions.collect();

    let min_start = regions.iter().map(|(s, _)| s.as_u64()).min().unwrap_or(0);
    let max_end = regions.iter().map(|(_, e)| e.as_u64()).max().unwrap_or(0);

    {
        let mut ref_counts = FRAME_TABLE.ref_counts.lock();
        ref_counts.base = min_start;
        let frame_count = ((max_end.saturating_sub(min_start)) / PAGE_SIZE) as usize;
        ref_counts.counts = vec![0u32; frame_count];
    }

    for (start, end) in regions {
        freerange(start, end);
    }
}

/// Pushes every page-aligned frame in `[start, end)` onto the free list.
/// Ref-counts for these frames are left at zero, matching a freshly freed
/// (not yet allocated) frame.
pub fn freerange(start: PhysAddr, end: PhysAddr) {
    let mut free_list = FRAME_TABLE.free_list.lock();
    let mut addr = start.align_up(PAGE_SIZE);
    while addr.as_u64() + PAGE_SIZE <= end.as_u64() {
        free_list.push(PhysFrame::containing_address(addr));
        addr += PAGE_SIZE;
    }
}

/// Detaches a frame from the free list and sets its ref-count to one.
pub fn alloc() -> Option<PhysFrame<Size4KiB>> {
    let frame = FRAME_TABLE.free_list.lock().pop()?;

    let mut counts = FRAME_TABLE.ref_counts.lock();
    let idx = counts.index_of(frame.start_address());
    debug_assert_eq!(counts.counts[idx], 0, "allocated an already-referenced frame");
    counts.counts[idx] = 1;
    Some(frame)
}

/// Drops one reference to `frame`. When the count reaches zero the frame is
/// poisoned and returned to the free list.
pub fn free(frame: PhysFrame<Size4KiB>) {
    let should_release = {
        let mut counts = FRAME_TABLE.ref_counts.lock();
        let idx = counts.index_of(frame.start_address());
        assert!(counts.counts[idx] > 0, "double free of frame {:?}", frame.start_address());
        counts.counts[idx] -= 1;
        counts.counts[idx] == 0
    };

    if should_release {
        poison(frame);
        FRAME_TABLE.free_list.lock().push(frame);
    }
}

pub fn inc_ref(pa: PhysAddr) -> u32 {
    let mut counts = FRAME_TABLE.ref_counts.lock();
    let idx = counts.index_of(pa);
    counts.counts[idx] += 1;
    counts.counts[idx]
}

/// Drops one reference without touching the free list. Used by eviction,
/// which must drive the count to zero itself (one decrement per discovered
/// PTE) before handing the frame back via `free_raw`.
pub fn dec_ref(pa: PhysAddr) -> u32 {
    let mut counts = FRAME_TABLE.ref_counts.lock();
    let idx = counts.index_of(pa);
    assert!(counts.counts[idx] > 0, "ref-count underflow at {:?}", pa);
    counts.counts[idx] -= 1;
    counts.counts[idx]
}

pub fn get_ref(pa: PhysAddr) -> u32 {
    let counts = FRAME_TABLE.ref_counts.lock();
    counts.counts[counts.index_of(pa)]
}

/// Lowest physical address the allocator manages. Used by the swap map to
/// keep its hash dense for small memory configurations.
pub fn base_addr() -> PhysAddr {
    PhysAddr::new(FRAME_TABLE.ref_counts.lock().base)
}

pub fn free_count() -> usize {
    FRAME_TABLE.free_list.lock().len()
}

/// Returns a frame whose ref-count has already been driven to zero by the
/// caller straight to the free list, poisoning it first. Distinct from
/// `free` because eviction already knows the count is zero and must not
/// pay for (or risk skipping) another decrement.
pub fn free_raw(frame: PhysFrame<Size4KiB>) {
    debug_assert_eq!(get_ref(frame.start_address()), 0);
    poison(frame);
    FRAME_TABLE.free_list.lock().push(frame);
}

fn poison(frame: PhysFrame<Size4KiB>) {
    let ptr = phys_to_virt(frame.start_address()).as_mut_ptr::<u8>();
    unsafe {
        core::ptr::write_bytes(ptr, 1, PAGE_SIZE as usize);
    }
}

/// Zero-sized adapter so the frame table can serve as an `x86_64` crate
/// `FrameAllocator`/`FrameDeallocator` wherever `Mapper` needs one.
pub struct GlobalFrameAllocator;

unsafe impl X86FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        alloc()
    }
}

impl FrameDeallocator<Size4KiB> for GlobalFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        free(frame);
    }
}
