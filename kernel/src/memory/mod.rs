pub mod addrspace;
pub mod fault;
pub mod frame;
pub mod pte;
pub mod swap;

use bootloader::bootinfo::{BootInfo, MemoryRegionType};
use x86_64::structures::paging::{OffsetPageTable, PageTable};
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: u64 = 4096;

/// Where all of physical memory is linearly mapped, chosen the same way the
/// teacher's `memory/mod.rs` picks `PHYS_MEM_OFFSET` / `KERNEL_BASE`.
pub const PHYS_MEM_OFFSET: u64 = 0xFFFF_8000_0000_0000;
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Errors surfaced by the fallible public operations of the frame allocator,
/// page-table manager, and swap engine. Invariant violations (double free,
/// remap over a live mapping, ref-count underflow, swap record missing on a
/// `take` the caller expected to succeed) are programming bugs and panic at
/// the call site instead of being represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfFrames,
    OutOfSwapSlots,
    PageTableExhausted,
    InvalidAccess,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            VmError::OutOfFrames => "out of physical frames",
            VmError::OutOfSwapSlots => "out of swap slots",
            VmError::PageTableExhausted => "could not allocate a page-table page",
            VmError::InvalidAccess => "access outside the address space's mapped range",
        };
        f.write_str(msg)
    }
}

#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_u64() + PHYS_MEM_OFFSET)
}

/// Bring up the frame allocator, the kernel heap mapping, and the swap
/// engine, in the order fixed by the design notes: frame allocator before
/// anything that might need to allocate a page-table page.
pub fn init(boot_info: &'static BootInfo) -> OffsetPageTable<'static> {
    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET);
    let level_4_table = unsafe { active_level_4_table(phys_mem_offset) };
    let mapper = unsafe { OffsetPageTable::new(level_4_table, phys_mem_offset) };

    let regions = boot_info
        .memory_map
        .iter()
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .map(|r| {
            (
                PhysAddr::new(r.range.start_addr()),
                PhysAddr::new(r.range.end_addr()),
            )
        });
    frame::init(regions);

    swap::bitmap::init();
    swap::map::init();

    mapper
}

unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    use x86_64::registers::control::Cr3;

    let (level_4_table_frame, _) = Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    unsafe { &mut *page_table_ptr }
}
