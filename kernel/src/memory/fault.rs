//! Page-fault dispatcher. Grounded on `handle_pagefault` in the source this
//! was distilled from: the ordering below (bounds check, walk-miss, swap,
//! CoW, fallback) is preserved exactly, restructured as a small match chain
//! in the style of the teacher's `demand_paging.rs::handle_page_fault`.

use x86_64::VirtAddr;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::memory::addrspace::AddressSpace;
use crate::memory::{KERNEL_BASE, PAGE_SIZE, VmError, frame, phys_to_virt, pte};
use crate::process;

pub fn handle_page_fault(addr: VirtAddr, error_code: PageFaultErrorCode) -> Result<(), VmError> {
    let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);

    match process::with_current(|space| dispatch(space, addr, is_write)) {
        Some(result) => result,
        None => Err(VmError::InvalidAccess),
    }
}

fn dispatch(space: &mut AddressSpace, addr: VirtAddr, is_write: bool) -> Result<(), VmError> {
    if addr.as_u64() == 0 || addr.as_u64() >= KERNEL_BASE || addr.as_u64() > space.sz {
        return Err(VmError::InvalidAccess);
    }

    let page = VirtAddr::new(addr.as_u64() & !(PAGE_SIZE - 1));

    let flags = match space.probe(page) {
        Some(flags) => flags,
        None => return lazy_alloc(space, page),
    };

    if pte::is_swapped(flags) {
        return space.swap_in(page);
    }

    if pte::is_cow(flags) && is_write {
        return space.cow_split(page);
    }

    if !pte::is_present(flags) {
        return lazy_alloc(space, page);
    }

    Ok(())
}

fn lazy_alloc(space: &mut AddressSpace, page: VirtAddr) -> Result<(), VmError> {
    let frame = frame::alloc().ok_or(VmError::OutOfFrames)?;
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    space.map(page, frame.start_address(), pte::USER_RW)
}
