//! Page-table manager: `walk`/`map`/growth/shrink/destroy, fork's
//! copy-on-write setup, and the swap-in / CoW-split helpers shared by the
//! fault dispatcher and `uva2ka`/`copyout`.
//!
//! Grounded on `walkpgdir`/`mappages`/`allocuvm`/`deallocuvm`/`freevm`/
//! `copyuvm`/`clearpteu`/`uva2ka`/`copyout` in the xv6-derived original this
//! was distilled from, restructured around the `x86_64` crate's four-level
//! `PageTable` rather than a hand-rolled two-level walker (see `pte.rs`).
//! Each `AddressSpace` owns its own PML4 frame and walks it directly
//! through the kernel's all-physical-memory offset mapping, the same trick
//! `vm.c` uses via `P2V`.

use x86_64::structures::paging::{PageTable, PageTableFlags as Flags, PageTableIndex, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::{PAGE_SIZE, VmError, frame, phys_to_virt, pte, swap};

pub struct AddressSpace {
    pml4_frame: PhysFrame<Size4KiB>,
    pub sz: u64,
}

/// Outcome of probing one page's worth of this address space for eviction.
/// Distinguishes "nothing is allocated here" from "allocated but not
/// presently evictable" — the scan must not treat the former as proof the
/// logical page is unmapped in every address space, only in this one.
pub enum WalkOutcome {
    NoPageTable,
    NotPresent,
    Present {
        entry_ptr: *mut x86_64::structures::paging::page_table::PageTableEntry,
    },
}

fn table_ptr(frame: PhysFrame<Size4KiB>) -> *mut PageTable {
    phys_to_virt(frame.start_address()).as_mut_ptr()
}

fn zero_frame(frame: PhysFrame<Size4KiB>) {
    let ptr = phys_to_virt(frame.start_address()).as_mut_ptr::<u8>();
    unsafe {
        core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
    }
}

fn align_up(sz: u64) -> u64 {
    (sz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

/// Copies the currently active PML4's upper-half (kernel) entries into a
/// freshly allocated user directory, so every address space shares the same
/// kernel page-table pages without needing to rebuild them per process.
fn setup_kernel_pd(table: &mut PageTable) {
    use x86_64::registers::control::Cr3;
    let (current_frame, _) = Cr3::read();
    let current = unsafe { &*table_ptr(current_frame) };
    for i in 256..512u16 {
        let idx = PageTableIndex::new(i);
        table[idx] = current[idx].clone();
    }
}

impl AddressSpace {
    /// Allocates a fresh PML4, seeded with the shared kernel mappings.
    /// Corresponds to `setup_kernel_pd` plus the frame that backs it.
    pub fn new() -> Result<AddressSpace, VmError> {
        let frame = frame::alloc().ok_or(VmError::OutOfFrames)?;
        zero_frame(frame);
        let table = unsafe { &mut *table_ptr(frame) };
        setup_kernel_pd(table);
        Ok(AddressSpace { pml4_frame: frame, sz: 0 })
    }

    pub fn pml4_frame(&self) -> PhysFrame<Size4KiB> {
        self.pml4_frame
    }

    /// Locates the PTE for `va`. With `allocate`, missing intermediate
    /// page-table pages are installed permissively (`P|W|U`); without it, a
    /// missing page-table page is reported as `InvalidAccess` rather than a
    /// stale pointer.
    fn walk(&self, va: VirtAddr, allocate: bool) -> Result<*mut x86_64::structures::paging::page_table::PageTableEntry, VmError> {
        let mut frame = self.pml4_frame;
        for index in [va.p4_index(), va.p3_index(), va.p2_index()] {
            let table = unsafe { &mut *table_ptr(frame) };
            let entry = &mut table[index];
            if entry.is_unused() {
                if !allocate {
                    return Err(VmError::InvalidAccess);
                }
                let new_frame = frame::alloc().ok_or(VmError::OutOfFrames)?;
                zero_frame(new_frame);
                entry.set_frame(
                    new_frame,
                    Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESSIBLE,
                );
            }
            frame = entry.frame().map_err(|_| VmError::InvalidAccess)?;
        }
        let table = unsafe { &mut *table_ptr(frame) };
        Ok(&mut table[va.p1_index()] as *mut _)
    }

    /// Installs `va -> pa` with `flags`. Fatal if an existing entry is
    /// present and neither CoW-pending nor swapped — a true remap over a
    /// live mapping is a programming bug, never a recoverable condition.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, flags: Flags) -> Result<(), VmError> {
        let entry_ptr = self.walk(va, true)?;
        let entry = unsafe { &mut *entry_ptr };
        if pte::is_live_mapping(entry.flags()) {
            panic!("remap over live mapping at {:?}", va);
        }
        entry.set_addr(pa, flags);
        Ok(())
    }

    /// Grows `sz` to `new_sz`, backing each new page with a freshly
    /// allocated, zeroed frame. Rolls back the partially mapped range on
    /// failure.
    pub fn alloc_user(&mut self, new_sz: u64) -> Result<u64, VmError> {
        let old_sz = self.sz;
        let mut va = align_up(old_sz);
        while va < new_sz {
            let frame = match frame::alloc() {
                Some(f) => f,
                None => {
                    self.sz = va;
                    self.dealloc_user(va, old_sz);
                    return Err(VmError::OutOfFrames);
                }
            };
            zero_frame(frame);
            if let Err(e) = self.map(VirtAddr::new(va), frame.start_address(), pte::USER_RW) {
                frame::free(frame);
                self.sz = va;
                self.dealloc_user(va, old_sz);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
        self.sz = new_sz;
        Ok(new_sz)
    }

    /// Shrinks from `old_sz` down to `new_sz`. Present pages are freed;
    /// swapped pages release their swap-map record (and slot, once the
    /// record's last PTE reference is gone). A missing page-table page for
    /// part of the range means nothing was ever allocated there, not that
    /// the range is "already deallocated" in the swap sense.
    pub fn dealloc_user(&mut self, old_sz: u64, new_sz: u64) -> u64 {
        let mut va = align_up(new_sz);
        while va < old_sz {
            if let Ok(entry_ptr) = self.walk(VirtAddr::new(va), false) {
                let entry = unsafe { &mut *entry_ptr };
                let flags = entry.flags();
                if pte::is_present(flags) {
                    let pa = entry.addr();
                    frame::free(PhysFrame::containing_address(pa));
                    entry.set_unused();
                } else if pte::is_swapped(flags) {
                    let former_pa = entry.addr();
                    let key = swap::map::Key::new(va, former_pa.as_u64());
                    let loc = swap::map::PteLocation::new(entry_ptr);
                    if let Some(slot) = swap::map::take(key, loc) {
                        swap::bitmap::release_slot(slot);
                    }
                    entry.set_unused();
                }
            }
            va += PAGE_SIZE;
        }
        self.sz = new_sz;
        new_sz
    }

    /// Precondition: `sz == 0` (caller already shrank to nothing) or the
    /// caller accepts this call doing that shrink itself. Frees every
    /// user-half page-table page and the PML4 frame itself; the shared
    /// kernel-half page-table pages are never touched.
    pub fn free_pd(mut self) {
        if self.sz != 0 {
            self.dealloc_user(self.sz, 0);
        }
        self.free_page_table_pages();
        frame::free(self.pml4_frame);
    }

    fn free_page_table_pages(&self) {
        let pml4 = unsafe { &*table_ptr(self.pml4_frame) };
        for p4_idx in 0..256u16 {
            let p4_entry = &pml4[PageTableIndex::new(p4_idx)];
            if p4_entry.is_unused() {
                continue;
            }
            let p3_frame = match p4_entry.frame() {
                Ok(f) => f,
                Err(_) => continue,
            };
            let p3 = unsafe { &*table_ptr(p3_frame) };
            for p3_idx in 0..512u16 {
                let p3_entry = &p3[PageTableIndex::new(p3_idx)];
                if p3_entry.is_unused() {
                    continue;
                }
                let p2_frame = match p3_entry.frame() {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                let p2 = unsafe { &*table_ptr(p2_frame) };
                for p2_idx in 0..512u16 {
                    let p2_entry = &p2[PageTableIndex::new(p2_idx)];
                    if let Ok(p1_frame) = p2_entry.frame() {
                        frame::free(p1_frame);
                    }
                }
                frame::free(p2_frame);
            }
            frame::free(p3_frame);
        }
    }

    /// Drops the `USER_ACCESSIBLE` bit on one entry, used to carve out a
    /// guard page.
    pub fn clear_user_bit(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let entry_ptr = self.walk(va, false)?;
        let entry = unsafe { &mut *entry_ptr };
        entry.set_flags(entry.flags() & !Flags::USER_ACCESSIBLE);
        Ok(())
    }

    /// Fork: produces a CoW sibling. Swapped-out pages are restored first
    /// so the child can share the live frame; pages that still fail to
    /// resolve after that are skipped, matching `copyuvm`'s behavior rather
    /// than treating it as fatal.
    pub fn copy_user(&mut self) -> Result<AddressSpace, VmError> {
        let mut dst = AddressSpace::new()?;
        dst.sz = self.sz;

        let mut va = 0u64;
        while va < self.sz {
            let vaddr = VirtAddr::new(va);
            let entry_ptr = match self.walk(vaddr, false) {
                Ok(p) => p,
                Err(_) => {
                    va += PAGE_SIZE;
                    continue;
                }
            };
            let entry = unsafe { &mut *entry_ptr };
            let mut flags = entry.flags();

            if pte::is_swapped(flags) {
                if self.swap_in(vaddr).is_err() {
                    va += PAGE_SIZE;
                    continue;
                }
                flags = entry.flags();
            }

            if !pte::is_present(flags) {
                va += PAGE_SIZE;
                continue;
            }

            if !pte::is_cow(flags) {
                let new_flags = (flags & !Flags::WRITABLE) | pte::COW;
                entry.set_flags(new_flags);
                flush_tlb();
                flags = new_flags;
            }

            let pa = entry.addr();
            if let Err(e) = dst.map(vaddr, pa, flags) {
                dst.free_pd();
                return Err(e);
            }
            frame::inc_ref(pa);

            va += PAGE_SIZE;
        }

        Ok(dst)
    }

    /// Resolves a write fault against a CoW entry: the sole remaining
    /// sharer just regains `WRITABLE` in place, everyone else gets a fresh
    /// private copy.
    pub fn cow_split(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let entry_ptr = self.walk(va, false)?;
        let entry = unsafe { &mut *entry_ptr };
        let flags = entry.flags();
        if !pte::is_cow(flags) {
            return Err(VmError::InvalidAccess);
        }
        let old_pa = entry.addr();

        if frame::get_ref(old_pa) == 1 {
            entry.set_flags((flags & !pte::COW) | Flags::WRITABLE);
        } else {
            let new_frame = frame::alloc().ok_or(VmError::OutOfFrames)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(old_pa).as_ptr::<u8>(),
                    phys_to_virt(new_frame.start_address()).as_mut_ptr::<u8>(),
                    PAGE_SIZE as usize,
                );
            }
            entry.set_addr(new_frame.start_address(), (flags & !pte::COW) | Flags::WRITABLE);
            frame::free(PhysFrame::containing_address(old_pa));
        }
        flush_tlb();
        Ok(())
    }

    /// Restores a swapped-out page: pulls the slot out of the swap map,
    /// reads its payload into a fresh frame, and re-installs the PTE with
    /// whatever flags it had before eviction, minus `S` plus `P`.
    pub fn swap_in(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let entry_ptr = self.walk(va, false)?;
        let entry = unsafe { &mut *entry_ptr };
        let flags = entry.flags();
        if !pte::is_swapped(flags) {
            return Ok(());
        }
        let former_pa = entry.addr();
        let key = swap::map::Key::new(va.as_u64(), former_pa.as_u64());
        let loc = swap::map::PteLocation::new(entry_ptr);
        let slot = swap::map::take(key, loc).expect("swap-map record missing on restore");

        let frame = frame::alloc().ok_or(VmError::OutOfFrames)?;
        let buf = unsafe {
            core::slice::from_raw_parts_mut(
                phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            )
        };
        swap::bitmap::read_slot(slot, buf);
        swap::bitmap::release_slot(slot);

        entry.set_addr(frame.start_address(), (flags & !pte::SWAPPED) | Flags::PRESENT);
        flush_tlb();
        Ok(())
    }

    /// Resolves a user virtual address to a kernel-addressable pointer,
    /// transparently swapping in and/or splitting a CoW mapping as needed.
    pub fn uva2ka(&mut self, uva: VirtAddr) -> Result<VirtAddr, VmError> {
        let page = VirtAddr::new(uva.as_u64() & !(PAGE_SIZE - 1));

        if pte::is_swapped(unsafe { &*self.walk(page, false)? }.flags()) {
            self.swap_in(page)?;
        }
        if pte::is_cow(unsafe { &*self.walk(page, false)? }.flags()) {
            self.cow_split(page)?;
        }

        let entry = unsafe { &*self.walk(page, false)? };
        let flags = entry.flags();
        if !pte::is_present(flags) || !pte::is_user(flags) {
            return Err(VmError::InvalidAccess);
        }
        let pa = entry.addr();
        Ok(phys_to_virt(pa) + (uva.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Returns the current flags at `va`, or `None` if no page-table page
    /// covers it yet. Used by the fault dispatcher to classify a fault
    /// without itself installing anything.
    pub fn probe(&self, va: VirtAddr) -> Option<Flags> {
        self.walk(va, false).ok().map(|ptr| unsafe { (*ptr).flags() })
    }

    /// Probes `va` for the eviction scan without allocating anything.
    pub fn walk_for_evict(&self, va: VirtAddr) -> WalkOutcome {
        match self.walk(va, false) {
            Err(_) => WalkOutcome::NoPageTable,
            Ok(entry_ptr) => {
                let entry = unsafe { &*entry_ptr };
                if pte::is_present(entry.flags()) {
                    WalkOutcome::Present { entry_ptr }
                } else {
                    WalkOutcome::NotPresent
                }
            }
        }
    }

    /// Bulk write into this (possibly foreign, e.g. a child process during
    /// argument setup) address space, one page at a time via `uva2ka`.
    pub fn copyout(&mut self, dst_va: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        let mut written = 0usize;
        while written < src.len() {
            let va = VirtAddr::new(dst_va.as_u64() + written as u64);
            let offset_in_page = (va.as_u64() & (PAGE_SIZE - 1)) as usize;
            let ka = self.uva2ka(va)?;
            let chunk = core::cmp::min(PAGE_SIZE as usize - offset_in_page, src.len() - written);
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(written), ka.as_mut_ptr::<u8>(), chunk);
            }
            written += chunk;
        }
        Ok(())
    }
}
