//! Second-chance eviction scan. Grounded on `vm.c::swap()`'s two-pass
//! accessed-bit sweep and its `pa_pte_iterator_t` (single-owner shortcut vs.
//! walking every live process for a shared frame's other mappings).

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::VirtAddr;
use x86_64::structures::paging::{PageTableFlags as Flags, PhysFrame};

use crate::memory::addrspace::{AddressSpace, WalkOutcome};
use crate::memory::{PAGE_SIZE, frame, phys_to_virt, pte};
use crate::sync::SpinLock;

use super::{bitmap, map};

/// Supplies "every live address space" to the scan. The real process table
/// is an external collaborator (out of scope); this is the seam it plugs
/// into. Implementations are expected to hold the process-table lock for
/// the duration of `for_each`, per the lock ordering that puts it above
/// the swap map.
pub trait LiveAddressSpaces: Sync {
    fn for_each(&self, f: &mut dyn FnMut(&mut AddressSpace));
}

static SOURCE: SpinLock<Option<&'static dyn LiveAddressSpaces>> = SpinLock::new(None);

pub fn set_source(source: &'static dyn LiveAddressSpaces) {
    *SOURCE.lock() = Some(source);
}

static TICKS: AtomicU64 = AtomicU64::new(0);

/// How often (in timer ticks) the eviction scan is even considered. A real
/// deployment would derive this from the timer frequency; this teaching
/// kernel just picks a tick count, matching the spirit (never the exact
/// mechanism, since it was never wired up) of `trap.c`'s commented-out
/// `if (ticks % SWAP_INTERVAL == 0) swap();`.
const SWAP_INTERVAL: u64 = 100;
const LOW_MEMORY_THRESHOLD: usize = 32;

pub fn on_timer_tick() {
    let t = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if t % SWAP_INTERVAL == 0 && frame::free_count() < LOW_MEMORY_THRESHOLD {
        run_once();
    }
}

/// One second-chance pass over every live address space: first sight of an
/// accessed page just clears `A`; a page already clear is evicted.
pub fn run_once() {
    let guard = SOURCE.lock();
    let source = match *guard {
        Some(s) => s,
        None => return,
    };
    source.for_each(&mut |space| scan_address_space(space));
}

fn scan_address_space(space: &mut AddressSpace) {
    let mut va = 0u64;
    while va < space.sz {
        match space.walk_for_evict(VirtAddr::new(va)) {
            WalkOutcome::NoPageTable | WalkOutcome::NotPresent => {}
            WalkOutcome::Present { entry_ptr } => {
                let entry = unsafe { &mut *entry_ptr };
                let flags = entry.flags();
                if pte::is_accessed(flags) {
                    entry.set_flags(flags & !Flags::ACCESSED);
                } else {
                    evict_one(space, VirtAddr::new(va), entry_ptr);
                }
            }
        }
        va += PAGE_SIZE;
    }
}

/// `slot` is consumed only if `map::put` has to open a fresh record (the
/// first PTE discovered for this identity); when it instead attaches to an
/// existing one, `slot` was surplus and is released back immediately so it
/// isn't leaked.
fn mark_evicted(
    va: VirtAddr,
    pa: x86_64::PhysAddr,
    entry_ptr: *mut x86_64::structures::paging::page_table::PageTableEntry,
    parent: Option<map::PteLocation>,
    slot: usize,
) -> map::PteLocation {
    let entry = unsafe { &mut *entry_ptr };
    let flags = entry.flags();
    let key = map::Key::new(va.as_u64(), pa.as_u64());
    let loc = map::PteLocation::new(entry_ptr);
    let used_slot = map::put(key, loc, parent, slot);
    if used_slot != slot {
        bitmap::release_slot(slot);
    }
    entry.set_addr(pa, (flags & !Flags::PRESENT) | pte::SWAPPED);
    frame::dec_ref(pa);
    loc
}

/// Evicts the frame mapped at `va` in `origin_space`. Writes it out once,
/// then marks every PTE that maps it — discovered by re-probing every live
/// address space at the same logical address, the multi-owner path of the
/// original's `pa_pte_iterator` — before the frame is driven to a ref-count
/// of zero and actually returned to the free list. Decrementing once per
/// discovered PTE (rather than delegating to a single `free()` that
/// assumes the count was already one) is what keeps this correct under
/// sharing: the frame is never poisoned while a PTE still points at it.
///
/// Exposed (rather than file-private) so tests can drive a single eviction
/// without standing up a full timer-driven scan.
pub fn evict_one(
    origin_space: &mut AddressSpace,
    va: VirtAddr,
    entry_ptr: *mut x86_64::structures::paging::page_table::PageTableEntry,
) {
    let entry = unsafe { &*entry_ptr };
    let pa = entry.addr();
    let mut remaining = frame::get_ref(pa);

    let slot = bitmap::acquire_slot();
    let page = unsafe { core::slice::from_raw_parts(phys_to_virt(pa).as_ptr::<u8>(), PAGE_SIZE as usize) };
    bitmap::write_slot(slot, page);

    let first_pte = mark_evicted(va, pa, entry_ptr, None, slot);
    remaining -= 1;

    if remaining > 0 {
        let guard = SOURCE.lock();
        if let Some(source) = *guard {
            source.for_each(&mut |space| {
                if remaining == 0 {
                    return;
                }
                if core::ptr::eq(space as *const AddressSpace, origin_space as *const AddressSpace) {
                    return;
                }
                if let WalkOutcome::Present { entry_ptr: other_ptr } = space.walk_for_evict(va) {
                    let other = unsafe { &*other_ptr };
                    if other.addr() == pa {
                        mark_evicted(va, pa, other_ptr, Some(first_pte), slot);
                        remaining -= 1;
                    }
                }
            });
        }
    }

    if frame::get_ref(pa) == 0 {
        frame::free_raw(PhysFrame::containing_address(pa));
    }
}
