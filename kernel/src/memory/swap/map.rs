//! Swap map: a chained-bucket hash table keyed by (logical page, physical
//! page), storing the set of PTE locations that currently hold the `S` flag
//! for each evicted identity.
//!
//! Grounded on `unordered_map.c`'s `UnorderedMap`/`SwapMapHash`/lazy bin
//! allocation for the bucket structure. The per-bucket chain is a `Vec`
//! here rather than the original's intrusive doubly-linked list — see
//! `LinkedList.c::LinkedListNodeRemoveNextMatching`, whose unconditional
//! `cur->prev->next`/`cur->next->prev` dereferences crash on head/tail
//! removal. `Vec::remove` has no prev/next pointers to mis-splice, so that
//! bug class cannot reappear; this is the chosen resolution, not a
//! work-around bolted onto the original structure.

use alloc::vec;
use alloc::vec::Vec;
use x86_64::structures::paging::page_table::PageTableEntry;

use crate::memory::{PAGE_SIZE, frame};
use crate::sync::SpinLock;

const BUCKET_COUNT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    log_page: u64,
    phys_page: u64,
}

impl Key {
    pub fn new(log_addr: u64, phys_addr: u64) -> Self {
        Key {
            log_page: log_addr / PAGE_SIZE,
            phys_page: phys_addr / PAGE_SIZE,
        }
    }
}

/// Identifies one PTE slot inside some process's page tables. Deliberately
/// opaque outside this module: callers obtain it from the raw pointer a
/// page-table walk handed back and never dereference the address
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteLocation(u64);

impl PteLocation {
    pub fn new(ptr: *mut PageTableEntry) -> Self {
        PteLocation(ptr as u64)
    }
}

struct Record {
    key: Key,
    slot: usize,
    ptes: Vec<PteLocation>,
}

struct SwapMap {
    buckets: Vec<Vec<Record>>,
    base_page: u64,
}

impl SwapMap {
    const fn new() -> Self {
        SwapMap {
            buckets: Vec::new(),
            base_page: 0,
        }
    }
}

static MAP: SpinLock<SwapMap> = SpinLock::new(SwapMap::new());

pub fn init() {
    let mut map = MAP.lock();
    map.buckets = (0..BUCKET_COUNT).map(|_| Vec::new()).collect();
    // SwapMapHash variant chosen: subtract a base physical-frame index so
    // the bucket spread stays dense for small memory configurations,
    // rather than hashing the raw (unbased) frame index.
    map.base_page = frame::base_addr().as_u64() / PAGE_SIZE;
}

fn bucket_index(map: &SwapMap, key: Key) -> usize {
    let rel_phys = key.phys_page.saturating_sub(map.base_page);
    (key.log_page.wrapping_add(rel_phys) % BUCKET_COUNT as u64) as usize
}

/// Registers `pte_loc` against `key`'s record, creating the record if none
/// exists. `slot` is the backing-store slot the caller already wrote the
/// page's payload into — it is consumed only when a fresh record is
/// created; when this call instead attaches to an existing record, the
/// passed-in `slot` is surplus to requirements and the caller must release
/// it. Taking the slot as a parameter rather than acquiring one internally
/// keeps "write the payload" and "record where it went" atomic from the
/// caller's point of view: there is never a window where a record points at
/// a slot nothing has written yet.
///
/// During fork, `parent_pte` names the sibling PTE this copy was derived
/// from; when supplied, the new location is attached to *that* PTE's
/// existing record instead of opening a second one for an identity that
/// already has one — the tie-breaking rule `SwapDataAddPTE` encodes in the
/// source this was distilled from.
pub fn put(key: Key, pte_loc: PteLocation, parent_pte: Option<PteLocation>, slot: usize) -> usize {
    let mut map = MAP.lock();
    let idx = bucket_index(&map, key);

    if let Some(parent) = parent_pte {
        if let Some(record) = map.buckets[idx]
            .iter_mut()
            .find(|r| r.key == key && r.ptes.contains(&parent))
        {
            record.ptes.push(pte_loc);
            return record.slot;
        }
    }

    if let Some(record) = map.buckets[idx].iter_mut().find(|r| r.key == key) {
        record.ptes.push(pte_loc);
        return record.slot;
    }

    map.buckets[idx].push(Record {
        key,
        slot,
        ptes: vec![pte_loc],
    });
    slot
}

/// Removes `pte_loc` from whichever record holds it. When that empties the
/// record, the record is destroyed. Returns the slot index the PTE was
/// backed by, or `None` if no record named this `(key, pte_loc)` pair —
/// callers treat that as "nothing to restore," never as fatal, since a
/// caller may legitimately probe a PTE that was never swapped.
pub fn take(key: Key, pte_loc: PteLocation) -> Option<usize> {
    let mut map = MAP.lock();
    let idx = bucket_index(&map, key);

    let bucket = &mut map.buckets[idx];
    let record_pos = bucket
        .iter()
        .position(|r| r.key == key && r.ptes.contains(&pte_loc))?;

    let slot = bucket[record_pos].slot;
    let pte_pos = bucket[record_pos].ptes.iter().position(|p| *p == pte_loc)?;
    bucket[record_pos].ptes.remove(pte_pos);

    if bucket[record_pos].ptes.is_empty() {
        bucket.remove(record_pos);
    }

    Some(slot)
}

#[cfg(test)]
pub fn record_count_for_test(key: Key) -> usize {
    let map = MAP.lock();
    let idx = bucket_index(&map, key);
    map.buckets[idx].iter().filter(|r| r.key == key).count()
}
