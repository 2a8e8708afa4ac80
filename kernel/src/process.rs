//! Minimal process table. The scheduler and the rest of a real process
//! control block are named out of scope; this exists only because fork
//! (`AddressSpace::copy_user`) and eviction both need *some* notion of
//! "every live address space" to walk.
//!
//! Grounded on the shape of the teacher's `process/{mod.rs,pcb.rs}`
//! (`ProcessId`, `Process`, `ProcessManager`), trimmed to the fields the
//! virtual-memory subsystem actually consumes.

use alloc::vec::Vec;

use crate::memory::addrspace::AddressSpace;
use crate::memory::swap::evict::LiveAddressSpaces;
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

pub struct Process {
    pub pid: ProcessId,
    pub space: AddressSpace,
}

struct ProcessTable {
    processes: Vec<Process>,
    current: Option<ProcessId>,
    next_pid: u64,
}

impl ProcessTable {
    const fn new() -> Self {
        ProcessTable {
            processes: Vec::new(),
            current: None,
            next_pid: 1,
        }
    }
}

static PROCESS_TABLE: SpinLock<ProcessTable> = SpinLock::new(ProcessTable::new());

/// Registers a new process and, if none is current yet, makes it current.
pub fn spawn(space: AddressSpace) -> ProcessId {
    let mut table = PROCESS_TABLE.lock();
    let pid = ProcessId(table.next_pid);
    table.next_pid += 1;
    table.processes.push(Process { pid, space });
    if table.current.is_none() {
        table.current = Some(pid);
    }
    pid
}

pub fn set_current(pid: ProcessId) {
    let mut table = PROCESS_TABLE.lock();
    table.current = if table.processes.iter().any(|p| p.pid == pid) {
        Some(pid)
    } else {
        None
    };
}

/// Runs `f` against the current process's address space under the
/// process-table lock, the same lock `LiveAddressSpaces::for_each` takes,
/// so a fault never races a concurrent eviction pass over this process.
///
/// `current` names a process by `ProcessId`, not by its `Vec` slot, so a
/// sibling process exiting (and shifting everyone after it down one slot)
/// can never leave `current` pointing at the wrong process.
pub fn with_current<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
    let mut table = PROCESS_TABLE.lock();
    let pid = table.current?;
    let idx = table.processes.iter().position(|p| p.pid == pid)?;
    Some(f(&mut table.processes[idx].space))
}

pub fn exit(pid: ProcessId) {
    let mut table = PROCESS_TABLE.lock();
    if let Some(idx) = table.processes.iter().position(|p| p.pid == pid) {
        let proc = table.processes.remove(idx);
        if table.current == Some(pid) {
            table.current = None;
        }
        proc.space.free_pd();
    }
}

pub struct ProcessTableSource;

impl LiveAddressSpaces for ProcessTableSource {
    fn for_each(&self, f: &mut dyn FnMut(&mut AddressSpace)) {
        let mut table = PROCESS_TABLE.lock();
        for process in table.processes.iter_mut() {
            f(&mut process.space);
        }
    }
}

pub static PROCESS_TABLE_SOURCE: ProcessTableSource = ProcessTableSource;
