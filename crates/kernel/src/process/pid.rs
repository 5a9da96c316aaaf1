/// PID allocation and the global thread table
///
/// The table maps tids to live threads and carries the parent/child
/// hierarchy traversals. It sits behind the system's outermost lock, a
/// reader-writer `pid_lock`: read for traversal, write for insert, remove
/// and PID allocation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use super::task::{Thread, Tid};
use crate::klib::error::KernelError;
use crate::sync::RwLock;

/// The init thread's tid
pub const INIT_TID: Tid = 1;

/// PID space bound
const MAX_PIDS: u32 = 32768;

pub struct PidTable {
    map: BTreeMap<Tid, Arc<Thread>>,
    next_tid: Tid,
}

impl PidTable {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            next_tid: INIT_TID,
        }
    }

    /// Allocate the next tid; fails once the PID space is spent.
    pub fn alloc_tid(&mut self) -> Result<Tid, KernelError> {
        if self.next_tid >= MAX_PIDS {
            return Err(KernelError::OutOfPids);
        }
        let tid = self.next_tid;
        self.next_tid += 1;
        Ok(tid)
    }

    pub fn insert(&mut self, t: Arc<Thread>) {
        self.map.insert(t.tid, t);
    }

    pub fn get(&self, tid: Tid) -> Option<&Arc<Thread>> {
        self.map.get(&tid)
    }

    pub fn remove(&mut self, tid: Tid) -> Option<Arc<Thread>> {
        self.map.remove(&tid)
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.map.values()
    }
}

static PID_TABLE: RwLock<PidTable> = RwLock::new(PidTable::new());

/// The global `pid_lock`-protected table.
pub fn table() -> &'static RwLock<PidTable> {
    &PID_TABLE
}

/// Look a thread up by tid under the read lock.
pub fn lookup(tid: Tid) -> Option<Arc<Thread>> {
    PID_TABLE.read().get(tid).cloned()
}

/// Minimal thread construction for unit tests across the crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::process::group::ThreadGroup;
    use crate::process::signal::SigActions;
    use crate::process::task::{FdTable, FsState, KernelStack};
    use crate::sched::entity::DEFAULT_PRIORITY;
    use crate::sync::SpinLock;

    pub(crate) fn bare_thread(tid: Tid) -> Arc<Thread> {
        Arc::new(Thread::new(
            tid,
            "test",
            ThreadGroup::new(tid),
            Arc::new(SpinLock::new("sigacts", SigActions::new())),
            Arc::new(SpinLock::new("fs", FsState::new())),
            Arc::new(SpinLock::new("fdtable", FdTable::new())),
            KernelStack::adopted(),
            DEFAULT_PRIORITY,
            0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::bare_thread;
    use super::*;

    #[test]
    fn tid_allocation_is_monotonic() {
        let mut t = PidTable::new();
        let a = t.alloc_tid().unwrap();
        let b = t.alloc_tid().unwrap();
        assert!(b > a);
    }

    #[test]
    fn exhaustion_reports_out_of_pids() {
        let mut t = PidTable::new();
        t.next_tid = MAX_PIDS;
        assert_eq!(t.alloc_tid(), Err(KernelError::OutOfPids));
    }

    #[test]
    fn insert_lookup_remove() {
        let mut t = PidTable::new();
        let th = bare_thread(500);
        t.insert(th.clone());
        assert_eq!(t.count(), 1);
        assert!(t.get(500).is_some());
        let removed = t.remove(500).unwrap();
        assert_eq!(removed.tid, 500);
        assert!(t.get(500).is_none());
    }
}
