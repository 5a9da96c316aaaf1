/// Thread groups (POSIX processes)
///
/// All threads created with CLONE_THREAD share one group; the group id is
/// the leader's tid. `live` counts non-exited members; when it reaches
/// zero the leader's zombie becomes reapable by the parent.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::process::signal::SigPending;
use crate::process::task::Tid;
use crate::sync::SpinLock;

pub struct TgInner {
    pub leader: Tid,
    pub members: Vec<Tid>,
    /// Process-directed pending signals, shared by all members
    pub shared_pending: SigPending,
}

pub struct ThreadGroup {
    pub tgid: Tid,
    live: AtomicU32,
    refs: AtomicU32,
    group_exit: AtomicBool,
    exit_code: AtomicI32,
    stop_count: AtomicU32,
    /// Program break of the (external) address space
    pub brk: AtomicU64,
    pub inner: SpinLock<TgInner>,
}

impl ThreadGroup {
    /// New group with `leader` as its only member: `tgid = leader`,
    /// `live = 1`, `ref = 1`.
    pub fn new(leader: Tid) -> Arc<ThreadGroup> {
        Arc::new(ThreadGroup {
            tgid: leader,
            live: AtomicU32::new(1),
            refs: AtomicU32::new(1),
            group_exit: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            stop_count: AtomicU32::new(0),
            brk: AtomicU64::new(0),
            inner: SpinLock::new("tg", TgInner {
                leader,
                members: alloc::vec![leader],
                shared_pending: SigPending::new(),
            }),
        })
    }

    /// CLONE_THREAD: a new member joins.
    pub fn add(&self, tid: Tid) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().members.push(tid);
    }

    /// A member exits; returns the remaining live count.
    pub fn remove(&self, tid: Tid) -> u32 {
        self.inner.lock().members.retain(|&m| m != tid);
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "thread group {}: live count underflow", self.tgid);
        prev - 1
    }

    pub fn live(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn get(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn put(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "thread group {}: ref count underflow", self.tgid);
        prev - 1
    }

    pub fn leader(&self) -> Tid {
        self.inner.lock().leader
    }

    pub fn members(&self) -> Vec<Tid> {
        self.inner.lock().members.clone()
    }

    /// First call wins; records the group exit code.
    pub fn set_group_exit(&self, code: i32) -> bool {
        if self
            .group_exit
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.exit_code.store(code, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn group_exit(&self) -> bool {
        self.group_exit.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn inc_stopped(&self) -> u32 {
        self.stop_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_stopped(&self) {
        self.stop_count.store(0, Ordering::SeqCst);
    }

    pub fn stopped_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_count_follows_membership() {
        let tg = ThreadGroup::new(10);
        assert_eq!(tg.live(), 1);
        assert_eq!(tg.leader(), 10);
        tg.add(11);
        tg.add(12);
        assert_eq!(tg.live(), 3);
        assert_eq!(tg.members(), alloc::vec![10, 11, 12]);
        assert_eq!(tg.remove(11), 2);
        assert_eq!(tg.remove(10), 1);
        assert_eq!(tg.remove(12), 0);
    }

    #[test]
    fn group_exit_records_first_code() {
        let tg = ThreadGroup::new(1);
        assert!(tg.set_group_exit(7));
        assert!(!tg.set_group_exit(9));
        assert_eq!(tg.exit_code(), 7);
        assert!(tg.group_exit());
    }

    #[test]
    fn tgid_matches_leader() {
        let tg = ThreadGroup::new(42);
        assert_eq!(tg.tgid, tg.leader());
    }
}
