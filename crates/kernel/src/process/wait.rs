/// Exit paths and zombie reaping.
///
/// The global WAIT_LOCK spinlock orders a child's zombie transition against
/// the parent's scan-and-sleep, closing the lost-wakeup window; the PID
/// table's write lock covers the hierarchy edits themselves. Freed kernel
/// stacks go through call_rcu because hierarchy walkers may still hold
/// references from before the removal.

use alloc::vec::Vec;

use crate::klib::error::{Errno, Result};
use crate::process::pid::{self, INIT_TID};
use crate::process::signal::{self, KSigInfo, Signal};
use crate::process::task::{ThreadFlags, ThreadState, Tid};
use crate::sync::channel::{self, chan_child_exit, chan_vfork};
use crate::sync::rcu;
use crate::sync::SpinLock;

/// Serializes exit/wait handoff (rank: below pid_lock, above the channel
/// table).
pub(crate) static WAIT_LOCK: SpinLock<()> = SpinLock::new("wait", ());

pub const WNOHANG: i32 = 1;

/// Encode an exit status the way wait(2) reports it.
pub fn w_exitcode(exit_code: i32, signal: i32) -> i32 {
    (exit_code << 8) | (signal & 0x7f)
}

fn free_stack_cb(arg: usize) {
    crate::mm::page_put(arg as u64);
}

/// RCU callback reaping a self-reaping (non-leader) thread.
fn self_reap_cb(arg: usize) {
    let tid = arg as Tid;
    let gone = {
        let mut table = pid::table().write();
        table.remove(tid)
    };
    if let Some(t) = gone {
        if t.kstack.base != 0 {
            crate::mm::page_put(t.kstack.base);
        }
        t.set_state(ThreadState::Unused);
    }
}

pub(crate) fn queue_self_reap(tid: Tid) {
    rcu::call_rcu(self_reap_cb, tid as usize);
}

/// Terminate the calling thread.
pub fn do_exit(code: i32) -> ! {
    let t = crate::smp::current_thread().expect("exit without a thread");
    assert!(!t.is_idle(), "idle thread attempted to exit");

    t.set_state(ThreadState::Exiting);
    // Exiting work runs at the reserved top priority
    t.sched.set_priority(crate::sched::entity::make_priority(
        crate::sched::entity::EXIT_MAJOR,
        0,
    ));

    let (parent_tid, clear_tid) = {
        let mut inner = t.inner();
        inner.exit_code = code;
        (inner.parent, inner.clear_child_tid)
    };

    // CLONE_CHILD_CLEARTID: the external VM clears the word; the core
    // provides the futex-style wakeup on its address
    if clear_tid != 0 {
        channel::wakeup(clear_tid);
    }

    // Reparent our children to init and retire from the group
    let reaper_tid = {
        let mut table = pid::table().write();
        let kids: Vec<Tid> = core::mem::take(&mut t.inner().children);
        for k in kids {
            if let Some(c) = table.get(k) {
                c.inner().parent = INIT_TID;
            }
            if let Some(init) = table.get(INIT_TID) {
                init.inner().children.push(k);
            }
        }

        let live = t.group.remove(t.tid);
        let leader = t.group.leader();
        if leader != t.tid {
            t.set_flag(ThreadFlags::SELF_REAP);
        }

        // The group becomes reapable when the last member goes; the
        // leader's parent is the one waiting, whoever exits last
        if live == 0 {
            let (reaper, esignal) = if leader == t.tid {
                (parent_tid, t.exit_signal)
            } else {
                match table.get(leader) {
                    Some(l) => (l.inner().parent, l.exit_signal),
                    None => (parent_tid, t.exit_signal),
                }
            };
            if esignal != 0 {
                if let Some(p) = table.get(reaper) {
                    let sig = Signal::from_u32(esignal as u32).unwrap_or(Signal::SIGCHLD);
                    let _ = signal::signal_send(p, KSigInfo::new(sig, t.tid));
                }
            }
            Some(reaper)
        } else {
            None
        }
    };

    // Publish the zombie and wake the waiters under WAIT_LOCK so the
    // parent cannot scan-and-sleep past us
    {
        let wl = WAIT_LOCK.lock();
        t.set_state(ThreadState::Zombie);
        channel::wakeup(chan_vfork(t.tid));
        channel::wakeup(chan_child_exit(parent_tid));
        if let Some(r) = reaper_tid {
            if r != parent_tid {
                channel::wakeup(chan_child_exit(r));
            }
        }
        drop(wl);
    }

    crate::sched::exit_switch();
}

/// Group exit: take every sibling down and record the code.
pub fn do_exit_group(code: i32) -> ! {
    let t = crate::smp::current_thread().expect("exit_group without a thread");

    if t.group.set_group_exit(code) {
        let members = t.group.members();
        let table = pid::table().read();
        for tid in members {
            if tid == t.tid {
                continue;
            }
            if let Some(m) = table.get(tid) {
                let _ = signal::signal_send(m, KSigInfo::new(Signal::SIGKILL, t.tid));
            }
        }
    }

    do_exit(code)
}

/// Wait for a child to become reapable.
///
/// `pid_sel > 0` waits for that child, `-1` for any; returns the reaped
/// leader's tid and encoded status. With WNOHANG, `Ok((0, 0))` means
/// nothing was reapable.
pub fn do_wait(pid_sel: i32, options: i32) -> Result<(Tid, i32)> {
    let me = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    if pid_sel < -1 || pid_sel == 0 {
        // Process-group waits are outside this kernel's scope
        return Err(Errno::EINVAL);
    }

    loop {
        {
            let mut table = pid::table().write();
            let wl = WAIT_LOCK.lock();

            let kids: Vec<Tid> = me.inner().children.clone();
            let candidates: Vec<Tid> = match pid_sel {
                -1 => kids.clone(),
                sel => {
                    if !kids.contains(&(sel as Tid)) {
                        return Err(Errno::ECHILD);
                    }
                    alloc::vec![sel as Tid]
                }
            };
            if kids.is_empty() {
                return Err(Errno::ECHILD);
            }

            let mut reapable: Option<Tid> = None;
            let mut stale: Vec<Tid> = Vec::new();
            for k in candidates {
                match table.get(k) {
                    Some(c) => {
                        // Self-reaping threads clean up after themselves
                        if c.state() == ThreadState::Zombie
                            && !c.has_flag(ThreadFlags::SELF_REAP)
                            && c.group.leader() == c.tid
                            && c.group.live() == 0
                        {
                            reapable = Some(k);
                            break;
                        }
                    }
                    None => stale.push(k),
                }
            }
            if !stale.is_empty() {
                me.inner().children.retain(|x| !stale.contains(x));
            }

            if let Some(k) = reapable {
                drop(wl);
                let child = table.remove(k).expect("reapable child vanished");
                me.inner().children.retain(|&x| x != k);
                let status = if child.group.group_exit() {
                    w_exitcode(child.group.exit_code(), 0)
                } else {
                    w_exitcode(child.inner().exit_code, 0)
                };
                child.group.put();
                child.set_state(ThreadState::Unused);
                if child.kstack.base != 0 {
                    rcu::call_rcu(free_stack_cb, child.kstack.base as usize);
                }
                crate::debug!("wait: tid {} reaped child {}", me.tid, k);
                return Ok((k, status));
            }

            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }

            drop(table);
            let wl = channel::sleep_on(
                chan_child_exit(me.tid),
                wl,
                ThreadState::Interruptible,
            );
            drop(wl);
        }

        if me.killed() || me.has_flag(ThreadFlags::SIGPENDING) {
            return Err(Errno::EINTR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_encoding() {
        assert_eq!(w_exitcode(7, 0), 7 << 8);
        assert_eq!(w_exitcode(0, 9), 9);
        assert_eq!(w_exitcode(1, 15) & 0x7f, 15);
    }
}
