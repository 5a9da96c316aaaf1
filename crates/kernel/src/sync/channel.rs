//! Channel wait queues: sleep on / wake on an opaque key.
//!
//! Channels are created on demand and removed when their last sleeper
//! leaves. Wake order within one channel is FIFO. Keys may alias (see the
//! tagging scheme below), so wakeups are allowed to be spurious and every
//! sleeper must recheck its condition.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use super::spinlock::{SpinLock, SpinLockGuard};
use crate::process::task::{Thread, ThreadState, Tid};

/// Key space: addresses of kernel objects have their low two bits clear, so
/// tid- and cpu-derived keys are tagged into the low bits to keep them out
/// of each other's way.
pub fn chan_addr<T: ?Sized>(p: *const T) -> usize {
    p as *const () as usize
}

/// Parent's wait channel for child-exit notification.
pub const fn chan_child_exit(tid: Tid) -> usize {
    ((tid as usize) << 2) | 1
}

/// vfork completion channel of a child.
pub const fn chan_vfork(tid: Tid) -> usize {
    ((tid as usize) << 2) | 2
}

/// Per-CPU kernel-thread channels (RCU, timer work).
pub const fn chan_percpu(kind: usize, cpu: usize) -> usize {
    (((cpu << 4) | kind) << 2) | 3
}

static CHANNELS: SpinLock<BTreeMap<usize, VecDeque<Arc<Thread>>>> =
    SpinLock::new("channels", BTreeMap::new());

/// Atomically release `guard`, park the current thread on `chan` in `state`,
/// and re-acquire the lock after waking.
///
/// The caller must hold the lock that guards its sleep condition; the
/// enqueue happens before the lock is released, so a waker that holds the
/// same lock cannot slip a wakeup into the gap.
pub fn sleep_on<'a, T: ?Sized>(
    chan: usize,
    guard: SpinLockGuard<'a, T>,
    state: ThreadState,
) -> SpinLockGuard<'a, T> {
    let lk = guard.spinlock();
    let t = crate::smp::current_thread().expect("sleep_on: no current thread");

    {
        let mut table = CHANNELS.lock();
        table
            .entry(chan)
            .or_insert_with(VecDeque::new)
            .push_back(t.clone());
        t.set_chan(chan);
        t.set_state(state);
    }

    drop(guard);
    crate::sched::block_current();

    // Woken; possibly by a signal or another channel's alias, so take
    // ourselves off the queue if the wakeup did not.
    t.clear_chan();
    remove_sleeper(chan, &t);

    lk.lock()
}

/// Variant of [`sleep_on`] for callers that hold no condition lock (the
/// per-CPU worker threads). Racy unless the wake condition is re-checked.
pub fn sleep_on_bare(chan: usize, state: ThreadState) {
    let t = crate::smp::current_thread().expect("sleep_on_bare: no current thread");
    {
        let mut table = CHANNELS.lock();
        table
            .entry(chan)
            .or_insert_with(VecDeque::new)
            .push_back(t.clone());
        t.set_chan(chan);
        t.set_state(state);
    }
    crate::sched::block_current();
    t.clear_chan();
    remove_sleeper(chan, &t);
}

/// Move every sleeper on `chan` to the scheduler.
pub fn wakeup(chan: usize) {
    let sleepers = {
        let mut table = CHANNELS.lock();
        table.remove(&chan)
    };
    if let Some(sleepers) = sleepers {
        for t in sleepers {
            crate::sched::wakeup_thread(&t);
        }
    }
}

/// Wake the oldest sleeper on `chan`, if any.
pub fn wakeup_one(chan: usize) {
    let sleeper = {
        let mut table = CHANNELS.lock();
        match table.get_mut(&chan) {
            Some(q) => {
                let s = q.pop_front();
                if q.is_empty() {
                    table.remove(&chan);
                }
                s
            }
            None => None,
        }
    };
    if let Some(t) = sleeper {
        crate::sched::wakeup_thread(&t);
    }
}

fn remove_sleeper(chan: usize, t: &Arc<Thread>) {
    let mut table = CHANNELS.lock();
    if let Some(q) = table.get_mut(&chan) {
        q.retain(|s| !Arc::ptr_eq(s, t));
        if q.is_empty() {
            table.remove(&chan);
        }
    }
}

/// Number of sleepers currently parked on `chan`.
pub fn sleeper_count(chan: usize) -> usize {
    CHANNELS.lock().get(&chan).map_or(0, |q| q.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_spaces_do_not_collide() {
        assert_ne!(chan_child_exit(7), chan_vfork(7));
        assert_ne!(chan_child_exit(7), chan_percpu(0, 7));
        let x = 7u64;
        assert_eq!(chan_addr(&x as *const u64) & 0b11, 0);
    }

    #[test]
    fn wakeup_on_empty_channel_is_noop() {
        wakeup(chan_child_exit(0xdead));
        wakeup_one(chan_vfork(0xdead));
        assert_eq!(sleeper_count(chan_child_exit(0xdead)), 0);
    }
}
