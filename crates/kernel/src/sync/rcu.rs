//! Read-copy-update with grace-period-based deferred reclamation.
//!
//! Readers bracket critical sections with `rcu_read_lock`/`rcu_read_unlock`
//! and never block writers. `call_rcu` defers a callback until every online
//! CPU has passed a quiescent state (a context switch, the idle loop, or an
//! explicit notice) since the enqueue; a per-CPU worker thread then runs it.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use super::channel;
use super::spinlock::SpinLock;
use crate::process::task::ThreadState;
use crate::smp::{self, MAX_CPUS};

/// Channel kind tag for the per-CPU RCU workers.
const CHAN_KIND_RCU: usize = 1;

pub struct RcuCallback {
    func: fn(usize),
    arg: usize,
    /// Grace period that must complete before this callback may run
    gp: u64,
}

/// Grace period currently being tracked (0 = none started yet).
static GP_CUR: AtomicU64 = AtomicU64::new(0);
/// Latest fully completed grace period.
static GP_DONE: AtomicU64 = AtomicU64::new(0);

/// Most recent grace period each CPU has acknowledged with a quiescent state.
static QS_SEEN: [AtomicU64; MAX_CPUS] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Per-CPU deferred callback lists.
static CALLBACKS: [SpinLock<VecDeque<RcuCallback>>; MAX_CPUS] = [
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
    SpinLock::new("rcu.cbs", VecDeque::new()),
];

/// Enter an RCU read-side critical section. Nests.
pub fn rcu_read_lock() {
    smp::with_current(|t| {
        if let Some(t) = t {
            t.rcu_nesting.fetch_add(1, Ordering::Relaxed);
        }
    });
}

/// Leave an RCU read-side critical section.
pub fn rcu_read_unlock() {
    smp::with_current(|t| {
        if let Some(t) = t {
            let prev = t.rcu_nesting.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "rcu_read_unlock without rcu_read_lock");
        }
    });
}

pub fn rcu_read_nesting() -> u32 {
    smp::with_current(|t| t.map_or(0, |t| t.rcu_nesting.load(Ordering::Relaxed)))
}

/// Defer `func(arg)` until after the next grace period.
pub fn call_rcu(func: fn(usize), arg: usize) {
    // Start a grace period if none is in flight
    let done = GP_DONE.load(Ordering::SeqCst);
    let _ = GP_CUR.compare_exchange(done, done + 1, Ordering::SeqCst, Ordering::SeqCst);
    let gp = GP_CUR.load(Ordering::SeqCst);

    let cpu = smp::cpu_id() % MAX_CPUS;
    CALLBACKS[cpu].lock().push_back(RcuCallback { func, arg, gp });
}

/// Note a quiescent state on the executing CPU. Called from the scheduler
/// on every context switch and from the idle loop.
pub fn rcu_note_quiescent() {
    if rcu_read_nesting() != 0 {
        return;
    }
    quiescent_on(smp::cpu_id() % MAX_CPUS);
}

fn quiescent_on(cpu: usize) {
    let cur = GP_CUR.load(Ordering::SeqCst);
    let done = GP_DONE.load(Ordering::SeqCst);
    if cur == done {
        return;
    }

    QS_SEEN[cpu].store(cur, Ordering::SeqCst);

    // Grace period completes once every online CPU has acknowledged it
    let online = smp::online_mask();
    for id in 0..MAX_CPUS {
        if online & (1 << id) != 0 && QS_SEEN[id].load(Ordering::SeqCst) < cur {
            return;
        }
    }
    if GP_DONE
        .compare_exchange(done, cur, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        for id in 0..MAX_CPUS {
            if online & (1 << id) != 0 {
                channel::wakeup(channel::chan_percpu(CHAN_KIND_RCU, id));
            }
        }
    }
}

/// Run the callbacks on `cpu` whose grace period has completed.
/// Returns how many ran.
pub fn rcu_do_callbacks(cpu: usize) -> usize {
    let done = GP_DONE.load(Ordering::SeqCst);
    let mut ready = alloc::vec::Vec::new();
    {
        let mut cbs = CALLBACKS[cpu % MAX_CPUS].lock();
        let mut remaining = VecDeque::new();
        while let Some(cb) = cbs.pop_front() {
            if cb.gp <= done {
                ready.push(cb);
            } else {
                remaining.push_back(cb);
            }
        }
        *cbs = remaining;
    }
    let n = ready.len();
    for cb in ready {
        (cb.func)(cb.arg);
    }
    n
}

/// Body of the per-CPU RCU worker thread.
pub fn rcu_worker(cpu: usize) -> ! {
    loop {
        rcu_do_callbacks(cpu);
        channel::sleep_on_bare(
            channel::chan_percpu(CHAN_KIND_RCU, cpu),
            ThreadState::Interruptible,
        );
    }
}

/// Block until a full grace period has elapsed.
pub fn synchronize_rcu() {
    use core::sync::atomic::AtomicBool;

    fn complete(arg: usize) {
        let flag = arg as *const AtomicBool;
        unsafe { (*flag).store(true, Ordering::SeqCst) };
        crate::sync::channel::wakeup(arg);
    }

    let flag = alloc::boxed::Box::new(AtomicBool::new(false));
    let addr = &*flag as *const AtomicBool as usize;
    call_rcu(complete, addr);

    static WAIT_LOCK: SpinLock<()> = SpinLock::new("rcu.sync", ());
    loop {
        let g = WAIT_LOCK.lock();
        if flag.load(Ordering::SeqCst) {
            break;
        }
        drop(channel::sleep_on(addr, g, ThreadState::Uninterruptible));
    }
}

/// Pending callback count for diagnostics.
pub fn pending_callbacks(cpu: usize) -> usize {
    CALLBACKS[cpu % MAX_CPUS].lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The grace-period counters are global; serialize the tests that poke them.
    static SERIAL: Mutex<()> = Mutex::new(());

    static RAN: AtomicU64 = AtomicU64::new(0);

    fn bump(arg: usize) {
        RAN.fetch_add(arg as u64, Ordering::SeqCst);
    }

    #[test]
    fn callback_runs_after_grace_period() {
        let _s = SERIAL.lock().unwrap();
        smp::set_online(0);

        let before = RAN.load(Ordering::SeqCst);
        call_rcu(bump, 5);
        // Not yet: the grace period has not completed
        rcu_do_callbacks(0);
        assert_eq!(RAN.load(Ordering::SeqCst), before);
        // Every online CPU passes a quiescent state
        for id in 0..MAX_CPUS {
            quiescent_on(id);
        }
        rcu_do_callbacks(0);
        assert_eq!(RAN.load(Ordering::SeqCst), before + 5);
    }

    #[test]
    fn grace_period_requires_every_online_cpu() {
        let _s = SERIAL.lock().unwrap();
        smp::set_online(0);

        call_rcu(bump, 0);
        let cur = GP_CUR.load(Ordering::SeqCst);
        assert!(cur > GP_DONE.load(Ordering::SeqCst));
        for id in 0..MAX_CPUS {
            quiescent_on(id);
        }
        assert_eq!(GP_DONE.load(Ordering::SeqCst), cur);
        rcu_do_callbacks(0);
    }
}
