/// Scheduler timer: the global tick, deferred timer callbacks, and
/// millisecond sleeps.
///
/// The platform timer trap marks the tick and pokes a dedicated workqueue
/// thread; expired nodes are dispatched from that thread, never from the
/// trap itself. Callbacks run once per expiry; `retry_limit` bounds
/// re-dispatch on transient queue failure only, and direct dispatch has
/// none, so a panicking callback is not retried.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::klib::error::{Errno, Result};
use crate::process::task::{ThreadFlags, ThreadState};
use crate::sync::channel;
use crate::sync::SpinLock;

/// Platform tick rate (10 ms per tick)
pub const TICK_HZ: u64 = 100;

const CHAN_KIND_TIMER: usize = 2;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub struct TimerNode {
    pub deadline: u64,
    callback: fn(usize),
    arg: usize,
    pub retry_limit: u8,
}

struct TimerRoot {
    /// Expiry-ordered: key is (deadline, insertion sequence)
    nodes: BTreeMap<(u64, u64), TimerNode>,
    next_seq: u64,
}

static ROOT: SpinLock<TimerRoot> = SpinLock::new("timer.root", TimerRoot {
    nodes: BTreeMap::new(),
    next_seq: 0,
});

/// Handle for cancelling an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle((u64, u64));

pub fn ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ
}

pub fn ms_to_ticks(ms: u64) -> u64 {
    core::cmp::max(1, (ms * TICK_HZ).div_ceil(1000))
}

fn timer_chan() -> usize {
    channel::chan_percpu(CHAN_KIND_TIMER, 0)
}

/// Arm a timer at an absolute tick deadline.
pub fn timer_arm(deadline: u64, callback: fn(usize), arg: usize, retry_limit: u8) -> TimerHandle {
    let mut root = ROOT.lock();
    let key = (deadline, root.next_seq);
    root.next_seq += 1;
    root.nodes.insert(key, TimerNode {
        deadline,
        callback,
        arg,
        retry_limit,
    });
    TimerHandle(key)
}

/// Cancel an armed timer; false when it already fired (a callback already
/// running is not called back).
pub fn timer_cancel(h: TimerHandle) -> bool {
    ROOT.lock().nodes.remove(&h.0).is_some()
}

pub fn pending_timers() -> usize {
    ROOT.lock().nodes.len()
}

/// Pop every node whose deadline has passed, in expiry order.
fn pop_expired(now: u64) -> Vec<TimerNode> {
    let mut out = Vec::new();
    let mut root = ROOT.lock();
    loop {
        let key = match root.nodes.keys().next() {
            Some(&k) if k.0 <= now => k,
            _ => break,
        };
        if let Some(node) = root.nodes.remove(&key) {
            out.push(node);
        }
    }
    out
}

/// Workqueue thread body: dispatch expired callbacks, then sleep until the
/// next tick pokes us.
pub fn timer_worker(_arg: usize) {
    loop {
        let now = ticks();
        for node in pop_expired(now) {
            (node.callback)(node.arg);
        }
        channel::sleep_on_bare(timer_chan(), ThreadState::Interruptible);
    }
}

fn wake_tid_cb(arg: usize) {
    if let Some(t) = crate::process::pid::lookup(arg as u32) {
        crate::sched::wakeup_thread(&t);
    }
}

/// Sleep for at least `ms` milliseconds. `sleep_ms(0)` returns immediately;
/// a signal interrupts the sleep with EINTR.
pub fn sleep_ms(ms: u64) -> Result<()> {
    if ms == 0 {
        return Ok(());
    }
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let deadline = ticks() + ms_to_ticks(ms);
    let h = timer_arm(deadline, wake_tid_cb, t.tid as usize, 1);

    let mut interrupted = false;
    while ticks() < deadline {
        if t.killed() || t.has_flag(ThreadFlags::SIGPENDING) {
            interrupted = true;
            break;
        }
        t.set_state(ThreadState::Interruptible);
        crate::sched::block_current();
    }
    timer_cancel(h);
    if interrupted {
        Err(Errno::EINTR)
    } else {
        Ok(())
    }
}

/// Timed wait in one of the dedicated timer states; `killable` selects
/// whether SIGKILL-class signals may cut it short.
pub fn sleep_ticks(n: u64, killable: bool) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let deadline = ticks() + n;
    let h = timer_arm(deadline, wake_tid_cb, t.tid as usize, 1);
    let state = if killable {
        ThreadState::KillableTimer
    } else {
        ThreadState::Timer
    };

    let mut interrupted = false;
    while ticks() < deadline {
        if killable && t.killed() {
            interrupted = true;
            break;
        }
        t.set_state(state);
        crate::sched::block_current();
    }
    timer_cancel(h);
    if interrupted {
        Err(Errno::EINTR)
    } else {
        Ok(())
    }
}

fn tick_interval() -> u64 {
    crate::time::timebase_freq() / TICK_HZ
}

/// Program this hart's first tick.
pub fn start_hart_timer() {
    crate::arch::riscv64::sbi::set_timer(crate::arch::read_time() + tick_interval());
}

/// Platform timer trap hook: re-arm, advance the global tick (boot hart
/// only), poke the worker, run the scheduler's tick work.
pub fn on_timer_interrupt() {
    crate::arch::riscv64::sbi::set_timer(crate::arch::read_time() + tick_interval());
    if crate::smp::cpu_id() == crate::boot::boot_hartid() {
        TICKS.fetch_add(1, Ordering::SeqCst);
        channel::wakeup(timer_chan());
    }
    crate::sched::sched_tick();
}

/// Spawn the timer workqueue thread.
pub fn init() {
    let prio = crate::sched::entity::make_priority(crate::sched::entity::HIGH_MAJOR, 0);
    crate::process::kthread_spawn("ktimerd", timer_worker, 0, prio)
        .expect("timer: worker spawn failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    // The timer root is global; tests that pop it run one at a time.
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn bump(arg: usize) {
        FIRED.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn expiry_respects_deadline_order() {
        let _s = SERIAL.lock().unwrap();
        let base = 1_000_000; // far beyond any tick the suite reaches
        let _a = timer_arm(base + 30, bump, 1, 1);
        let _b = timer_arm(base + 10, bump, 2, 1);
        let _c = timer_arm(base + 20, bump, 4, 1);

        let expired = pop_expired(base + 15);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].deadline, base + 10);

        let expired = pop_expired(base + 40);
        assert_eq!(expired.len(), 2);
        assert!(expired[0].deadline <= expired[1].deadline);
    }

    #[test]
    fn cancel_removes_the_node() {
        let _s = SERIAL.lock().unwrap();
        let base = 2_000_000;
        let h = timer_arm(base, bump, 8, 1);
        assert!(timer_cancel(h));
        assert!(!timer_cancel(h));
        assert!(pop_expired(base + 1).is_empty());
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let _s = SERIAL.lock().unwrap();
        let base = 3_000_000;
        let _a = timer_arm(base, bump, 16, 1);
        let _b = timer_arm(base, bump, 32, 1);
        let expired = pop_expired(base);
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].arg, 16);
        assert_eq!(expired[1].arg, 32);
    }

    #[test]
    fn sleep_zero_returns_immediately() {
        assert!(sleep_ms(0).is_ok());
    }

    #[test]
    fn ms_to_ticks_rounds_up() {
        assert_eq!(ms_to_ticks(0), 1);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(1000), 100);
    }
}
