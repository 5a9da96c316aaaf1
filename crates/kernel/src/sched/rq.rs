/// Per-CPU run queues and the two-level readiness mask.
///
/// `RqInner` (behind the CPU's rq spinlock) holds the per-priority FIFO
/// queues and the mask pair: an 8-bit group mask over groups of eight
/// majors and a 64-bit major mask. The lowest set bit is the best ready
/// class; finding it costs two trailing-zero counts. A lock-free mirror of
/// the per-major counts feeds `select_task_rq` without touching remote rq
/// locks, and a bounded wake list lets remote CPUs hand wakeups over
/// without contending the rq lock either.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::class::class_for_major;
use super::entity::{prio_major, NUM_MAJORS};
use crate::process::task::Thread;
use crate::smp::MAX_CPUS;
use crate::sync::{SpinLock, SpinLockGuard};

pub struct RqInner {
    pub cpu: usize,
    /// FIFO queues keyed by the full priority byte
    pub queues: BTreeMap<u8, VecDeque<Arc<Thread>>>,
    /// Runnable count per major level
    pub major_counts: [u32; NUM_MAJORS],
    /// Top level: bit g set when any major in [8g, 8g+8) is ready
    pub group_mask: u8,
    /// Second level: bit m set when major m is ready
    pub major_mask: u64,
    /// This CPU's idle thread, installed at boot
    pub idle: Option<Arc<Thread>>,
    pub nr_running: u32,
}

impl RqInner {
    const fn new(cpu: usize) -> Self {
        Self {
            cpu,
            queues: BTreeMap::new(),
            major_counts: [0; NUM_MAJORS],
            group_mask: 0,
            major_mask: 0,
            idle: None,
            nr_running: 0,
        }
    }

    /// Bookkeeping for one entity entering a major's queues.
    pub fn note_enqueued(&mut self, major: u8) {
        let m = major as usize % NUM_MAJORS;
        self.major_counts[m] += 1;
        self.major_mask |= 1u64 << m;
        self.group_mask |= 1u8 << (m / 8);
        self.nr_running += 1;
        queued_mirror(self.cpu, m).fetch_add(1, Ordering::Relaxed);
    }

    /// Bookkeeping for one entity leaving a major's queues.
    pub fn note_dequeued(&mut self, major: u8) {
        let m = major as usize % NUM_MAJORS;
        assert!(self.major_counts[m] > 0, "rq{}: major {} count underflow", self.cpu, m);
        self.major_counts[m] -= 1;
        if self.major_counts[m] == 0 {
            self.major_mask &= !(1u64 << m);
            let group = m / 8;
            if self.major_mask & (0xffu64 << (group * 8)) == 0 {
                self.group_mask &= !(1u8 << group);
            }
        }
        self.nr_running -= 1;
        queued_mirror(self.cpu, m).fetch_sub(1, Ordering::Relaxed);
    }

    /// Best (lowest) ready major, from the two-level mask.
    pub fn best_ready_major(&self) -> Option<u8> {
        if self.group_mask == 0 {
            return None;
        }
        let group = self.group_mask.trailing_zeros() as u64;
        let sub = (self.major_mask >> (group * 8)) & 0xff;
        debug_assert!(sub != 0, "group mask set with empty major byte");
        Some((group * 8 + sub.trailing_zeros() as u64) as u8)
    }
}

pub struct RqPercpu {
    pub lock: SpinLock<RqInner>,
    /// Entities a remote CPU wants enqueued here at the next opportunity
    wake_list: SpinLock<heapless::Deque<Arc<Thread>, 64>>,
    /// Lock-free mirror of `major_counts` for placement decisions
    queued: [AtomicU32; NUM_MAJORS],
    /// Set while the idle thread occupies this CPU
    pub idle_flag: AtomicBool,
}

impl RqPercpu {
    const fn new(cpu: usize) -> Self {
        Self {
            lock: SpinLock::new("rq", RqInner::new(cpu)),
            wake_list: SpinLock::new("rq.wake", heapless::Deque::new()),
            queued: [const { AtomicU32::new(0) }; NUM_MAJORS],
            idle_flag: AtomicBool::new(true),
        }
    }
}

static RUN_QUEUES: [RqPercpu; MAX_CPUS] = [
    RqPercpu::new(0),
    RqPercpu::new(1),
    RqPercpu::new(2),
    RqPercpu::new(3),
    RqPercpu::new(4),
    RqPercpu::new(5),
    RqPercpu::new(6),
    RqPercpu::new(7),
];

pub fn rq(cpu: usize) -> &'static RqPercpu {
    &RUN_QUEUES[cpu % MAX_CPUS]
}

fn queued_mirror(cpu: usize, major: usize) -> &'static AtomicU32 {
    &RUN_QUEUES[cpu % MAX_CPUS].queued[major]
}

/// Runnable count at `major` on `cpu`, without the rq lock.
pub fn queued_count(cpu: usize, major: u8) -> u32 {
    RUN_QUEUES[cpu % MAX_CPUS].queued[major as usize % NUM_MAJORS].load(Ordering::Relaxed)
}

/// Install the idle thread for a CPU (boot, before the first pick).
pub fn set_idle_thread(cpu: usize, t: Arc<Thread>) {
    rq(cpu).lock.lock().idle = Some(t);
}

/// Queue a remote wakeup; falls back to taking the remote rq lock when the
/// wake list is full.
pub fn push_remote_wake(cpu: usize, t: Arc<Thread>) {
    let overflow = {
        let mut wl = rq(cpu).wake_list.lock();
        match wl.push_back(t) {
            Ok(()) => None,
            Err(t) => Some(t),
        }
    };
    if let Some(t) = overflow {
        let mut inner = rq(cpu).lock.lock();
        enqueue_task(&mut inner, &t);
    }
}

/// Drain this CPU's wake list into its run queue. Called with the rq lock
/// held.
pub fn drain_wake_list(cpu: usize, inner: &mut RqInner) {
    loop {
        let t = {
            let mut wl = rq(cpu).wake_list.lock();
            wl.pop_front()
        };
        match t {
            Some(t) => enqueue_task(inner, &t),
            None => break,
        }
    }
}

/// Class-dispatched enqueue.
pub fn enqueue_task(inner: &mut RqInner, t: &Arc<Thread>) {
    let class = class_for_major(prio_major(t.sched.priority()));
    class.enqueue_task(inner, t);
}

/// Class-dispatched dequeue.
pub fn dequeue_task(inner: &mut RqInner, t: &Arc<Thread>) {
    let class = class_for_major(prio_major(t.sched.priority()));
    class.dequeue_task(inner, t);
}

/// The global pick: scan the mask pair, ask the winning class, detach the
/// choice. Falls back to the idle thread.
pub fn pick_next(inner: &mut RqInner) -> Arc<Thread> {
    if let Some(major) = inner.best_ready_major() {
        let class = class_for_major(major);
        if let Some(t) = class.pick_next_task(inner, major) {
            class.set_next_task(inner, &t);
            return t;
        }
    }
    inner.idle.clone().expect("rq: no idle thread installed")
}

/// Lock two CPUs' run queues in id order (deadlock-safe migration helper).
pub fn rq_lock_two(
    a: usize,
    b: usize,
) -> (SpinLockGuard<'static, RqInner>, SpinLockGuard<'static, RqInner>) {
    assert!(a != b, "rq_lock_two: identical CPUs");
    if a < b {
        let ga = rq(a).lock.lock();
        let gb = rq(b).lock.lock();
        (ga, gb)
    } else {
        let gb = rq(b).lock.lock();
        let ga = rq(a).lock.lock();
        (ga, gb)
    }
}

/// Placement: smallest relevant sub-queue count among allowed CPUs,
/// preferring the caller, then the lowest id.
pub fn choose_cpu(major: u8, allowed: usize, caller: usize) -> usize {
    choose_cpu_with(|cpu| queued_count(cpu, major), allowed, caller)
}

fn choose_cpu_with(count: impl Fn(usize) -> u32, allowed: usize, caller: usize) -> usize {
    if allowed == 0 {
        return caller;
    }
    let mut best: Option<(u32, bool, usize)> = None;
    for cpu in 0..MAX_CPUS {
        if allowed & (1 << cpu) == 0 {
            continue;
        }
        let key = (count(cpu), cpu != caller, cpu);
        if best.map_or(true, |b| key < b) {
            best = Some(key);
        }
    }
    best.map_or(caller, |(_, _, cpu)| cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pid::test_support::bare_thread;
    use crate::sched::entity::make_priority;

    fn thread_with_priority(tid: u32, major: u8, minor: u8) -> Arc<Thread> {
        let t = bare_thread(tid);
        t.sched.set_priority(make_priority(major, minor));
        t
    }

    #[test]
    fn pick_order_follows_priority() {
        crate::sched::class::init_classes();
        let mut inner = RqInner::new(7);
        inner.idle = Some(crate::process::task::Thread::new_idle(7));

        let prios = [(50u8, 0u8), (17, 0), (5, 0), (25, 0), (2, 0)];
        for (i, (maj, min)) in prios.iter().enumerate() {
            let t = thread_with_priority(700 + i as u32, *maj, *min);
            enqueue_task(&mut inner, &t);
        }

        let mut picked = alloc::vec::Vec::new();
        for _ in 0..prios.len() {
            let t = pick_next(&mut inner);
            picked.push(prio_major(t.sched.priority()));
        }
        assert_eq!(picked, alloc::vec![2, 5, 17, 25, 50]);
        // Drained: next pick is the idle thread
        assert!(pick_next(&mut inner).is_idle());
    }

    #[test]
    fn fifo_is_stable_within_a_minor_queue() {
        crate::sched::class::init_classes();
        let mut inner = RqInner::new(6);

        let a = thread_with_priority(720, 17, 1);
        let b = thread_with_priority(721, 17, 1);
        let c = thread_with_priority(722, 17, 1);
        for t in [&a, &b, &c] {
            enqueue_task(&mut inner, t);
        }
        let first = pick_next(&mut inner);
        let second = pick_next(&mut inner);
        let third = pick_next(&mut inner);
        assert_eq!(first.tid, 720);
        assert_eq!(second.tid, 721);
        assert_eq!(third.tid, 722);
    }

    #[test]
    fn minor_queues_order_within_a_major() {
        crate::sched::class::init_classes();
        let mut inner = RqInner::new(6);

        let lo = thread_with_priority(730, 17, 3);
        let hi = thread_with_priority(731, 17, 0);
        enqueue_task(&mut inner, &lo);
        enqueue_task(&mut inner, &hi);
        assert_eq!(pick_next(&mut inner).tid, 731);
        assert_eq!(pick_next(&mut inner).tid, 730);
    }

    #[test]
    fn ready_masks_track_queues() {
        crate::sched::class::init_classes();
        let mut inner = RqInner::new(5);
        assert_eq!(inner.best_ready_major(), None);

        let t = thread_with_priority(740, 20, 0);
        enqueue_task(&mut inner, &t);
        assert_eq!(inner.best_ready_major(), Some(20));
        assert!(inner.group_mask & (1 << 2) != 0);
        assert!(inner.major_mask & (1 << 20) != 0);

        dequeue_task(&mut inner, &t);
        assert_eq!(inner.best_ready_major(), None);
        assert_eq!(inner.group_mask, 0);
        assert_eq!(inner.major_mask, 0);
        assert!(!t.sched.on_rq.load(Ordering::SeqCst));
    }

    #[test]
    fn placement_prefers_caller_then_smallest_queue() {
        let counts = [3u32, 0, 2, 0, 9, 1, 1, 1];
        // Caller 3 has the joint-smallest queue: stay local
        assert_eq!(
            choose_cpu_with(|c| counts[c], 0b1111_1111, 3),
            3
        );
        // Caller loaded: go to the smallest, lowest id wins ties
        assert_eq!(choose_cpu_with(|c| counts[c], 0b1111_1111, 4), 1);
        // Affinity restricted
        assert_eq!(choose_cpu_with(|c| counts[c], 0b1000_0000, 0), 7);
        // Empty intersection falls back to the caller
        assert_eq!(choose_cpu_with(|c| counts[c], 0, 2), 2);
    }
}
