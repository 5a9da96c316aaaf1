//! In-kernel validation suite.
//!
//! Exercises the concurrency contracts that host unit tests cannot: real
//! threads on real CPUs going through the scheduler. Invoked from the init
//! thread at the end of boot when the `selftest` feature is on; any failed
//! check panics, which is the point.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::mm::{PageKind, SlabCache, SlabFlags};
use crate::process::{self, CloneArgs, CloneFlags};
use crate::sched::entity::make_priority;
use crate::sched::{self, sleep_ms};
use crate::sync::RwLock;

fn spawn(name: &'static str, entry: fn(usize), arg: usize) {
    process::kthread_spawn(name, entry, arg, sched::DEFAULT_PRIORITY)
        .expect("selftest: spawn failed");
}

/// Poll a condition with a tick-sized nap, panicking after `ms`.
fn wait_until(what: &'static str, ms: u64, cond: impl Fn() -> bool) {
    let deadline = sched::timer::ticks() + sched::timer::ms_to_ticks(ms);
    while !cond() {
        assert!(
            sched::timer::ticks() < deadline,
            "selftest: timed out waiting for {}",
            what
        );
        let _ = sleep_ms(10);
    }
}

pub fn run_all() {
    crate::info!("selftest: starting");
    rwlock_reader_concurrency();
    rwlock_writer_waits_for_readers();
    rwlock_writer_mutual_exclusion();
    rwlock_stress();
    priority_run_order();
    group_exit();
    slab_partial_reuse();
    buddy_merge();
    crate::info!("selftest: all scenarios passed");
}

// ── Scenario: 4 concurrent readers ──────────────────────────────────────

static R1_LOCK: RwLock<u32> = RwLock::new(0);
static R1_IN: AtomicU32 = AtomicU32::new(0);
static R1_MAX: AtomicU32 = AtomicU32::new(0);
static R1_RELEASE: AtomicBool = AtomicBool::new(false);
static R1_DONE: AtomicU32 = AtomicU32::new(0);

fn r1_reader(_arg: usize) {
    let g = R1_LOCK.read();
    let now = R1_IN.fetch_add(1, Ordering::SeqCst) + 1;
    R1_MAX.fetch_max(now, Ordering::SeqCst);
    while !R1_RELEASE.load(Ordering::SeqCst) {
        let _ = sleep_ms(10);
    }
    R1_IN.fetch_sub(1, Ordering::SeqCst);
    drop(g);
    R1_DONE.fetch_add(1, Ordering::SeqCst);
}

fn rwlock_reader_concurrency() {
    for _ in 0..4 {
        spawn("st-reader", r1_reader, 0);
    }
    wait_until("4 readers inside", 3000, || R1_IN.load(Ordering::SeqCst) == 4);
    assert_eq!(R1_MAX.load(Ordering::SeqCst), 4);
    R1_RELEASE.store(true, Ordering::SeqCst);
    wait_until("readers done", 3000, || R1_DONE.load(Ordering::SeqCst) == 4);
    crate::info!("selftest: rwlock 4-reader concurrency ok");
}

// ── Scenario: a writer waits for readers ────────────────────────────────

static R2_LOCK: RwLock<u32> = RwLock::new(0);
static R2_READERS: AtomicU32 = AtomicU32::new(0);
static R2_OBSERVED: AtomicU32 = AtomicU32::new(u32::MAX);
static R2_DONE: AtomicBool = AtomicBool::new(false);

fn r2_reader(_arg: usize) {
    let g = R2_LOCK.read();
    R2_READERS.fetch_add(1, Ordering::SeqCst);
    // Hold across several scheduling rounds
    for _ in 0..5 {
        sched::yield_now();
        let _ = sleep_ms(10);
    }
    drop(g);
}

fn r2_writer(_arg: usize) {
    let g = R2_LOCK.write();
    // Writer preference: at acquisition no reader may be active
    R2_OBSERVED.store(R2_LOCK.state_snapshot().0, Ordering::SeqCst);
    drop(g);
    R2_DONE.store(true, Ordering::SeqCst);
}

fn rwlock_writer_waits_for_readers() {
    for _ in 0..3 {
        spawn("st-reader", r2_reader, 0);
    }
    wait_until("readers hold the lock", 3000, || {
        R2_READERS.load(Ordering::SeqCst) == 3
    });
    spawn("st-writer", r2_writer, 0);
    wait_until("writer acquired", 3000, || R2_DONE.load(Ordering::SeqCst));
    assert_eq!(R2_OBSERVED.load(Ordering::SeqCst), 0);
    crate::info!("selftest: rwlock writer-waits-for-readers ok");
}

// ── Scenario: writer mutual exclusion ───────────────────────────────────

static R3_LOCK: RwLock<u32> = RwLock::new(0);
static R3_ACTIVE: AtomicU32 = AtomicU32::new(0);
static R3_MAX: AtomicU32 = AtomicU32::new(0);
static R3_DONE: AtomicU32 = AtomicU32::new(0);

fn r3_writer(_arg: usize) {
    for _ in 0..10 {
        let g = R3_LOCK.write();
        let now = R3_ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
        R3_MAX.fetch_max(now, Ordering::SeqCst);
        let _ = sleep_ms(5);
        R3_ACTIVE.fetch_sub(1, Ordering::SeqCst);
        drop(g);
        sched::yield_now();
    }
    R3_DONE.fetch_add(1, Ordering::SeqCst);
}

fn rwlock_writer_mutual_exclusion() {
    spawn("st-writer", r3_writer, 0);
    spawn("st-writer", r3_writer, 0);
    wait_until("writers done", 10_000, || R3_DONE.load(Ordering::SeqCst) == 2);
    assert_eq!(R3_MAX.load(Ordering::SeqCst), 1);
    crate::info!("selftest: rwlock writer exclusion ok");
}

// ── Scenario: mixed stress ──────────────────────────────────────────────

const STRESS_WORDS: usize = 32;
const STRESS_ITERS: u64 = 150;

struct StressData {
    version: u64,
    data: [u64; STRESS_WORDS],
}

fn stress_word(version: u64, i: usize) -> u64 {
    version.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ i as u64
}

static STRESS: RwLock<StressData> = RwLock::new(StressData {
    version: 0,
    data: [0; STRESS_WORDS],
});
static STRESS_WRITERS_DONE: AtomicU32 = AtomicU32::new(0);
static STRESS_READERS_DONE: AtomicU32 = AtomicU32::new(0);
static STRESS_BAD_READS: AtomicU32 = AtomicU32::new(0);

fn stress_writer(_arg: usize) {
    for _ in 0..STRESS_ITERS {
        let mut g = STRESS.write();
        g.version += 1;
        let v = g.version;
        for i in 0..STRESS_WORDS {
            g.data[i] = stress_word(v, i);
        }
        drop(g);
        sched::yield_now();
    }
    STRESS_WRITERS_DONE.fetch_add(1, Ordering::SeqCst);
}

fn stress_reader(_arg: usize) {
    while STRESS_WRITERS_DONE.load(Ordering::SeqCst) < 2 {
        let g = STRESS.read();
        let v = g.version;
        let consistent = (0..STRESS_WORDS).all(|i| g.data[i] == stress_word(v, i))
            || v == 0;
        drop(g);
        if !consistent {
            STRESS_BAD_READS.fetch_add(1, Ordering::SeqCst);
        }
        sched::yield_now();
    }
    STRESS_READERS_DONE.fetch_add(1, Ordering::SeqCst);
}

fn rwlock_stress() {
    for _ in 0..6 {
        spawn("st-stress-r", stress_reader, 0);
    }
    spawn("st-stress-w", stress_writer, 0);
    spawn("st-stress-w", stress_writer, 0);
    wait_until("stress finished", 30_000, || {
        STRESS_WRITERS_DONE.load(Ordering::SeqCst) == 2
            && STRESS_READERS_DONE.load(Ordering::SeqCst) == 6
    });
    assert_eq!(STRESS_BAD_READS.load(Ordering::SeqCst), 0);
    assert_eq!(STRESS.read().version, 2 * STRESS_ITERS);
    crate::info!("selftest: rwlock stress ok ({} writes)", 2 * STRESS_ITERS);
}

// ── Scenario: priority run order ────────────────────────────────────────

static PRIO_ORDER: [AtomicU32; 5] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];
static PRIO_SLOT: AtomicUsize = AtomicUsize::new(0);
static PRIO_GATE: AtomicBool = AtomicBool::new(false);
static PRIO_GATE_UP: AtomicBool = AtomicBool::new(false);

fn prio_gate(_arg: usize) {
    PRIO_GATE_UP.store(true, Ordering::SeqCst);
    while !PRIO_GATE.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }
}

fn prio_recorder(major: usize) {
    let slot = PRIO_SLOT.fetch_add(1, Ordering::SeqCst);
    if slot < 5 {
        PRIO_ORDER[slot].store(major as u32, Ordering::SeqCst);
    }
}

fn priority_run_order() {
    // Park a high-priority spinner on another CPU, queue five recorders
    // behind it, then open the gate and watch the pick order.
    let me = crate::smp::cpu_id();
    let target = (0..crate::smp::MAX_CPUS)
        .find(|&c| c != me && crate::smp::is_cpu_online(c));
    let target = match target {
        Some(c) => c,
        None => {
            crate::warn!("selftest: priority order needs a second hart, skipped");
            return;
        }
    };

    let gate = process::kthread_create(
        "st-gate",
        prio_gate,
        0,
        make_priority(crate::sched::entity::HIGH_MAJOR, 0),
    )
    .expect("selftest: spawn failed");
    gate.sched.set_affinity(1 << target);
    sched::wakeup_thread(&gate);
    wait_until("gate thread spinning", 3000, || {
        PRIO_GATE_UP.load(Ordering::SeqCst)
    });

    for major in [50u8, 17, 5, 25, 2] {
        let t = process::kthread_create(
            "st-prio",
            prio_recorder,
            major as usize,
            make_priority(major, 0),
        )
        .expect("selftest: spawn failed");
        t.sched.set_affinity(1 << target);
        sched::wakeup_thread(&t);
    }

    PRIO_GATE.store(true, Ordering::SeqCst);
    wait_until("recorders ran", 5000, || {
        PRIO_SLOT.load(Ordering::SeqCst) >= 5
    });
    let order: alloc::vec::Vec<u32> =
        PRIO_ORDER.iter().map(|a| a.load(Ordering::SeqCst)).collect();
    assert_eq!(order, alloc::vec![2, 5, 17, 25, 50]);
    crate::info!("selftest: priority run order ok");
}

// ── Scenario: group exit ────────────────────────────────────────────────

static GRP_MEMBERS_UP: AtomicU32 = AtomicU32::new(0);
static GRP_GO: AtomicBool = AtomicBool::new(false);

fn grp_member(_arg: usize) {
    GRP_MEMBERS_UP.fetch_add(1, Ordering::SeqCst);
    loop {
        // Killed by the group exit; the sleep returns EINTR and the safe
        // point runs the exit path
        let _ = sleep_ms(10);
        crate::process::signal::deliver_pending();
    }
}

fn grp_leader(_arg: usize) {
    GRP_MEMBERS_UP.fetch_add(1, Ordering::SeqCst);
    let flags = CloneFlags::THREAD | CloneFlags::SIGHAND | CloneFlags::VM;
    for _ in 0..2 {
        process::do_clone(&CloneArgs {
            flags: flags.bits(),
            entry: grp_member as usize,
            ..CloneArgs::default()
        })
        .expect("selftest: clone failed");
    }
    while !GRP_GO.load(Ordering::SeqCst) {
        let _ = sleep_ms(10);
    }
    process::do_exit_group(7);
}

fn group_exit() {
    let leader = process::kthread_spawn(
        "st-group",
        grp_leader,
        0,
        sched::DEFAULT_PRIORITY,
    )
    .expect("selftest: spawn failed");
    // The scenario reaps the leader through wait
    leader.clear_flag(process::ThreadFlags::SELF_REAP);

    wait_until("group populated", 3000, || {
        GRP_MEMBERS_UP.load(Ordering::SeqCst) >= 1 && leader.group.live() == 3
    });
    GRP_GO.store(true, Ordering::SeqCst);

    let (tid, status) = process::do_wait(leader.tid as i32, 0).expect("selftest: wait failed");
    assert_eq!(tid, leader.tid);
    assert_eq!(status >> 8, 7);
    assert_eq!(leader.group.live(), 0);
    crate::info!("selftest: group exit ok");
}

// ── Scenario: slab partial reuse ────────────────────────────────────────

fn slab_partial_reuse() {
    let cache: &'static SlabCache = Box::leak(Box::new(SlabCache::new(
        "st-slab",
        96,
        SlabFlags::empty(),
    )));
    let a = cache.alloc().expect("selftest: slab alloc");
    cache.free(a);
    let b = cache.alloc().expect("selftest: slab realloc");
    assert_eq!(a.as_ptr(), b.as_ptr());
    assert_eq!(cache.stats().obj_active, 1);
    cache.free(b);
    cache.destroy().expect("selftest: slab destroy");
    crate::info!("selftest: slab partial reuse ok");
}

// ── Scenario: buddy merge ───────────────────────────────────────────────

fn buddy_merge() {
    let pool = crate::mm::buddy::pool().expect("selftest: no buddy pool");
    let a = pool.alloc_page(PageKind::Anon).expect("selftest: page alloc");
    let b = pool.alloc_page(PageKind::Anon).expect("selftest: page alloc");

    if crate::mm::pa_to_pfn(a) ^ 1 == crate::mm::pa_to_pfn(b) {
        let heads1 = pool.free_heads(1);
        pool.page_put(a);
        pool.page_put(b);
        // The pair coalesced: one extra head appeared at order >= 1
        let heads1_after = pool.free_heads(1);
        assert!(heads1_after > heads1 || pool.free_heads(0) == 0);
        crate::info!("selftest: buddy merge ok");
    } else {
        pool.page_put(a);
        pool.page_put(b);
        crate::warn!("selftest: buddy pages were not buddies, merge not observed");
    }
}
