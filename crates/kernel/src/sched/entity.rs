/// Scheduling entities and the composite priority encoding.
///
/// Priority is one byte: bits 2..7 are the *major* level (0..63, selects
/// the scheduling class), bits 0..1 the *minor* sub-queue (0..3). Lower
/// values run first. The two-level split lets the ready-mask scan find the
/// best class with two trailing-zero counts.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::context::Context;
use crate::sync::SpinLock;

pub const NUM_MAJORS: usize = 64;
pub const MINORS_PER_MAJOR: usize = 4;

/// Reserved majors
pub const EXIT_MAJOR: u8 = 0;
pub const HIGH_MAJOR: u8 = 1;
pub const DEFAULT_MAJOR: u8 = 17;
pub const IDLE_MAJOR: u8 = 63;

pub const fn make_priority(major: u8, minor: u8) -> u8 {
    (major << 2) | (minor & 0x3)
}

pub const fn prio_major(prio: u8) -> u8 {
    prio >> 2
}

pub const fn prio_minor(prio: u8) -> u8 {
    prio & 0x3
}

pub const DEFAULT_PRIORITY: u8 = make_priority(DEFAULT_MAJOR, 0);
pub const IDLE_PRIORITY: u8 = make_priority(IDLE_MAJOR, 3);

/// Default load weight (unused by FIFO; carried for accounting).
pub const DEFAULT_LOAD_WEIGHT: u32 = 1024;

/// Per-thread scheduling state.
pub struct SchedEntity {
    priority: AtomicU8,
    /// CPUs this entity may run on (bitmask)
    affinity: AtomicUsize,
    /// Present in some run queue
    pub on_rq: AtomicBool,
    /// Executing on a CPU right now; cleared only after its registers are
    /// saved, so a migrating wakeup never races the switch-out
    pub on_cpu: AtomicBool,
    /// Last CPU this entity ran or was queued on
    cpu: AtomicUsize,
    /// Serializes wakeups of this entity; duplicate wakes coalesce here
    pub pi: SpinLock<()>,
    /// Saved callee-saved registers; touched only during a switch, under
    /// the run-queue lock
    context: UnsafeCell<Context>,
    pub load_weight: AtomicU32,
    exec_start_tick: AtomicU64,
    total_runtime_ticks: AtomicU64,
}

// SAFETY: the context cell is only accessed under the run-queue lock during
// a context switch.
unsafe impl Send for SchedEntity {}
unsafe impl Sync for SchedEntity {}

impl SchedEntity {
    pub fn new(priority: u8) -> Self {
        Self {
            priority: AtomicU8::new(priority),
            affinity: AtomicUsize::new(usize::MAX),
            on_rq: AtomicBool::new(false),
            on_cpu: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            pi: SpinLock::new("se.pi", ()),
            context: UnsafeCell::new(Context::zeroed()),
            load_weight: AtomicU32::new(DEFAULT_LOAD_WEIGHT),
            exec_start_tick: AtomicU64::new(0),
            total_runtime_ticks: AtomicU64::new(0),
        }
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, prio: u8) {
        self.priority.store(prio, Ordering::SeqCst);
    }

    pub fn affinity(&self) -> usize {
        self.affinity.load(Ordering::SeqCst)
    }

    pub fn set_affinity(&self, mask: usize) {
        self.affinity.store(mask, Ordering::SeqCst);
    }

    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub fn note_exec_start(&self, tick: u64) {
        self.exec_start_tick.store(tick, Ordering::Relaxed);
    }

    pub fn note_exec_stop(&self, tick: u64) {
        let start = self.exec_start_tick.load(Ordering::Relaxed);
        self.total_runtime_ticks
            .fetch_add(tick.saturating_sub(start), Ordering::Relaxed);
    }

    pub fn total_runtime_ticks(&self) -> u64 {
        self.total_runtime_ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_encoding_roundtrips() {
        for major in [0u8, 1, 17, 40, 63] {
            for minor in 0u8..4 {
                let p = make_priority(major, minor);
                assert_eq!(prio_major(p), major);
                assert_eq!(prio_minor(p), minor);
            }
        }
    }

    #[test]
    fn reserved_majors() {
        assert_eq!(EXIT_MAJOR, 0);
        assert_eq!(IDLE_MAJOR, 63);
        assert_eq!(prio_major(DEFAULT_PRIORITY), 17);
        assert!(make_priority(2, 0) < make_priority(2, 1));
        assert!(make_priority(2, 3) < make_priority(3, 0));
    }

    #[test]
    fn runtime_accounting_accumulates() {
        let se = SchedEntity::new(DEFAULT_PRIORITY);
        se.note_exec_start(100);
        se.note_exec_stop(130);
        se.note_exec_start(200);
        se.note_exec_stop(205);
        assert_eq!(se.total_runtime_ticks(), 35);
    }
}
