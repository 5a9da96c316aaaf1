/// Scheduling classes: the dispatch contract and the boot-time registry.
///
/// Each major priority level maps to one registered class; the scheduler
/// picks the class from the ready mask and calls through this table.

use alloc::sync::Arc;
use spin::Once;

use super::entity::{prio_major, NUM_MAJORS};
use super::fifo::FifoClass;
use super::idle::IdleClass;
use super::rq::RqInner;
use crate::process::task::Thread;

pub trait SchedClass: Sync {
    fn name(&self) -> &'static str;

    /// Place an entity in its per-CPU queue and set the ready bits.
    fn enqueue_task(&self, rq: &mut RqInner, t: &Arc<Thread>);

    /// Remove an entity from its queue, clearing bits when it empties.
    fn dequeue_task(&self, rq: &mut RqInner, t: &Arc<Thread>);

    /// Head of the best non-empty sub-queue at `major`, left in place.
    fn pick_next_task(&self, rq: &mut RqInner, major: u8) -> Option<Arc<Thread>>;

    /// Re-insert the previously running entity.
    fn put_prev_task(&self, rq: &mut RqInner, t: &Arc<Thread>);

    /// Detach the about-to-run entity from its queue.
    fn set_next_task(&self, rq: &mut RqInner, t: &Arc<Thread>);

    /// Choose a CPU for a waking entity within `allowed`.
    fn select_task_rq(&self, t: &Arc<Thread>, allowed: usize) -> usize;

    fn task_tick(&self, _rq: &mut RqInner, _t: &Arc<Thread>) {}
    fn yield_task(&self, _rq: &mut RqInner, _t: &Arc<Thread>) {}
    fn task_fork(&self, _t: &Arc<Thread>) {}
    fn task_dead(&self, _t: &Arc<Thread>) {}
}

static FIFO_CLASS: FifoClass = FifoClass;
static IDLE_CLASS: IdleClass = IdleClass;

static CLASS_TABLE: Once<[&'static dyn SchedClass; NUM_MAJORS]> = Once::new();

/// Register the built-in classes: FIFO across the ordinary majors, the
/// idle class on the reserved bottom level.
pub fn init_classes() {
    CLASS_TABLE.call_once(|| {
        let mut table: [&'static dyn SchedClass; NUM_MAJORS] = [&FIFO_CLASS; NUM_MAJORS];
        table[super::entity::IDLE_MAJOR as usize] = &IDLE_CLASS;
        table
    });
}

pub fn class_for_major(major: u8) -> &'static dyn SchedClass {
    match CLASS_TABLE.get() {
        Some(t) => t[major as usize % NUM_MAJORS],
        None => &FIFO_CLASS,
    }
}

pub fn class_for_thread(t: &Arc<Thread>) -> &'static dyn SchedClass {
    class_for_major(prio_major(t.sched.priority()))
}
