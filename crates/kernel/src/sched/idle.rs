/// The idle scheduling class: one thread per CPU at the reserved bottom
/// major, never queued, picked only when every mask bit is clear.

use alloc::sync::Arc;

use super::class::SchedClass;
use super::rq::RqInner;
use crate::process::task::Thread;

pub struct IdleClass;

impl SchedClass for IdleClass {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn enqueue_task(&self, _rq: &mut RqInner, t: &Arc<Thread>) {
        debug_assert!(t.is_idle(), "idle class: enqueue of a non-idle thread");
    }

    fn dequeue_task(&self, _rq: &mut RqInner, _t: &Arc<Thread>) {}

    fn pick_next_task(&self, rq: &mut RqInner, _major: u8) -> Option<Arc<Thread>> {
        rq.idle.clone()
    }

    fn put_prev_task(&self, _rq: &mut RqInner, _t: &Arc<Thread>) {}

    fn set_next_task(&self, _rq: &mut RqInner, _t: &Arc<Thread>) {}

    fn select_task_rq(&self, t: &Arc<Thread>, _allowed: usize) -> usize {
        t.sched.cpu()
    }
}
