/// Scheduler: per-CPU two-level priority run queues, pluggable scheduling
/// classes, context switching and timers.

pub mod class;
pub mod context;
pub mod entity;
pub mod fifo;
pub mod idle;
pub mod rq;
pub mod timer;

use alloc::sync::Arc;

use crate::klib::error::{Errno, Result};
use crate::process::task::Thread;

pub use class::{class_for_major, class_for_thread, init_classes, SchedClass};
pub use context::{
    block_current, exit_switch, idle_thread_init, maybe_preempt, prepare_first_run,
    resume_stopped, scheduler_run, sched_tick, set_user_return_hook, stop_current, wakeup_thread,
    yield_now, Context,
};
pub use entity::{make_priority, prio_major, prio_minor, SchedEntity, DEFAULT_PRIORITY};
pub use rq::{rq_lock_two, RqInner, RqPercpu};
pub use timer::sleep_ms;

/// Scheduling parameters visible through sched_getattr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttr {
    pub priority: u8,
    pub affinity: usize,
}

/// Change a thread's priority and affinity, re-queueing it if it is
/// currently runnable.
pub fn sched_setattr(t: &Arc<Thread>, attr: SchedAttr) -> Result<()> {
    if entity::prio_major(attr.priority) == entity::IDLE_MAJOR && !t.is_idle() {
        return Err(Errno::EINVAL);
    }
    if attr.affinity == 0 {
        return Err(Errno::EINVAL);
    }

    // The PI lock freezes wakeups while the entity moves between queues
    let _pi = t.sched.pi.lock();
    t.sched.set_affinity(attr.affinity);

    if t.sched.on_rq.load(core::sync::atomic::Ordering::SeqCst) {
        let cur_cpu = t.sched.cpu();
        let mut inner = rq::rq(cur_cpu).lock.lock();
        if t.sched.on_rq.load(core::sync::atomic::Ordering::SeqCst) {
            rq::dequeue_task(&mut inner, t);
            t.sched.set_priority(attr.priority);
            if attr.affinity & (1 << cur_cpu) != 0 {
                rq::enqueue_task(&mut inner, t);
                return Ok(());
            }
            drop(inner);
            let target = class_for_thread(t).select_task_rq(t, attr.affinity);
            let mut remote = rq::rq(target).lock.lock();
            rq::enqueue_task(&mut remote, t);
            return Ok(());
        }
    }
    t.sched.set_priority(attr.priority);
    Ok(())
}

/// Read back a thread's scheduling parameters.
pub fn sched_getattr(t: &Arc<Thread>) -> SchedAttr {
    SchedAttr {
        priority: t.sched.priority(),
        affinity: t.sched.affinity(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pid::test_support::bare_thread;

    #[test]
    fn setattr_getattr_roundtrips() {
        init_classes();
        let t = bare_thread(800);
        let attr = SchedAttr {
            priority: make_priority(9, 2),
            affinity: 0b11,
        };
        sched_setattr(&t, attr).unwrap();
        assert_eq!(sched_getattr(&t), attr);
        // Identity: applying the read-back attributes changes nothing
        sched_setattr(&t, sched_getattr(&t)).unwrap();
        assert_eq!(sched_getattr(&t), attr);
    }

    #[test]
    fn setattr_rejects_bad_parameters() {
        init_classes();
        let t = bare_thread(801);
        let idle_prio = SchedAttr {
            priority: make_priority(entity::IDLE_MAJOR, 0),
            affinity: 1,
        };
        assert_eq!(sched_setattr(&t, idle_prio), Err(Errno::EINVAL));
        let no_affinity = SchedAttr {
            priority: DEFAULT_PRIORITY,
            affinity: 0,
        };
        assert_eq!(sched_setattr(&t, no_affinity), Err(Errno::EINVAL));
    }

    #[test]
    fn setattr_requeues_a_runnable_thread() {
        init_classes();
        let t = bare_thread(802);
        t.sched.set_affinity(1 << 2);
        {
            let mut inner = rq::rq(2).lock.lock();
            rq::enqueue_task(&mut inner, &t);
        }
        let attr = SchedAttr {
            priority: make_priority(5, 0),
            affinity: 1 << 2,
        };
        sched_setattr(&t, attr).unwrap();
        assert!(t.sched.on_rq.load(core::sync::atomic::Ordering::SeqCst));

        let mut inner = rq::rq(2).lock.lock();
        let picked = rq::pick_next(&mut inner);
        assert_eq!(picked.tid, 802);
        assert_eq!(picked.sched.priority(), make_priority(5, 0));
    }
}
