/// The FIFO scheduling class.
///
/// Four minor sub-queues per major level; within one sub-queue arrival
/// order is preserved, and a preempted entity goes to the back. FIFO has
/// no tick bookkeeping: an entity runs until it blocks, yields, exits or a
/// higher priority arrives.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::class::SchedClass;
use super::entity::{prio_major, MINORS_PER_MAJOR};
use super::rq::{choose_cpu, RqInner};
use crate::process::task::Thread;

pub struct FifoClass;

impl SchedClass for FifoClass {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn enqueue_task(&self, rq: &mut RqInner, t: &Arc<Thread>) {
        let prio = t.sched.priority();
        rq.queues
            .entry(prio)
            .or_insert_with(VecDeque::new)
            .push_back(t.clone());
        rq.note_enqueued(prio_major(prio));
        t.sched.on_rq.store(true, Ordering::SeqCst);
        t.sched.set_cpu(rq.cpu);
    }

    fn dequeue_task(&self, rq: &mut RqInner, t: &Arc<Thread>) {
        let prio = t.sched.priority();
        if let Some(q) = rq.queues.get_mut(&prio) {
            if let Some(i) = q.iter().position(|x| Arc::ptr_eq(x, t)) {
                q.remove(i);
                if q.is_empty() {
                    rq.queues.remove(&prio);
                }
                rq.note_dequeued(prio_major(prio));
                t.sched.on_rq.store(false, Ordering::SeqCst);
            }
        }
    }

    fn pick_next_task(&self, rq: &mut RqInner, major: u8) -> Option<Arc<Thread>> {
        let base = major << 2;
        let last = base + (MINORS_PER_MAJOR as u8 - 1);
        // Lowest-index non-empty minor sub-queue wins
        for (_, q) in rq.queues.range(base..=last) {
            if let Some(t) = q.front() {
                return Some(t.clone());
            }
        }
        None
    }

    fn put_prev_task(&self, rq: &mut RqInner, t: &Arc<Thread>) {
        self.enqueue_task(rq, t);
    }

    fn set_next_task(&self, rq: &mut RqInner, t: &Arc<Thread>) {
        let prio = t.sched.priority();
        let emptied = match rq.queues.get_mut(&prio) {
            Some(q) => {
                let head = q.pop_front();
                debug_assert!(
                    head.as_ref().map_or(false, |h| Arc::ptr_eq(h, t)),
                    "fifo: set_next_task on a non-head entity"
                );
                q.is_empty()
            }
            None => return,
        };
        if emptied {
            rq.queues.remove(&prio);
        }
        rq.note_dequeued(prio_major(prio));
        t.sched.on_rq.store(false, Ordering::SeqCst);
    }

    fn select_task_rq(&self, t: &Arc<Thread>, allowed: usize) -> usize {
        let major = prio_major(t.sched.priority());
        choose_cpu(major, allowed, crate::smp::cpu_id())
    }

    fn yield_task(&self, rq: &mut RqInner, t: &Arc<Thread>) {
        // Round-robin within the sub-queue: drop to the back
        self.dequeue_task(rq, t);
        self.enqueue_task(rq, t);
    }
}
