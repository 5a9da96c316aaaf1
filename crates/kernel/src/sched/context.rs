/// Context switching and the scheduler driver.
///
/// Switches are direct: the outgoing thread picks its successor, hands it
/// the held run-queue lock across `swtch`, and the incoming thread releases
/// it in `finish_switch`. The interrupt-enable state travels with the
/// thread (a stack local across `swtch`), so a thread that blocks on one
/// CPU and resumes on another restores its own state, not its host's.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::class::{class_for_thread, SchedClass};
use super::entity::IDLE_PRIORITY;
use super::rq;
use crate::process::task::{Thread, ThreadFlags, ThreadState};
use crate::smp::{self, ipi, pop_off, push_off, this_cpu};
use crate::sync::rcu;

/// Saved callee-saved register set for `swtch`.
#[repr(C)]
#[derive(Clone)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    "
    .globl swtch
swtch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
"
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn swtch(old: *mut Context, new: *const Context);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch attempted on a hosted build");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchMode {
    /// Runnable handoff; the caller goes back in its queue
    Yield,
    /// The caller has already moved itself to a sleeping/stopped state
    Block,
    /// The caller is a zombie and never runs again
    Exit,
}

/// Voluntarily hand the CPU over, staying runnable.
pub fn yield_now() {
    switch_out(SwitchMode::Yield);
}

/// Switch away after the caller marked itself sleeping (sleep_on and the
/// timer path call this).
pub fn block_current() {
    switch_out(SwitchMode::Block);
}

/// Stop the calling thread (SIGSTOP-class delivery).
pub fn stop_current() {
    let t = smp::current_thread().expect("stop without a thread");
    t.set_state(ThreadState::Stopped);
    switch_out(SwitchMode::Block);
}

/// Final switch of an exiting thread.
pub fn exit_switch() -> ! {
    switch_out(SwitchMode::Exit);
    unreachable!("zombie thread was rescheduled");
}

fn switch_out(mode: SwitchMode) {
    push_off();
    let cpu = this_cpu();
    let prev = unsafe { cpu.current_ref() }
        .cloned()
        .expect("switch without a current thread");
    // The interrupt-enable state travels with the thread across the switch
    let intena = cpu.saved_intena();

    // A context switch is a quiescent state; note it before any rq lock is
    // held so a completing grace period may wake its workers
    rcu::rcu_note_quiescent();

    let rqp = rq::rq(cpu.id);
    let mut inner = rqp.lock.lock();
    rq::drain_wake_list(cpu.id, &mut inner);

    // A wakeup that landed between the sleep transition and here turns the
    // block into a no-op; the caller re-checks its condition.
    if mode == SwitchMode::Block && prev.state() == ThreadState::Wakening {
        prev.set_state(ThreadState::Running);
        drop(inner);
        pop_off();
        return;
    }

    match mode {
        SwitchMode::Yield => {
            if prev.state() == ThreadState::Running {
                class_for_thread(&prev).put_prev_task(&mut inner, &prev);
            }
        }
        SwitchMode::Block => {}
        SwitchMode::Exit => {
            class_for_thread(&prev).task_dead(&prev);
        }
    }

    let next = rq::pick_next(&mut inner);
    if Arc::ptr_eq(&next, &prev) {
        if prev.state() == ThreadState::Wakening {
            prev.set_state(ThreadState::Running);
        }
        cpu.need_resched.store(false, Ordering::Relaxed);
        drop(inner);
        pop_off();
        return;
    }

    if next.state() == ThreadState::Wakening {
        next.set_state(ThreadState::Running);
    }
    let now = super::timer::ticks();
    prev.sched.note_exec_stop(now);
    next.sched.note_exec_start(now);
    next.sched.on_cpu.store(true, Ordering::Release);
    next.sched.set_cpu(cpu.id);
    rqp.idle_flag.store(next.is_idle(), Ordering::Relaxed);
    unsafe {
        cpu.set_prev(prev.clone());
        cpu.set_current(Some(next.clone()));
    }

    let prev_ctx = prev.sched.context_ptr();
    let next_ctx = next.sched.context_ptr();

    // The rq lock rides across the switch; the incoming thread releases it
    core::mem::forget(inner);
    unsafe { swtch(prev_ctx, next_ctx) };

    // Back on some CPU: another thread switched to us and handed us its
    // rq lock and interrupt-disable level.
    finish_switch();
    let cpu = this_cpu();
    cpu.set_saved_intena(intena);
    pop_off();
}

/// Complete a context switch on the incoming thread's stack: retire the
/// outgoing thread, release the inherited rq lock, keep interrupts off for
/// the caller's epilogue.
fn finish_switch() {
    let cpu = this_cpu();
    if let Some(prev) = unsafe { cpu.take_prev() } {
        if prev.state() == ThreadState::Zombie && prev.has_flag(ThreadFlags::SELF_REAP) {
            crate::process::wait::queue_self_reap(prev.tid);
        }
        prev.sched.on_cpu.store(false, Ordering::Release);
    }
    unsafe { rq::rq(cpu.id).lock.force_unlock() };
    pop_off();
}

/// First frame of every new thread: finish the switch that started it,
/// enable interrupts, then run its entry.
extern "C" fn thread_start() -> ! {
    finish_switch();
    this_cpu().set_saved_intena(true);
    pop_off();

    let t = smp::current_thread().expect("thread_start without a thread");
    let entry = t.inner().entry.take();
    match entry {
        Some((f, arg)) => f(arg),
        None => {
            // A cloned user thread resumes through the external trap-return
            // path when one is registered
            let hook = USER_RETURN_HOOK.load(Ordering::Acquire);
            if hook != 0 {
                let f: fn() -> ! = unsafe { core::mem::transmute(hook) };
                f();
            }
        }
    }
    crate::process::wait::do_exit(0);
}

static USER_RETURN_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Register the trap layer's return-to-user entry for fresh clones.
pub fn set_user_return_hook(f: fn() -> !) {
    USER_RETURN_HOOK.store(f as usize, Ordering::Release);
}

/// Point a fresh thread's context at `thread_start` on its own stack.
pub fn prepare_first_run(t: &Arc<Thread>) {
    let ctx = unsafe { &mut *t.sched.context_ptr() };
    *ctx = Context::zeroed();
    ctx.ra = thread_start as usize;
    ctx.sp = t.kstack.top();
}

/// Move a sleeping thread toward a run queue.
///
/// Wakeups of the same thread are serialized by its PI lock and coalesce;
/// waking a thread that is not sleeping is a no-op. The `Wakening`
/// intermediary lets a thread that has not yet switched out observe its own
/// wake-up instead of being enqueued twice.
pub fn wakeup_thread(t: &Arc<Thread>) {
    let _pi = t.sched.pi.lock();
    if !t.state().is_sleeping() {
        return;
    }
    t.set_state(ThreadState::Wakening);

    if t.sched.on_cpu.load(Ordering::Acquire) {
        let still_here = unsafe { this_cpu().current_ref() }.map_or(false, |c| Arc::ptr_eq(c, t));
        if still_here {
            // It is this CPU's current thread mid-transition; its own
            // switch-out path will see Wakening and abort the block.
            return;
        }
        // Off-CPU wakeup: wait for its registers to be saved before it can
        // be run elsewhere
        while t.sched.on_cpu.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
    dispatch_wakening(t);
}

/// SIGCONT path: lift a stopped thread back to the scheduler.
pub fn resume_stopped(t: &Arc<Thread>) {
    let _pi = t.sched.pi.lock();
    if t.state() != ThreadState::Stopped {
        return;
    }
    t.set_state(ThreadState::Wakening);
    if t.sched.on_cpu.load(Ordering::Acquire) {
        let still_here = unsafe { this_cpu().current_ref() }.map_or(false, |c| Arc::ptr_eq(c, t));
        if still_here {
            return;
        }
        while t.sched.on_cpu.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
    dispatch_wakening(t);
}

fn dispatch_wakening(t: &Arc<Thread>) {
    let class: &'static dyn SchedClass = class_for_thread(t);
    let mut allowed = t.sched.affinity() & smp::online_mask();
    if allowed == 0 {
        allowed = 1 << smp::cpu_id();
    }
    let target = class.select_task_rq(t, allowed);
    let me = smp::cpu_id();

    if target == me {
        let rqp = rq::rq(me);
        let mut inner = rqp.lock.lock();
        rq::enqueue_task(&mut inner, t);
        drop(inner);
        let preempt = unsafe { this_cpu().current_ref() }
            .map_or(true, |c| t.sched.priority() < c.sched.priority());
        if preempt {
            this_cpu().need_resched.store(true, Ordering::Release);
        }
    } else {
        rq::push_remote_wake(target, t.clone());
        ipi::send_ipi(target, ipi::IpiType::Reschedule);
    }
}

/// Timer-tick hook: bill the running entity and ask for a reschedule when
/// something better is ready.
pub fn sched_tick() {
    let cpu = this_cpu();
    let rqp = rq::rq(cpu.id);
    let mut inner = rqp.lock.lock();
    rq::drain_wake_list(cpu.id, &mut inner);

    let current = unsafe { cpu.current_ref() }.cloned();
    if let Some(cur) = current {
        class_for_thread(&cur).task_tick(&mut inner, &cur);
        let cur_prio = if cur.is_idle() {
            IDLE_PRIORITY
        } else {
            cur.sched.priority()
        };
        if let Some(best) = inner.best_ready_major() {
            if best < super::entity::prio_major(cur_prio) || cur.is_idle() {
                cpu.need_resched.store(true, Ordering::Release);
            }
        }
    }
}

/// Preemption point on the trap-return path.
pub fn maybe_preempt() {
    let cpu = this_cpu();
    if !cpu.need_resched.swap(false, Ordering::AcqRel) {
        return;
    }
    let can_yield = smp::with_current(|t| {
        t.map_or(false, |t| t.state() == ThreadState::Running)
    });
    if can_yield {
        yield_now();
    }
}

/// Per-hart scheduler entry: adopt the idle identity and run the idle loop.
pub fn scheduler_run() -> ! {
    push_off();
    let cpu = this_cpu();
    let idle = unsafe { cpu.idle_thread() }.expect("idle thread not initialized");
    idle.set_state(ThreadState::Running);
    idle.sched.on_cpu.store(true, Ordering::Release);
    unsafe { cpu.set_current(Some(idle)) };
    let cpu_id = cpu.id;
    pop_off();

    smp::set_online(cpu_id);
    crate::arch::intr_on();
    crate::info!("scheduler: hart {} online", cpu_id);

    loop {
        rcu::rcu_note_quiescent();
        let rqp = rq::rq(cpu_id);
        let has_work = {
            let mut inner = rqp.lock.lock();
            rq::drain_wake_list(cpu_id, &mut inner);
            inner.nr_running > 0
        };
        if has_work {
            yield_now();
        } else {
            rqp.idle_flag.store(true, Ordering::Relaxed);
            crate::arch::wait_for_interrupt();
        }
    }
}

/// Install the per-CPU idle thread (boot path, before `scheduler_run`).
pub fn idle_thread_init(cpu_id: usize) {
    let idle = Thread::new_idle(cpu_id);
    prepare_first_run(&idle);
    unsafe { smp::cpu(cpu_id).set_idle_thread(idle.clone()) };
    rq::set_idle_thread(cpu_id, idle);
}
