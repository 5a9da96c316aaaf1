// POSIX signal model on top of the TCB and thread group.
//
// Lock order on the signal paths: sigacts.lock is taken before tcb.lock,
// and tcb.lock before the thread group's inner lock. Dispositions are read
// in a separate phase from pending-set mutation so delivery never holds
// both at once.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::klib::error::{Errno, Result};
use crate::process::task::{SignalFrame, Thread, ThreadFlags, ThreadState, Tid};

pub const NSIG: usize = 32;

/// Signal numbers (POSIX standard)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
    SIGTSTP = 20,
    SIGTTIN = 21,
    SIGTTOU = 22,
}

impl Signal {
    pub fn from_u32(signo: u32) -> Option<Self> {
        match signo {
            1 => Some(Signal::SIGHUP),
            2 => Some(Signal::SIGINT),
            3 => Some(Signal::SIGQUIT),
            4 => Some(Signal::SIGILL),
            5 => Some(Signal::SIGTRAP),
            6 => Some(Signal::SIGABRT),
            7 => Some(Signal::SIGBUS),
            8 => Some(Signal::SIGFPE),
            9 => Some(Signal::SIGKILL),
            10 => Some(Signal::SIGUSR1),
            11 => Some(Signal::SIGSEGV),
            12 => Some(Signal::SIGUSR2),
            13 => Some(Signal::SIGPIPE),
            14 => Some(Signal::SIGALRM),
            15 => Some(Signal::SIGTERM),
            17 => Some(Signal::SIGCHLD),
            18 => Some(Signal::SIGCONT),
            19 => Some(Signal::SIGSTOP),
            20 => Some(Signal::SIGTSTP),
            21 => Some(Signal::SIGTTIN),
            22 => Some(Signal::SIGTTOU),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// SIGKILL and SIGSTOP can be neither caught nor blocked.
    pub fn is_catchable(self) -> bool {
        !matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    pub fn is_stop_class(self) -> bool {
        matches!(
            self,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        )
    }

    /// Signals that force a transition even out of killable sleeps.
    pub fn is_fatal_class(self) -> bool {
        matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    pub fn default_action(self) -> SigDefault {
        match self {
            Signal::SIGCHLD => SigDefault::Ignore,
            Signal::SIGCONT => SigDefault::Continue,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                SigDefault::Stop
            }
            Signal::SIGQUIT
            | Signal::SIGILL
            | Signal::SIGTRAP
            | Signal::SIGABRT
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGSEGV => SigDefault::Core,
            _ => SigDefault::Terminate,
        }
    }
}

/// Default disposition classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDefault {
    Ignore,
    Terminate,
    Core,
    Stop,
    Continue,
}

/// A set of signals as a bit mask (bit N-1 = signal N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const fn empty() -> Self {
        SignalSet(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        SignalSet(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    fn bit(sig: Signal) -> u64 {
        1u64 << (sig.to_u32() - 1)
    }

    pub fn add(&mut self, sig: Signal) {
        self.0 |= Self::bit(sig);
    }

    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !Self::bit(sig);
    }

    pub fn contains(self, sig: Signal) -> bool {
        self.0 & Self::bit(sig) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: SignalSet) -> SignalSet {
        SignalSet(self.0 | other.0)
    }

    /// Lowest-numbered signal present and not masked.
    pub fn first_unmasked(self, mask: SignalSet) -> Option<Signal> {
        let deliverable = self.0 & !mask.0;
        if deliverable == 0 {
            return None;
        }
        Signal::from_u32(deliverable.trailing_zeros() + 1)
    }

    /// Strip the stop-class signals (SIGCONT side effect).
    pub fn clear_stop_class(&mut self) {
        for sig in [
            Signal::SIGSTOP,
            Signal::SIGTSTP,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
        ] {
            self.remove(sig);
        }
    }

    /// Drop the unmaskable signals from a user-supplied mask.
    pub fn sanitized(self) -> SignalSet {
        let mut s = self;
        s.remove(Signal::SIGKILL);
        s.remove(Signal::SIGSTOP);
        s
    }
}

/// Queued signal payload record.
#[derive(Debug, Clone, Copy)]
pub struct KSigInfo {
    pub signo: u32,
    pub code: i32,
    pub sender: Tid,
    pub value: usize,
}

impl KSigInfo {
    pub fn new(sig: Signal, sender: Tid) -> Self {
        Self {
            signo: sig.to_u32(),
            code: 0,
            sender,
            value: 0,
        }
    }
}

/// Pending-signal state: the bit set plus queued ksiginfo records for
/// SA_SIGINFO dispositions.
pub struct SigPending {
    pub set: SignalSet,
    pub queue: VecDeque<KSigInfo>,
}

impl SigPending {
    pub const fn new() -> Self {
        Self {
            set: SignalSet::empty(),
            queue: VecDeque::new(),
        }
    }

    pub fn add(&mut self, sig: Signal) {
        self.set.add(sig);
    }

    pub fn enqueue_info(&mut self, info: KSigInfo) {
        if let Some(sig) = Signal::from_u32(info.signo) {
            self.set.add(sig);
            self.queue.push_back(info);
        }
    }

    /// Take one pending instance of `sig`, with its queued record if any.
    pub fn take(&mut self, sig: Signal) -> Option<KSigInfo> {
        if !self.set.contains(sig) {
            return None;
        }
        self.set.remove(sig);
        let pos = self.queue.iter().position(|i| i.signo == sig.to_u32());
        match pos {
            Some(i) => self.queue.remove(i),
            None => Some(KSigInfo::new(sig, 0)),
        }
    }

    pub fn clear_stop_class(&mut self) {
        self.set.clear_stop_class();
        self.queue.retain(|i| {
            Signal::from_u32(i.signo).map_or(false, |s| !s.is_stop_class())
        });
    }
}

pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        const SIGINFO = 0x0000_0004;
        const RESTART = 0x1000_0000;
        const NODEFER = 0x4000_0000;
    }
}

/// One registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigAction {
    pub handler: usize,
    pub mask: SignalSet,
    pub flags: SaFlags,
    pub restorer: usize,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SignalSet::empty(),
            flags: SaFlags::empty(),
            restorer: 0,
        }
    }
}

/// Signal action table, shared across CLONE_SIGHAND.
pub struct SigActions {
    actions: [SigAction; NSIG],
}

impl SigActions {
    pub fn new() -> Self {
        Self {
            actions: [SigAction::default(); NSIG],
        }
    }

    pub fn get(&self, sig: Signal) -> SigAction {
        self.actions[(sig.to_u32() - 1) as usize]
    }

    pub fn set(&mut self, sig: Signal, act: SigAction) {
        self.actions[(sig.to_u32() - 1) as usize] = act;
    }

    pub fn copy_from(&mut self, other: &SigActions) {
        self.actions = other.actions;
    }
}

/// How a signal will be treated by a thread right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ignore,
    Default(SigDefault),
    Handler(SigAction),
}

fn disposition_of(t: &Thread, sig: Signal) -> Disposition {
    if !sig.is_catchable() {
        return Disposition::Default(sig.default_action());
    }
    let act = t.sigacts.lock().get(sig);
    match act.handler {
        SIG_DFL => Disposition::Default(sig.default_action()),
        SIG_IGN => Disposition::Ignore,
        _ => Disposition::Handler(act),
    }
}

/// Send `info` to a specific thread.
pub fn signal_send(t: &Arc<Thread>, info: KSigInfo) -> Result<()> {
    let sig = Signal::from_u32(info.signo).ok_or(Errno::EINVAL)?;
    let disp = disposition_of(t, sig);

    // Dropped outright when ignored; kill/stop never are.
    if disp == Disposition::Ignore && !sig.is_fatal_class() {
        return Ok(());
    }

    let queue_info = matches!(disp, Disposition::Handler(a) if a.flags.contains(SaFlags::SIGINFO));

    let (wake, resume) = {
        let mut inner = t.inner();

        if sig == Signal::SIGCONT {
            inner.pending.clear_stop_class();
            t.group.inner.lock().shared_pending.clear_stop_class();
        }

        if sig == Signal::SIGKILL {
            t.set_flag(ThreadFlags::KILLED);
            // A kill overrides priority: get to the exit path quickly
            t.sched
                .set_priority(crate::sched::entity::make_priority(
                    crate::sched::entity::EXIT_MAJOR,
                    0,
                ));
        }

        if queue_info {
            inner.pending.enqueue_info(info);
        } else {
            inner.pending.add(sig);
        }
        t.set_flag(ThreadFlags::SIGPENDING);

        let masked = inner.sigmask.contains(sig) && sig.is_catchable();
        let state = t.state();
        let wake = !masked && state.signal_wakes(sig.is_fatal_class());
        let resume = state == ThreadState::Stopped
            && (sig == Signal::SIGCONT || sig == Signal::SIGKILL);
        (wake, resume)
    };

    if wake {
        crate::sched::wakeup_thread(t);
    }
    if resume {
        t.group.clear_stopped();
        crate::sched::resume_stopped(t);
    }
    Ok(())
}

/// Send a process-directed signal: queue on the group's shared pending set
/// and wake one eligible member. Ties break to the lowest tid.
pub fn tg_signal_send(
    table: &crate::process::pid::PidTable,
    tg: &Arc<crate::process::group::ThreadGroup>,
    info: KSigInfo,
) -> Result<()> {
    let sig = Signal::from_u32(info.signo).ok_or(Errno::EINVAL)?;
    let members = tg.members();

    {
        let mut gi = tg.inner.lock();
        gi.shared_pending.enqueue_info(info);
    }

    // Lowest-tid member that has the signal unmasked and is not exiting
    for tid in members {
        let t = match table.get(tid) {
            Some(t) => t,
            None => continue,
        };
        let state = t.state();
        if matches!(state, ThreadState::Exiting | ThreadState::Zombie) {
            continue;
        }
        let masked = t.inner().sigmask.contains(sig) && sig.is_catchable();
        if masked {
            continue;
        }
        t.set_flag(ThreadFlags::SIGPENDING);
        if state.signal_wakes(sig.is_fatal_class()) {
            crate::sched::wakeup_thread(t);
        }
        return Ok(());
    }
    Ok(())
}

/// Take the next deliverable signal for the current thread: per-thread
/// pending first, then the group's shared queue, lowest signal number
/// first.
fn dequeue_deliverable(t: &Arc<Thread>) -> Option<(Signal, KSigInfo)> {
    let mut inner = t.inner();
    let mask = inner.sigmask;

    if let Some(sig) = inner.pending.set.first_unmasked(mask) {
        let info = inner.pending.take(sig).unwrap_or(KSigInfo::new(sig, 0));
        return Some((sig, info));
    }

    let mut gi = t.group.inner.lock();
    if let Some(sig) = gi.shared_pending.set.first_unmasked(mask) {
        let info = gi.shared_pending.take(sig).unwrap_or(KSigInfo::new(sig, 0));
        return Some((sig, info));
    }
    drop(gi);

    t.clear_flag(ThreadFlags::SIGPENDING);
    None
}

/// Deliver pending signals at a safe point (return-to-user, post-sleep).
/// May stop the thread, run the group-exit path, or arrange a user handler
/// frame; returns when nothing deliverable remains.
pub fn deliver_pending() {
    let t = match crate::smp::current_thread() {
        Some(t) => t,
        None => return,
    };
    if t.is_idle() {
        return;
    }

    loop {
        let (sig, info) = match dequeue_deliverable(&t) {
            Some(x) => x,
            None => return,
        };

        let disp = disposition_of(&t, sig);
        match disp {
            Disposition::Ignore => continue,
            Disposition::Default(SigDefault::Ignore) => continue,
            Disposition::Default(SigDefault::Continue) => continue,
            Disposition::Default(SigDefault::Stop) => {
                t.group.inc_stopped();
                crate::sched::stop_current();
                // Resumed by SIGCONT; look again
                continue;
            }
            Disposition::Default(SigDefault::Terminate)
            | Disposition::Default(SigDefault::Core) => {
                crate::debug!(
                    "tid {} terminated by signal {}",
                    t.tid,
                    sig.to_u32()
                );
                crate::process::wait::do_exit_group(128 + sig.to_u32() as i32);
            }
            Disposition::Handler(act) => {
                let mut inner = t.inner();
                let (pc, sp) = match inner.trapframe.as_ref() {
                    Some(tf) => (tf.sepc, tf.regs[crate::arch::riscv64::REG_SP]),
                    None => {
                        // Kernel threads have no user frame to run a handler on
                        drop(inner);
                        crate::process::wait::do_exit_group(128 + sig.to_u32() as i32);
                    }
                };
                let frame = SignalFrame {
                    pc,
                    sp,
                    mask: inner.sigmask,
                };
                inner.signal_frames.push(frame);

                let mut new_mask = inner.sigmask.union(act.mask);
                if !act.flags.contains(SaFlags::NODEFER) {
                    new_mask.add(sig);
                }
                inner.sigmask = new_mask.sanitized();

                let tf = inner.trapframe.as_mut().unwrap();
                tf.sepc = act.handler;
                tf.regs[crate::arch::riscv64::REG_A0] = info.signo as usize;
                return;
            }
        }
    }
}

/// sigreturn: unwind the most recent handler frame.
pub fn sigreturn() -> Result<()> {
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let mut inner = t.inner();
    let frame = inner.signal_frames.pop().ok_or(Errno::EINVAL)?;
    inner.sigmask = frame.mask;
    let tf = inner.trapframe.as_mut().ok_or(Errno::EINVAL)?;
    tf.sepc = frame.pc;
    tf.regs[crate::arch::riscv64::REG_SP] = frame.sp;
    Ok(())
}

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// sigprocmask: returns the previous mask.
pub fn sigprocmask(how: i32, set: Option<SignalSet>) -> Result<SignalSet> {
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let mut inner = t.inner();
    let old = inner.sigmask;
    if let Some(set) = set {
        let set = set.sanitized();
        inner.sigmask = match how {
            SIG_BLOCK => SignalSet::from_bits(old.bits() | set.bits()),
            SIG_UNBLOCK => SignalSet::from_bits(old.bits() & !set.bits()),
            SIG_SETMASK => set,
            _ => return Err(Errno::EINVAL),
        };
    }
    Ok(old)
}

/// Pending signals visible to the caller (thread-private plus shared).
pub fn sigpending() -> Result<SignalSet> {
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let inner = t.inner();
    let shared = t.group.inner.lock().shared_pending.set;
    Ok(inner.pending.set.union(shared))
}

/// sigaction: install a new handler, returning the old one.
pub fn sigaction(signo: u32, new: Option<SigAction>) -> Result<SigAction> {
    let sig = Signal::from_u32(signo).ok_or(Errno::EINVAL)?;
    if !sig.is_catchable() && new.is_some() {
        return Err(Errno::EINVAL);
    }
    let t = crate::smp::current_thread().ok_or(Errno::ESRCH)?;
    let mut acts = t.sigacts.lock();
    let old = acts.get(sig);
    if let Some(mut act) = new {
        act.mask = act.mask.sanitized();
        acts.set(sig, act);
    }
    Ok(old)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_set_ops() {
        let mut s = SignalSet::empty();
        s.add(Signal::SIGTERM);
        s.add(Signal::SIGINT);
        assert!(s.contains(Signal::SIGTERM));
        assert_eq!(
            s.first_unmasked(SignalSet::empty()),
            Some(Signal::SIGINT)
        );
        let mut mask = SignalSet::empty();
        mask.add(Signal::SIGINT);
        assert_eq!(s.first_unmasked(mask), Some(Signal::SIGTERM));
        s.remove(Signal::SIGINT);
        assert!(!s.contains(Signal::SIGINT));
    }

    #[test]
    fn kill_and_stop_are_unmaskable() {
        let mut m = SignalSet::empty();
        m.add(Signal::SIGKILL);
        m.add(Signal::SIGSTOP);
        m.add(Signal::SIGUSR1);
        let m = m.sanitized();
        assert!(!m.contains(Signal::SIGKILL));
        assert!(!m.contains(Signal::SIGSTOP));
        assert!(m.contains(Signal::SIGUSR1));
    }

    #[test]
    fn default_actions_follow_posix() {
        assert_eq!(Signal::SIGCHLD.default_action(), SigDefault::Ignore);
        assert_eq!(Signal::SIGSEGV.default_action(), SigDefault::Core);
        assert_eq!(Signal::SIGSTOP.default_action(), SigDefault::Stop);
        assert_eq!(Signal::SIGCONT.default_action(), SigDefault::Continue);
        assert_eq!(Signal::SIGTERM.default_action(), SigDefault::Terminate);
        assert!(!Signal::SIGKILL.is_catchable());
        assert!(Signal::SIGSTOP.is_stop_class());
    }

    #[test]
    fn pending_queue_pairs_records_with_bits() {
        let mut p = SigPending::new();
        p.enqueue_info(KSigInfo {
            signo: Signal::SIGUSR1.to_u32(),
            code: 1,
            sender: 42,
            value: 7,
        });
        assert!(p.set.contains(Signal::SIGUSR1));
        let info = p.take(Signal::SIGUSR1).unwrap();
        assert_eq!(info.sender, 42);
        assert_eq!(info.value, 7);
        assert!(p.take(Signal::SIGUSR1).is_none());
    }

    #[test]
    fn cont_clears_pending_stops() {
        let mut p = SigPending::new();
        p.add(Signal::SIGSTOP);
        p.add(Signal::SIGTSTP);
        p.add(Signal::SIGUSR2);
        p.clear_stop_class();
        assert!(!p.set.contains(Signal::SIGSTOP));
        assert!(!p.set.contains(Signal::SIGTSTP));
        assert!(p.set.contains(Signal::SIGUSR2));
    }

    #[test]
    fn send_to_sleeping_thread_marks_pending() {
        let t = crate::process::pid::test_support::bare_thread(600);
        t.set_state(ThreadState::Interruptible);
        signal_send(&t, KSigInfo::new(Signal::SIGTERM, 0)).unwrap();
        assert!(t.has_flag(ThreadFlags::SIGPENDING));
        assert!(t.inner().pending.set.contains(Signal::SIGTERM));
    }

    #[test]
    fn ignored_signal_is_dropped() {
        let t = crate::process::pid::test_support::bare_thread(601);
        // SIGCHLD default-ignores
        signal_send(&t, KSigInfo::new(Signal::SIGCHLD, 0)).unwrap();
        assert!(!t.inner().pending.set.contains(Signal::SIGCHLD));
    }

    #[test]
    fn kill_sets_killed_flag() {
        let t = crate::process::pid::test_support::bare_thread(602);
        signal_send(&t, KSigInfo::new(Signal::SIGKILL, 0)).unwrap();
        assert!(t.killed());
        assert!(t.inner().pending.set.contains(Signal::SIGKILL));
    }
}
