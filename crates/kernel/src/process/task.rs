/// Thread control block
///
/// One `Thread` per schedulable context. The state word is atomic and its
/// compound transitions are serialized by the surrounding locks (tcb lock
/// for sleep entry, PI lock for wakeups, rq lock for the pick); everything
/// else mutable lives behind the tcb spinlock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::arch::TrapFrame;
use crate::klib::error::Errno;
use crate::mm::{self, PageKind, PhysAddr, PAGE_SIZE};
use crate::process::group::ThreadGroup;
use crate::process::signal::{SigActions, SigPending, SignalSet};
use crate::sched::entity::SchedEntity;
use crate::sync::{SpinLock, SpinLockGuard};

pub type Tid = u32;

/// Kernel stack order: 2^2 pages = 16 KiB
pub const KSTACK_ORDER: u8 = 2;

/// Thread states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused = 0,
    Used,
    Running,
    Interruptible,
    Uninterruptible,
    Killable,
    Timer,
    KillableTimer,
    Wakening,
    Stopped,
    Exiting,
    Zombie,
}

impl ThreadState {
    pub fn from_u8(v: u8) -> ThreadState {
        match v {
            1 => ThreadState::Used,
            2 => ThreadState::Running,
            3 => ThreadState::Interruptible,
            4 => ThreadState::Uninterruptible,
            5 => ThreadState::Killable,
            6 => ThreadState::Timer,
            7 => ThreadState::KillableTimer,
            8 => ThreadState::Wakening,
            9 => ThreadState::Stopped,
            10 => ThreadState::Exiting,
            11 => ThreadState::Zombie,
            _ => ThreadState::Unused,
        }
    }

    /// States a plain wakeup may lift into `Wakening`.
    pub fn is_sleeping(self) -> bool {
        matches!(
            self,
            ThreadState::Interruptible
                | ThreadState::Uninterruptible
                | ThreadState::Killable
                | ThreadState::Timer
                | ThreadState::KillableTimer
        )
    }

    /// May an arriving signal wake a thread sleeping in this state?
    /// `Killable` variants react only to the kill/stop class.
    pub fn signal_wakes(self, fatal: bool) -> bool {
        match self {
            ThreadState::Interruptible => true,
            ThreadState::Killable | ThreadState::KillableTimer => fatal,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Unused => "unused",
            ThreadState::Used => "used",
            ThreadState::Running => "running",
            ThreadState::Interruptible => "sleep",
            ThreadState::Uninterruptible => "sleep!",
            ThreadState::Killable => "sleepk",
            ThreadState::Timer => "timer",
            ThreadState::KillableTimer => "timerk",
            ThreadState::Wakening => "waking",
            ThreadState::Stopped => "stopped",
            ThreadState::Exiting => "exiting",
            ThreadState::Zombie => "zombie",
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Has a user-space half (trap frame is live)
        const USER_SPACE = 1 << 0;
        /// A fatal signal has been accepted; unwind at the next safe point
        const KILLED = 1 << 1;
        /// Parked on a wait channel
        const ONCHAN = 1 << 2;
        /// Unmasked pending signal awaits delivery
        const SIGPENDING = 1 << 3;
        /// Fully constructed and visible in the PID table
        const VALID = 1 << 4;
        /// Reaps itself on exit instead of waiting for the parent
        const SELF_REAP = 1 << 5;
    }
}

/// Kernel stack descriptor. `base == 0` means the thread adopted a boot
/// stack that is never freed.
#[derive(Debug, Clone, Copy)]
pub struct KernelStack {
    pub base: PhysAddr,
    pub order: u8,
}

impl KernelStack {
    pub fn alloc() -> Result<KernelStack, Errno> {
        let base = mm::alloc_pages(KSTACK_ORDER, PageKind::Anon).ok_or(Errno::ENOMEM)?;
        Ok(KernelStack {
            base,
            order: KSTACK_ORDER,
        })
    }

    pub const fn adopted() -> KernelStack {
        KernelStack { base: 0, order: 0 }
    }

    pub fn top(&self) -> usize {
        self.base as usize + (PAGE_SIZE << self.order)
    }
}

/// Opaque token the external VFS uses to identify an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub u64);

/// File-descriptor table; contents belong to the external VFS layer, the
/// core only manages slots and sharing.
#[derive(Debug)]
pub struct FdTable {
    fds: Vec<Option<FileHandle>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            fds: alloc::vec![None; 64],
        }
    }

    pub fn alloc_fd(&mut self, file: FileHandle) -> Result<i32, Errno> {
        for (i, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    pub fn get(&self, fd: i32) -> Result<FileHandle, Errno> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(Errno::EBADF);
        }
        self.fds[fd as usize].ok_or(Errno::EBADF)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        if fd < 0 || fd as usize >= self.fds.len() || self.fds[fd as usize].is_none() {
            return Err(Errno::EBADF);
        }
        self.fds[fd as usize] = None;
        Ok(())
    }

    pub fn dup(&mut self, oldfd: i32) -> Result<i32, Errno> {
        let file = self.get(oldfd)?;
        self.alloc_fd(file)
    }

    pub fn clone_table(&self) -> FdTable {
        FdTable {
            fds: self.fds.clone(),
        }
    }
}

/// Filesystem state shared or copied across clone.
#[derive(Debug, Clone)]
pub struct FsState {
    pub cwd: String,
}

impl FsState {
    pub fn new() -> Self {
        Self {
            cwd: String::from("/"),
        }
    }
}

/// Record pushed when a user signal handler is dispatched and popped by
/// sigreturn.
#[derive(Debug, Clone, Copy)]
pub struct SignalFrame {
    pub pc: usize,
    pub sp: usize,
    pub mask: SignalSet,
}

/// The tcb-lock-protected portion of a thread.
pub struct ThreadInner {
    pub name: String,
    /// Wait channel key while parked
    pub chan: usize,
    pub parent: Tid,
    pub children: Vec<Tid>,
    pub exit_code: i32,
    pub pgid: Tid,
    pub sid: Tid,
    pub pending: SigPending,
    pub sigmask: SignalSet,
    pub signal_frames: Vec<SignalFrame>,
    pub trapframe: Option<Box<TrapFrame>>,
    /// Kernel-thread entry, consumed on first run
    pub entry: Option<(fn(usize), usize)>,
    pub set_child_tid: usize,
    pub clear_child_tid: usize,
}

pub struct Thread {
    pub tid: Tid,
    pub tgid: Tid,
    state: AtomicU8,
    flags: AtomicU32,
    pub kstack: KernelStack,
    pub sched: SchedEntity,
    pub sigacts: Arc<SpinLock<SigActions>>,
    pub group: Arc<ThreadGroup>,
    pub fs: Arc<SpinLock<FsState>>,
    pub files: Arc<SpinLock<FdTable>>,
    pub rcu_nesting: AtomicU32,
    /// Signal sent to the parent on exit (SIGCHLD unless clone overrode it)
    pub exit_signal: u8,
    inner: SpinLock<ThreadInner>,
}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tid: Tid,
        name: &str,
        group: Arc<ThreadGroup>,
        sigacts: Arc<SpinLock<SigActions>>,
        fs: Arc<SpinLock<FsState>>,
        files: Arc<SpinLock<FdTable>>,
        kstack: KernelStack,
        priority: u8,
        exit_signal: u8,
    ) -> Thread {
        let tgid = group.tgid;
        let t = Thread {
            tid,
            tgid,
            state: AtomicU8::new(ThreadState::Used as u8),
            flags: AtomicU32::new(ThreadFlags::VALID.bits()),
            kstack,
            sched: SchedEntity::new(priority),
            sigacts,
            group,
            fs,
            files,
            rcu_nesting: AtomicU32::new(0),
            exit_signal,
            inner: SpinLock::new("tcb", ThreadInner {
                name: String::from(name),
                chan: 0,
                parent: 0,
                children: Vec::new(),
                exit_code: 0,
                pgid: tgid,
                sid: tgid,
                pending: SigPending::new(),
                sigmask: SignalSet::empty(),
                signal_frames: Vec::new(),
                trapframe: None,
                entry: None,
                set_child_tid: 0,
                clear_child_tid: 0,
            }),
        };
        // Newly spawned, not yet on a run queue
        t.set_state(ThreadState::Uninterruptible);
        t
    }

    /// Per-CPU idle threads run on the hart's boot stack and never appear
    /// in the PID table.
    pub fn new_idle(cpu: usize) -> Arc<Thread> {
        let group = ThreadGroup::new(0);
        let t = Thread::new(
            0,
            "idle",
            group,
            Arc::new(SpinLock::new("sigacts", SigActions::new())),
            Arc::new(SpinLock::new("fs", FsState::new())),
            Arc::new(SpinLock::new("fdtable", FdTable::new())),
            KernelStack::adopted(),
            crate::sched::entity::IDLE_PRIORITY,
            0,
        );
        t.sched.set_affinity(1 << cpu);
        t.sched.set_cpu(cpu);
        Arc::new(t)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flag(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    pub fn has_flag(&self, f: ThreadFlags) -> bool {
        self.flags().contains(f)
    }

    pub fn killed(&self) -> bool {
        self.has_flag(ThreadFlags::KILLED)
    }

    pub fn is_idle(&self) -> bool {
        self.tid == 0
    }

    pub fn inner(&self) -> SpinLockGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_chan(&self, chan: usize) {
        self.inner.lock().chan = chan;
        self.set_flag(ThreadFlags::ONCHAN);
    }

    pub fn clear_chan(&self) {
        self.inner.lock().chan = 0;
        self.clear_flag(ThreadFlags::ONCHAN);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("tgid", &self.tgid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeping_state_classification() {
        assert!(ThreadState::Interruptible.is_sleeping());
        assert!(ThreadState::KillableTimer.is_sleeping());
        assert!(!ThreadState::Running.is_sleeping());
        assert!(!ThreadState::Zombie.is_sleeping());
        assert!(!ThreadState::Wakening.is_sleeping());
    }

    #[test]
    fn killable_only_wakes_for_fatal_signals() {
        assert!(ThreadState::Interruptible.signal_wakes(false));
        assert!(!ThreadState::Killable.signal_wakes(false));
        assert!(ThreadState::Killable.signal_wakes(true));
        assert!(!ThreadState::Uninterruptible.signal_wakes(true));
    }

    #[test]
    fn fd_table_alloc_close_dup() {
        let mut t = FdTable::new();
        let fd = t.alloc_fd(FileHandle(7)).unwrap();
        assert_eq!(fd, 0);
        let fd2 = t.dup(fd).unwrap();
        assert_eq!(fd2, 1);
        assert_eq!(t.get(fd2).unwrap(), FileHandle(7));
        t.close(fd).unwrap();
        assert_eq!(t.get(fd), Err(Errno::EBADF));
        // Slot is reused
        assert_eq!(t.alloc_fd(FileHandle(9)).unwrap(), 0);
    }

    #[test]
    fn flags_set_and_clear() {
        let idle = Thread::new_idle(0);
        assert!(idle.has_flag(ThreadFlags::VALID));
        idle.set_flag(ThreadFlags::KILLED);
        assert!(idle.killed());
        idle.clear_flag(ThreadFlags::KILLED);
        assert!(!idle.killed());
    }
}
