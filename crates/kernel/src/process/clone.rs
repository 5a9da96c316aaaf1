/// Thread creation: clone, vfork, and kernel-thread spawn.

use alloc::sync::Arc;

use crate::klib::error::{Errno, Result};
use crate::process::group::ThreadGroup;
use crate::process::pid::{self, INIT_TID};
use crate::process::signal::SigActions;
use crate::process::task::{
    FdTable, FsState, KernelStack, Thread, ThreadFlags, ThreadState,
};
use crate::process::wait::WAIT_LOCK;
use crate::sync::channel::{self, chan_vfork};
use crate::sync::SpinLock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const VM              = 0x0000_0100;
        const FS              = 0x0000_0200;
        const FILES           = 0x0000_0400;
        const SIGHAND         = 0x0000_0800;
        const VFORK           = 0x0000_4000;
        const THREAD          = 0x0001_0000;
        const PARENT_SETTID   = 0x0010_0000;
        const CHILD_CLEARTID  = 0x0020_0000;
    }
}

/// Argument block for clone, mirroring the syscall ABI.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneArgs {
    pub flags: u64,
    pub stack: usize,
    pub stack_size: usize,
    pub entry: usize,
    pub esignal: u32,
    pub tls: usize,
    pub ctid: usize,
    pub ptid: usize,
}

impl CloneArgs {
    pub fn flags(&self) -> CloneFlags {
        CloneFlags::from_bits_truncate(self.flags)
    }

    /// Exit signal: explicit field, else the low 8 flag bits.
    pub fn exit_signal(&self) -> u8 {
        if self.esignal != 0 {
            self.esignal as u8
        } else {
            (self.flags & 0xff) as u8
        }
    }
}

/// Create a new thread in (or beside) the caller's thread group.
/// Returns the child's tid.
pub fn do_clone(args: &CloneArgs) -> Result<u32> {
    let flags = args.flags();

    // A thread-group sibling must share signal handlers and address space
    if flags.contains(CloneFlags::THREAD)
        && !(flags.contains(CloneFlags::SIGHAND) && flags.contains(CloneFlags::VM))
    {
        return Err(Errno::EINVAL);
    }

    let parent = crate::smp::current_thread().ok_or(Errno::ESRCH)?;

    let kstack = KernelStack::alloc()?;

    let tid = {
        let mut table = pid::table().write();
        table.alloc_tid().map_err(Errno::from)?
    };

    let group = if flags.contains(CloneFlags::THREAD) {
        parent.group.add(tid);
        parent.group.clone()
    } else {
        ThreadGroup::new(tid)
    };

    let sigacts = if flags.contains(CloneFlags::SIGHAND) {
        parent.sigacts.clone()
    } else {
        let mut copy = SigActions::new();
        copy.copy_from(&parent.sigacts.lock());
        Arc::new(SpinLock::new("sigacts", copy))
    };

    let fs = if flags.contains(CloneFlags::FS) {
        parent.fs.clone()
    } else {
        Arc::new(SpinLock::new("fs", parent.fs.lock().clone()))
    };

    let files = if flags.contains(CloneFlags::FILES) {
        parent.files.clone()
    } else {
        Arc::new(SpinLock::new("fdtable", parent.files.lock().clone_table()))
    };

    let name = parent.name();
    let child = Arc::new(Thread::new(
        tid,
        &name,
        group,
        sigacts,
        fs,
        files,
        kstack,
        parent.sched.priority(),
        args.exit_signal(),
    ));
    child.sched.set_affinity(parent.sched.affinity());

    {
        let mut ci = child.inner();
        let pi = parent.inner();
        ci.pgid = pi.pgid;
        ci.sid = pi.sid;
        ci.sigmask = pi.sigmask;
        ci.set_child_tid = if flags.contains(CloneFlags::PARENT_SETTID) {
            args.ptid
        } else {
            0
        };
        ci.clear_child_tid = if flags.contains(CloneFlags::CHILD_CLEARTID) {
            args.ctid
        } else {
            0
        };
        // The child resumes from a copy of the parent's trap frame with a
        // zero return value; a fresh stack/entry overrides the frame.
        if let Some(tf) = pi.trapframe.as_ref() {
            let mut tf = (**tf).clone();
            tf.regs[crate::arch::riscv64::REG_A0] = 0;
            if args.stack != 0 {
                tf.regs[crate::arch::riscv64::REG_SP] = args.stack + args.stack_size;
            }
            if args.entry != 0 {
                tf.sepc = args.entry;
            }
            if args.tls != 0 {
                tf.regs[crate::arch::riscv64::REG_TP] = args.tls;
            }
            ci.trapframe = Some(alloc::boxed::Box::new(tf));
            child.set_flag(ThreadFlags::USER_SPACE);
        } else if args.entry != 0 {
            // A kernel caller clones a kernel sibling: entry is a kernel
            // function, tls its argument
            let f: fn(usize) = unsafe { core::mem::transmute(args.entry) };
            ci.entry = Some((f, args.tls));
            child.set_flag(ThreadFlags::SELF_REAP);
        }
        drop(pi);
        drop(ci);
    }

    crate::sched::prepare_first_run(&child);

    {
        let mut table = pid::table().write();
        child.inner().parent = parent.tid;
        parent.inner().children.push(tid);
        table.insert(child.clone());
    }

    crate::sched::class_for_thread(&child).task_fork(&child);
    crate::sched::wakeup_thread(&child);
    crate::debug!("clone: tid {} -> child {}", parent.tid, tid);

    if flags.contains(CloneFlags::VFORK) {
        // Block until this exact child exits (exec is the external VM's
        // concern and also completes the wait there).
        loop {
            let wl = WAIT_LOCK.lock();
            if child.state() == ThreadState::Zombie {
                drop(wl);
                break;
            }
            drop(channel::sleep_on(
                chan_vfork(tid),
                wl,
                ThreadState::Uninterruptible,
            ));
        }
    }

    Ok(tid)
}

/// vfork: a child that borrows the parent's address space until it exits.
pub fn do_vfork() -> Result<u32> {
    do_clone(&CloneArgs {
        flags: (CloneFlags::VM | CloneFlags::VFORK).bits(),
        ..CloneArgs::default()
    })
}

/// Build a kernel thread without starting it, so the caller may pin or
/// reprioritize before the first enqueue.
pub fn kthread_create(
    name: &str,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<Arc<Thread>> {
    let kstack = KernelStack::alloc()?;
    let tid = {
        let mut table = pid::table().write();
        table.alloc_tid().map_err(Errno::from)?
    };

    let group = ThreadGroup::new(tid);
    let child = Arc::new(Thread::new(
        tid,
        name,
        group,
        Arc::new(SpinLock::new("sigacts", SigActions::new())),
        Arc::new(SpinLock::new("fs", FsState::new())),
        Arc::new(SpinLock::new("fdtable", FdTable::new())),
        kstack,
        priority,
        0,
    ));
    // Kernel threads self-reap; nobody waits for them
    child.set_flag(ThreadFlags::SELF_REAP);

    {
        let mut ci = child.inner();
        ci.entry = Some((entry, arg));
        ci.parent = INIT_TID;
    }
    crate::sched::prepare_first_run(&child);

    {
        let mut table = pid::table().write();
        table.insert(child.clone());
        if tid != INIT_TID {
            if let Some(init) = table.get(INIT_TID) {
                init.inner().children.push(tid);
            }
        }
    }
    Ok(child)
}

/// Spawn a kernel thread running `entry(arg)`.
pub fn kthread_spawn(
    name: &str,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<Arc<Thread>> {
    let child = kthread_create(name, entry, arg, priority)?;
    crate::sched::wakeup_thread(&child);
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_signal_comes_from_low_flag_bits() {
        let args = CloneArgs {
            flags: 17, // SIGCHLD in the low byte
            ..CloneArgs::default()
        };
        assert_eq!(args.exit_signal(), 17);

        let args = CloneArgs {
            flags: 17,
            esignal: 10,
            ..CloneArgs::default()
        };
        assert_eq!(args.exit_signal(), 10);
    }

    #[test]
    fn clone_thread_requires_shared_handlers_and_vm() {
        let args = CloneArgs {
            flags: CloneFlags::THREAD.bits(),
            ..CloneArgs::default()
        };
        // No current thread on the hosted test CPU either way, but flag
        // validation fires first
        assert!(matches!(do_clone(&args), Err(Errno::EINVAL) | Err(Errno::ESRCH)));
    }

    #[test]
    fn flag_decoding_matches_linux_values() {
        let f = CloneFlags::from_bits_truncate(0x0001_0100);
        assert!(f.contains(CloneFlags::THREAD));
        assert!(f.contains(CloneFlags::VM));
        assert!(!f.contains(CloneFlags::VFORK));
    }
}
