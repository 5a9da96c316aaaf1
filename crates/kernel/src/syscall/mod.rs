//! System call surface relevant to the core.
//!
//! The trap plumbing and user-memory copies are the external dispatch
//! layer's concern; these are the typed kernel entry points it calls, plus
//! a numeric dispatcher following the return convention (non-negative
//! result or negated errno).

use crate::klib::error::{Errno, Result};
use crate::process::signal::{self, KSigInfo, Signal, SignalSet};
use crate::process::task::ThreadState;
use crate::process::{self, CloneArgs};
use crate::sched;

pub const SYS_EXIT: usize = 1;
pub const SYS_EXIT_GROUP: usize = 2;
pub const SYS_GETPID: usize = 3;
pub const SYS_GETTID: usize = 4;
pub const SYS_CLONE: usize = 5;
pub const SYS_VFORK: usize = 6;
pub const SYS_WAIT: usize = 7;
pub const SYS_SBRK: usize = 8;
pub const SYS_SLEEP: usize = 9;
pub const SYS_UPTIME: usize = 10;
pub const SYS_TGKILL: usize = 11;
pub const SYS_SIGACTION: usize = 12;
pub const SYS_SIGPROCMASK: usize = 13;
pub const SYS_SIGPENDING: usize = 14;
pub const SYS_SIGRETURN: usize = 15;
pub const SYS_SCHED_SETATTR: usize = 16;
pub const SYS_SCHED_GETATTR: usize = 17;

pub fn sys_exit(code: i32) -> ! {
    process::do_exit(code)
}

pub fn sys_exit_group(code: i32) -> ! {
    process::do_exit_group(code)
}

pub fn sys_getpid() -> Result<u32> {
    let t = process::current().ok_or(Errno::ESRCH)?;
    Ok(t.tgid)
}

pub fn sys_gettid() -> Result<u32> {
    let t = process::current().ok_or(Errno::ESRCH)?;
    Ok(t.tid)
}

pub fn sys_clone(args: &CloneArgs) -> Result<u32> {
    process::do_clone(args)
}

pub fn sys_vfork() -> Result<u32> {
    process::do_vfork()
}

pub fn sys_wait(pid: i32, options: i32) -> Result<(u32, i32)> {
    process::do_wait(pid, options)
}

/// Adjust the program break; the mapping work belongs to the external VM,
/// the core keeps the bookkeeping per thread group.
pub fn sys_sbrk(increment: i64) -> Result<u64> {
    let t = process::current().ok_or(Errno::ESRCH)?;
    let old = t.group.brk.load(core::sync::atomic::Ordering::SeqCst);
    let new = if increment >= 0 {
        old.checked_add(increment as u64).ok_or(Errno::ENOMEM)?
    } else {
        old.checked_sub(increment.unsigned_abs()).ok_or(Errno::EINVAL)?
    };
    t.group.brk.store(new, core::sync::atomic::Ordering::SeqCst);
    Ok(old)
}

pub fn sys_sleep(ms: u64) -> Result<()> {
    sched::sleep_ms(ms)
}

pub fn sys_uptime() -> u64 {
    sched::timer::uptime_ms()
}

/// Send `sig` to thread `tid` of group `tgid`.
pub fn sys_tgkill(tgid: u32, tid: u32, sig: u32) -> Result<()> {
    let target = process::lookup(tid).ok_or(Errno::ESRCH)?;
    if target.tgid != tgid {
        return Err(Errno::ESRCH);
    }
    if matches!(target.state(), ThreadState::Zombie | ThreadState::Unused) {
        return Err(Errno::ESRCH);
    }
    Signal::from_u32(sig).ok_or(Errno::EINVAL)?;
    let sender = process::current().map_or(0, |t| t.tid);
    signal::signal_send(&target, KSigInfo {
        signo: sig,
        code: 0,
        sender,
        value: 0,
    })
}

/// Send a process-directed signal to a whole group.
pub fn sys_kill_group(tgid: u32, sig: u32) -> Result<()> {
    Signal::from_u32(sig).ok_or(Errno::EINVAL)?;
    let sender = process::current().map_or(0, |t| t.tid);
    let table = process::pid::table().read();
    let leader = table.get(tgid).ok_or(Errno::ESRCH)?.clone();
    signal::tg_signal_send(&table, &leader.group, KSigInfo {
        signo: sig,
        code: 0,
        sender,
        value: 0,
    })
}

pub fn sys_sigaction(signo: u32, new: Option<signal::SigAction>) -> Result<signal::SigAction> {
    signal::sigaction(signo, new)
}

pub fn sys_sigprocmask(how: i32, set: Option<u64>) -> Result<u64> {
    let old = signal::sigprocmask(how, set.map(SignalSet::from_bits))?;
    Ok(old.bits())
}

pub fn sys_sigpending() -> Result<u64> {
    Ok(signal::sigpending()?.bits())
}

pub fn sys_sigreturn() -> Result<()> {
    signal::sigreturn()
}

pub fn sys_sched_setattr(tid: u32, priority: u8, affinity: usize) -> Result<()> {
    let target = process::lookup(tid).ok_or(Errno::ESRCH)?;
    sched::sched_setattr(&target, sched::SchedAttr { priority, affinity })
}

pub fn sys_sched_getattr(tid: u32) -> Result<(u8, usize)> {
    let target = process::lookup(tid).ok_or(Errno::ESRCH)?;
    let attr = sched::sched_getattr(&target);
    Ok((attr.priority, attr.affinity))
}

fn ret<T: Into<isize>>(r: Result<T>) -> isize {
    match r {
        Ok(v) => v.into(),
        Err(e) => e.as_isize(),
    }
}

/// Numeric dispatcher for the external trap layer. Pointer-carrying calls
/// (clone, sigaction) go through the typed entry points instead.
pub fn dispatch(num: usize, a0: usize, a1: usize, a2: usize) -> isize {
    match num {
        SYS_EXIT => sys_exit(a0 as i32),
        SYS_EXIT_GROUP => sys_exit_group(a0 as i32),
        SYS_GETPID => ret(sys_getpid().map(|v| v as isize)),
        SYS_GETTID => ret(sys_gettid().map(|v| v as isize)),
        SYS_VFORK => ret(sys_vfork().map(|v| v as isize)),
        SYS_WAIT => match sys_wait(a0 as i32, a1 as i32) {
            Ok((pid, _status)) => pid as isize,
            Err(e) => e.as_isize(),
        },
        SYS_SBRK => match sys_sbrk(a0 as i64) {
            Ok(old) => old as isize,
            Err(e) => e.as_isize(),
        },
        SYS_SLEEP => ret(sys_sleep(a0 as u64).map(|_| 0isize)),
        SYS_UPTIME => sys_uptime() as isize,
        SYS_TGKILL => ret(sys_tgkill(a0 as u32, a1 as u32, a2 as u32).map(|_| 0isize)),
        SYS_SIGPROCMASK => match sys_sigprocmask(a0 as i32, Some(a1 as u64)) {
            Ok(old) => old as isize,
            Err(e) => e.as_isize(),
        },
        SYS_SIGPENDING => match sys_sigpending() {
            Ok(set) => set as isize,
            Err(e) => e.as_isize(),
        },
        SYS_SIGRETURN => ret(sys_sigreturn().map(|_| 0isize)),
        SYS_SCHED_SETATTR => {
            ret(sys_sched_setattr(a0 as u32, a1 as u8, a2).map(|_| 0isize))
        }
        SYS_SCHED_GETATTR => match sys_sched_getattr(a0 as u32) {
            Ok((prio, _)) => prio as isize,
            Err(e) => e.as_isize(),
        },
        _ => Errno::ENOSYS.as_isize(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_is_enosys() {
        assert_eq!(dispatch(9999, 0, 0, 0), Errno::ENOSYS.as_isize());
    }

    #[test]
    fn uptime_reports_milliseconds() {
        let up = sys_uptime();
        assert_eq!(up, sched::timer::uptime_ms());
    }

    #[test]
    fn no_current_thread_is_esrch() {
        // Hosted test CPUs have no current thread installed
        assert_eq!(sys_getpid(), Err(Errno::ESRCH));
        assert_eq!(sys_gettid(), Err(Errno::ESRCH));
    }

    #[test]
    fn tgkill_validates_target() {
        assert_eq!(sys_tgkill(1, 424242, 15), Err(Errno::ESRCH));
    }
}
