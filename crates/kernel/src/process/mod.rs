/// Process management: thread control blocks, thread groups, PIDs,
/// signals, clone and wait.

pub mod clone;
pub mod group;
pub mod pid;
pub mod signal;
pub mod task;
pub mod wait;

pub use clone::{do_clone, do_vfork, kthread_create, kthread_spawn, CloneArgs, CloneFlags};
pub use group::ThreadGroup;
pub use pid::{lookup, INIT_TID};
pub use task::{Thread, ThreadFlags, ThreadState, Tid};
pub use wait::{do_exit, do_exit_group, do_wait, WNOHANG};

/// The thread running on the calling CPU.
pub fn current() -> Option<alloc::sync::Arc<Thread>> {
    crate::smp::current_thread()
}
