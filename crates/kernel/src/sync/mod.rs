//! Synchronization primitives.
//!
//! System-wide lock ordering (outermost first):
//!
//! ```text
//! pid_lock > sigacts.lock > channel table > tcb.lock > pi.lock >
//! rq.lock > slab cache/queue locks > slab.lock > buddy_pool[k].lock (k ascending)
//! ```
//!
//! Sleeping locks (SleepLock, RwLock) must never be acquired while any
//! spinlock is held.

pub mod channel;
pub mod rcu;
pub mod rwlock;
pub mod sleeplock;
pub mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
