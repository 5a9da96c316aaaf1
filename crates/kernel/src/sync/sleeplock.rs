//! Sleep-lock: a blocking mutex built on a spinlock and a wait channel.
//!
//! Long-held locks (buffer contents, device state) use this instead of
//! spinning; the holder may block while it owns the lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::channel;
use super::spinlock::SpinLock;
use crate::process::task::{ThreadState, Tid};

struct SleepLockState {
    locked: bool,
    owner: Tid,
}

pub struct SleepLock<T: ?Sized> {
    name: &'static str,
    state: SpinLock<SleepLockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            state: SpinLock::new("sleeplock.state", SleepLockState {
                locked: false,
                owner: 0,
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn chan(&self) -> usize {
        channel::chan_addr(&self.state as *const _)
    }

    pub fn acquire(&self) -> SleepLockGuard<'_, T> {
        let me = crate::smp::with_current(|t| t.map_or(0, |t| t.tid));
        let mut st = self.state.lock();
        while st.locked {
            assert!(
                !(me != 0 && st.owner == me),
                "sleeplock {}: recursive acquire",
                self.name
            );
            st = channel::sleep_on(self.chan(), st, ThreadState::Uninterruptible);
        }
        st.locked = true;
        st.owner = me;
        drop(st);
        SleepLockGuard { lock: self }
    }

    pub fn try_acquire(&self) -> Option<SleepLockGuard<'_, T>> {
        let me = crate::smp::with_current(|t| t.map_or(0, |t| t.tid));
        let mut st = self.state.lock();
        if st.locked {
            return None;
        }
        st.locked = true;
        st.owner = me;
        drop(st);
        Some(SleepLockGuard { lock: self })
    }

    /// Does the current thread hold this lock?
    pub fn holding(&self) -> bool {
        let me = crate::smp::with_current(|t| t.map_or(0, |t| t.tid));
        let st = self.state.lock();
        st.locked && me != 0 && st.owner == me
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock();
        st.locked = false;
        st.owner = 0;
        drop(st);
        // Hand the lock to the oldest waiter
        channel::wakeup_one(self.lock.chan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_release() {
        let lk = SleepLock::new("t", 5u32);
        {
            let mut g = lk.acquire();
            *g = 6;
        }
        assert_eq!(*lk.acquire(), 6);
    }

    #[test]
    fn try_acquire_respects_holder() {
        let lk = SleepLock::new("t", ());
        let g = lk.acquire();
        assert!(lk.try_acquire().is_none());
        drop(g);
        assert!(lk.try_acquire().is_some());
    }
}
