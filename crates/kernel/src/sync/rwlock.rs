//! Blocking reader-writer lock with writer preference.
//!
//! Many concurrent readers or exactly one writer. Once a writer is waiting,
//! new readers queue behind it so a stream of readers cannot starve it.
//! Release determines the caller's role from the lock state and wakes the
//! next writer, or all waiting readers when no writer is queued.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::channel;
use super::spinlock::SpinLock;
use crate::process::task::ThreadState;

#[derive(Debug)]
struct RwState {
    active_readers: u32,
    writer_active: bool,
    waiting_readers: u32,
    waiting_writers: u32,
}

pub struct RwLock<T: ?Sized> {
    state: SpinLock<RwState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: SpinLock::new("rwlock.state", RwState {
                active_readers: 0,
                writer_active: false,
                waiting_readers: 0,
                waiting_writers: 0,
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    fn read_chan(&self) -> usize {
        channel::chan_addr(&self.state as *const _)
    }

    fn write_chan(&self) -> usize {
        channel::chan_addr(&self.state as *const _) | 0b01
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut st = self.state.lock();
        while st.writer_active || st.waiting_writers > 0 {
            st.waiting_readers += 1;
            st = channel::sleep_on(self.read_chan(), st, ThreadState::Uninterruptible);
            st.waiting_readers -= 1;
        }
        st.active_readers += 1;
        drop(st);
        RwLockReadGuard { lock: self }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut st = self.state.lock();
        while st.writer_active || st.active_readers > 0 {
            st.waiting_writers += 1;
            st = channel::sleep_on(self.write_chan(), st, ThreadState::Uninterruptible);
            st.waiting_writers -= 1;
        }
        st.writer_active = true;
        drop(st);
        RwLockWriteGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.writer_active || st.waiting_writers > 0 {
            return None;
        }
        st.active_readers += 1;
        drop(st);
        Some(RwLockReadGuard { lock: self })
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.writer_active || st.active_readers > 0 {
            return None;
        }
        st.writer_active = true;
        drop(st);
        Some(RwLockWriteGuard { lock: self })
    }

    /// (active readers, writer active, waiting readers, waiting writers)
    pub fn state_snapshot(&self) -> (u32, bool, u32, u32) {
        let st = self.state.lock();
        (
            st.active_readers,
            st.writer_active,
            st.waiting_readers,
            st.waiting_writers,
        )
    }
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock();
        st.active_readers -= 1;
        let wake_writer = st.active_readers == 0 && st.waiting_writers > 0;
        drop(st);
        if wake_writer {
            channel::wakeup_one(self.lock.write_chan());
        }
    }
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock();
        st.writer_active = false;
        let wake_writer = st.waiting_writers > 0;
        let wake_readers = !wake_writer && st.waiting_readers > 0;
        drop(st);
        if wake_writer {
            channel::wakeup_one(self.lock.write_chan());
        } else if wake_readers {
            channel::wakeup(self.lock.read_chan());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers_coexist() {
        let lk = RwLock::new(3u32);
        let r1 = lk.read();
        let r2 = lk.read();
        assert_eq!(*r1 + *r2, 6);
        assert_eq!(lk.state_snapshot().0, 2);
        drop(r1);
        drop(r2);
        assert_eq!(lk.state_snapshot().0, 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let lk = RwLock::new(0u32);
        let mut w = lk.write();
        *w = 9;
        assert!(lk.try_read().is_none());
        assert!(lk.try_write().is_none());
        drop(w);
        assert_eq!(*lk.read(), 9);
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lk = RwLock::new(());
        // Simulate a queued writer; new readers must queue behind it
        {
            let mut st = lk.state.lock();
            st.waiting_writers = 1;
        }
        assert!(lk.try_read().is_none());
        {
            let mut st = lk.state.lock();
            st.waiting_writers = 0;
        }
        assert!(lk.try_read().is_some());
    }
}
