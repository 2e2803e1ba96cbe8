//! Sleeping locks: long-term locks for processes. A contender blocks via
//! `sleep` instead of spinning, so they may be held across whole I/O
//! operations (most prominently by inodes).
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::Spinlock;
use crate::proc::{current_pid, WaitChannel};

struct SleeplockInfo {
    /// Is the lock held?
    locked: bool,

    /// Process holding the lock, for debugging.
    pid: i32,
}

/// A sleep-lock that owns its data.
pub struct Sleeplock<T> {
    /// Spinlock protecting this sleep lock.
    lock: Spinlock<SleeplockInfo>,

    /// WaitChannel saying the lock was released.
    waitchannel: WaitChannel,

    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: Spinlock::new(name, SleeplockInfo {
                locked: false,
                pid: 0,
            }),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let mut guard = self.lock.lock();
        while guard.locked {
            // Contended; block until the holder releases. Only reachable
            // from process context.
            self.waitchannel.sleep(&mut guard);
        }
        guard.locked = true;
        guard.pid = current_pid();
        drop(guard);

        SleeplockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        guard.locked && guard.pid == current_pid()
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct SleeplockGuard<'s, T> {
    lock: &'s Sleeplock<T>,
    _marker: PhantomData<*const ()>,
}

impl<T> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.lock.lock();
        guard.locked = false;
        guard.pid = 0;
        self.lock.waitchannel.wakeup();
    }
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
